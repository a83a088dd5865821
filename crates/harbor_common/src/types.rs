use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, 0-based index of a backend in the cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for NodeId {
    fn from(v: usize) -> Self {
        NodeId(v)
    }
}

/// Serving status of a backend as seen by the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Not serving; candidate for online recovery.
    #[default]
    Down,
    /// Serving client traffic ("valid").
    Up,
    /// Detached by policy but not considered failed.
    Quarantined,
}

impl BackendStatus {
    pub fn is_up(self) -> bool {
        self == BackendStatus::Up
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Down => write!(f, "down"),
            BackendStatus::Up => write!(f, "up"),
            BackendStatus::Quarantined => write!(f, "quarantined"),
        }
    }
}
