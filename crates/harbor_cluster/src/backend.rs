//! Backend directory: the shared registry of backend node descriptors.
//!
//! Read by the routing layer, mutated by the lag monitor (replication
//! fields) and the control plane (status). Each accessor takes the lock
//! for a single read or write, so individual fields change atomically but
//! a sequence of calls is not a transaction.

use parking_lot::RwLock;

use harbor_common::config::BackendConfig;
use harbor_common::{BackendStatus, NodeId};

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendNode {
    pub id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub data_directory: String,
    pub application_name: String,
    pub status: BackendStatus,
    /// `pg_stat_replication.state` as last reported by the primary (e.g. "streaming").
    pub replication_state: String,
    /// `pg_stat_replication.sync_state` (e.g. "sync", "async").
    pub replication_sync_state: String,
    /// WAL bytes behind the primary. Always 0 for the primary.
    pub standby_delay: u64,
}

impl BackendNode {
    pub fn from_config(id: NodeId, cfg: &BackendConfig) -> Self {
        Self {
            id,
            hostname: cfg.hostname.clone(),
            port: cfg.port,
            data_directory: cfg.data_directory.clone(),
            application_name: cfg.application_name.clone(),
            status: cfg.status,
            replication_state: String::new(),
            replication_sync_state: String::new(),
            standby_delay: 0,
        }
    }

    /// Host to connect to; an empty hostname means the local machine.
    pub fn connect_host(&self) -> &str {
        if self.hostname.is_empty() {
            "localhost"
        } else {
            &self.hostname
        }
    }

    pub fn is_up(&self) -> bool {
        self.status.is_up()
    }
}

struct DirectoryInner {
    nodes: Vec<BackendNode>,
    primary: Option<NodeId>,
}

/// Registry of every configured backend. Nodes are never removed; a failed
/// node is marked down or quarantined.
pub struct BackendDirectory {
    inner: RwLock<DirectoryInner>,
}

impl BackendDirectory {
    pub fn new(nodes: Vec<BackendNode>, primary: Option<NodeId>) -> Self {
        let primary = primary.filter(|p| p.index() < nodes.len());
        Self {
            inner: RwLock::new(DirectoryInner { nodes, primary }),
        }
    }

    pub fn from_config(backends: &[BackendConfig], primary: Option<NodeId>) -> Self {
        let nodes = backends
            .iter()
            .enumerate()
            .map(|(i, cfg)| BackendNode::from_config(NodeId(i), cfg))
            .collect();
        Self::new(nodes, primary)
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.len()).map(NodeId).collect()
    }

    /// Copy of a node descriptor.
    pub fn node(&self, id: NodeId) -> Option<BackendNode> {
        self.inner.read().nodes.get(id.index()).cloned()
    }

    pub fn snapshot(&self) -> Vec<BackendNode> {
        self.inner.read().nodes.clone()
    }

    pub fn status(&self, id: NodeId) -> Option<BackendStatus> {
        self.inner.read().nodes.get(id.index()).map(|n| n.status)
    }

    pub fn is_up(&self, id: NodeId) -> bool {
        self.status(id).is_some_and(BackendStatus::is_up)
    }

    /// Returns the previous status, or `None` if the id is unknown.
    pub fn set_status(&self, id: NodeId, status: BackendStatus) -> Option<BackendStatus> {
        let mut inner = self.inner.write();
        let node = inner.nodes.get_mut(id.index())?;
        let prev = node.status;
        node.status = status;
        if prev != status {
            tracing::info!(node_id = id.0, from = %prev, to = %status, "backend status changed");
        }
        Some(prev)
    }

    /// Take `id` out of the serving set if it is up, clearing the primary
    /// designation if it held it. Status check and update happen under one
    /// write lock. Returns the status found, or `None` if the id is unknown.
    pub fn mark_down_if_up(&self, id: NodeId) -> Option<BackendStatus> {
        let mut inner = self.inner.write();
        let node = inner.nodes.get_mut(id.index())?;
        let prev = node.status;
        if prev != BackendStatus::Up {
            return Some(prev);
        }
        node.status = BackendStatus::Down;
        if inner.primary == Some(id) {
            inner.primary = None;
        }
        tracing::info!(node_id = id.0, from = %prev, to = %BackendStatus::Down, "backend status changed");
        Some(prev)
    }

    pub fn up_nodes(&self) -> Vec<NodeId> {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|n| n.is_up())
            .map(|n| n.id)
            .collect()
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.inner.read().primary
    }

    /// Designate the primary. Out-of-range ids clear the designation.
    pub fn set_primary(&self, primary: Option<NodeId>) {
        let mut inner = self.inner.write();
        let len = inner.nodes.len();
        inner.primary = primary.filter(|p| p.index() < len);
    }

    pub fn set_replication_state(&self, id: NodeId, state: &str, sync_state: &str) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.get_mut(id.index()) {
            node.replication_state = state.to_string();
            node.replication_sync_state = sync_state.to_string();
        }
    }

    /// Blank every node's replication state fields.
    pub fn clear_replication_states(&self) {
        let mut inner = self.inner.write();
        for node in inner.nodes.iter_mut() {
            node.replication_state.clear();
            node.replication_sync_state.clear();
        }
    }

    pub fn set_standby_delay(&self, id: NodeId, delay: u64) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.get_mut(id.index()) {
            node.standby_delay = delay;
        }
    }
}
