use std::fmt;

use thiserror::Error;

use crate::types::NodeId;

/// Convenience alias for `Result<T, HarborError>`.
pub type HarborResult<T> = Result<T, HarborError>;

/// Which half of the two-stage recovery protocol an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    /// Bulk copy while the cluster keeps serving.
    First,
    /// Delta copy while new client connections are held back.
    Second,
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStage::First => write!(f, "1st stage"),
            RecoveryStage::Second => write!(f, "2nd stage"),
        }
    }
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum HarborError {
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("LSN error: {0}")]
    Lsn(#[from] LsnError),

    /// Could not open an administrative connection.
    #[error("Connect error: {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// A statement failed on an open connection.
    #[error("Query error: {0}")]
    Query(String),

    #[error("Config error: {0}")]
    Config(String),

    /// The cluster control signal rejected a request.
    #[error("Control error: {0}")]
    Control(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarborError {
    /// Errors the lag monitor absorbs per node instead of failing the cycle.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            HarborError::Probe(_) | HarborError::Connect { .. } | HarborError::Query(_)
        )
    }
}

/// Failures of a single online recovery attempt. None of these are retried
/// automatically; the administrative caller must re-issue the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("backend node {0} is alive")]
    AlreadyUp(NodeId),

    #[error("backend node {0} does not exist")]
    NoSuchNode(NodeId),

    #[error("another recovery is already in progress")]
    InProgress,

    #[error("could not connect to primary node: {reason}")]
    PrimaryUnreachable { reason: String },

    #[error("CHECKPOINT failed before {stage}: {reason}")]
    CheckpointFailed { stage: RecoveryStage, reason: String },

    #[error("{stage} recovery command failed for node {node}: {reason}")]
    CopyStageFailed {
        stage: RecoveryStage,
        node: NodeId,
        reason: String,
    },

    #[error("timed out waiting for connections to close ({remaining} still active after {attempts} polls)")]
    QuiesceTimeout { remaining: usize, attempts: u32 },

    #[error("remote start failed for node {node}: {reason}")]
    RemoteStartFailed { node: NodeId, reason: String },

    #[error("node {node} did not accept connections after {attempts} attempts")]
    ReadinessTimeout { node: NodeId, attempts: u32 },

    #[error("failback request for node {node} was rejected: {reason}")]
    FailbackRejected { node: NodeId, reason: String },
}

impl RecoveryError {
    /// Short machine-friendly label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryError::AlreadyUp(_) => "already_up",
            RecoveryError::NoSuchNode(_) => "no_such_node",
            RecoveryError::InProgress => "in_progress",
            RecoveryError::PrimaryUnreachable { .. } => "primary_unreachable",
            RecoveryError::CheckpointFailed { .. } => "checkpoint_failed",
            RecoveryError::CopyStageFailed { .. } => "copy_stage_failed",
            RecoveryError::QuiesceTimeout { .. } => "quiesce_timeout",
            RecoveryError::RemoteStartFailed { .. } => "remote_start_failed",
            RecoveryError::ReadinessTimeout { .. } => "readiness_timeout",
            RecoveryError::FailbackRejected { .. } => "failback_rejected",
        }
    }
}

/// Soft, per-node failures observed by the lag monitor. The node's
/// contribution for the cycle becomes "unknown"; the cycle continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("no diagnostic connection for node {0}")]
    MissingConnection(NodeId),

    #[error("query failed on node {node}: {reason}")]
    QueryFailed { node: NodeId, reason: String },

    #[error("no result returned from node {0}")]
    NoResult(NodeId),

    #[error("no rows returned from node {0}")]
    NoRows(NodeId),
}

/// A textual log position could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LsnError {
    #[error("invalid LSN format: wrong log location format: {0:?}")]
    InvalidFormat(String),
}
