//! Failover and recovery control plane: the backend directory, the cluster
//! control signal, the replication lag monitor and the online recovery
//! orchestrator, plus the administrative connection plumbing they share.

pub mod admin;
pub mod backend;
pub mod control;
pub mod diag_pool;
pub mod events;
pub mod fetch;
pub mod lag_monitor;
pub mod lsn;
pub mod recovery;
pub mod sim;
pub mod verify;

pub use admin::{AdminConnection, AdminConnector, ConnectTarget, PgAdminConnector, QueryResult};
pub use backend::{BackendDirectory, BackendNode};
pub use control::{
    ClusterControl, LocalControlPlane, RecoveryRequestState, RequestDetails, RequestKind,
    SupervisorEvent,
};
pub use diag_pool::DiagnosticConnectionPool;
pub use events::{ClusterEvent, ClusterEventLog, EventCategory, EventSeverity};
pub use fetch::{run_query, Probe};
pub use lag_monitor::{
    CycleReport, LagMonitorHandle, LagMonitorMetrics, MonitorExit, NodeReport,
    ReplicationLagMonitor, ServerVersionCache,
};
pub use lsn::{compute_lag, decode_lsn};
pub use recovery::{RecoveryLifecycle, RecoveryMetrics, RecoveryOrchestrator, RecoveryState};
pub use verify::{FalsePrimaryVerifier, NodeStatusVerifier, NodeVerdict};
