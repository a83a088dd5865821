//! Shared vocabulary for the harbor control plane: node identifiers, the
//! error taxonomy, the configuration model, and the worker signal used by
//! long-lived background loops.

pub mod config;
pub mod error;
pub mod signal;
pub mod types;

pub use error::{HarborError, HarborResult, LsnError, ProbeError, RecoveryError, RecoveryStage};
pub use types::{BackendStatus, NodeId};
