//! Online recovery: the staged protocol that returns a down backend to
//! service, its state machine, and the statements it issues.

mod orchestrator;
pub mod sql;
mod state;

pub use orchestrator::{RecoveryMetrics, RecoveryMetricsSnapshot, RecoveryOrchestrator};
pub use state::{transition, RecoveryLifecycle, RecoveryState, StepOutcome};
