//! Online recovery orchestrator.
//!
//! Brings a down backend back into the cluster without stopping traffic to
//! the healthy nodes:
//!
//! 1. CHECKPOINT on the primary, then the first-stage copy script (bulk
//!    base copy while the cluster keeps serving).
//! 2. Raise `recovery_in_progress` and wait for client connections to drain.
//! 3. A second CHECKPOINT and the second-stage script (WAL delta only).
//! 4. Remote start of the target, then poll until it accepts connections.
//! 5. Failback: the routing layer puts the node back in service.
//!
//! Every step runs strictly after the previous one succeeded. The first
//! failure aborts the attempt and leaves the target down; the
//! administrative connection to the primary is closed on every path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use harbor_common::config::RecoveryConfig;
use harbor_common::{NodeId, RecoveryError, RecoveryStage};

use crate::admin::{AdminConnection, AdminConnector, ConnectTarget};
use crate::backend::{BackendDirectory, BackendNode};
use crate::control::{ClusterControl, RequestKind};
use crate::events::ClusterEventLog;

use super::sql;
use super::state::{RecoveryLifecycle, RecoveryState, StepOutcome};

/// Counters for recovery attempts on this orchestrator.
#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    pub attempts: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    /// Refused before any backend was contacted (already up, unknown node,
    /// another attempt running).
    pub rejected: AtomicU64,
    pub last_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryMetricsSnapshot {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub last_duration_ms: u64,
}

impl RecoveryMetrics {
    pub fn snapshot(&self) -> RecoveryMetricsSnapshot {
        RecoveryMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Clears the busy flag when an attempt ends, however it ends.
struct AttemptGuard<'a>(&'a AtomicBool);

impl<'a> AttemptGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| AttemptGuard(flag))
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How one call ended, for the top-level failure handler.
struct Attempt {
    result: Result<(), RecoveryError>,
    /// Got past its preconditions and announced itself.
    announced: bool,
    /// Raised `recovery_in_progress` during the protocol.
    held_traffic: bool,
}

impl Attempt {
    fn rejected(error: RecoveryError) -> Self {
        Self {
            result: Err(error),
            announced: false,
            held_traffic: false,
        }
    }
}

pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    directory: Arc<BackendDirectory>,
    control: Arc<dyn ClusterControl>,
    connector: Arc<dyn AdminConnector>,
    events: Arc<ClusterEventLog>,
    metrics: Arc<RecoveryMetrics>,
    busy: AtomicBool,
    last_attempt: Mutex<Option<RecoveryLifecycle>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: RecoveryConfig,
        directory: Arc<BackendDirectory>,
        control: Arc<dyn ClusterControl>,
        connector: Arc<dyn AdminConnector>,
        events: Arc<ClusterEventLog>,
    ) -> Self {
        Self {
            config,
            directory,
            control,
            connector,
            events,
            metrics: Arc::new(RecoveryMetrics::default()),
            busy: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<RecoveryMetrics> {
        self.metrics.clone()
    }

    /// Lifecycle of the most recent attempt that got past its preconditions.
    pub fn last_attempt(&self) -> Option<RecoveryLifecycle> {
        self.last_attempt.lock().clone()
    }

    /// Administrative entry point: run the protocol and settle the shared
    /// flags whichever way it ends.
    ///
    /// On success the recovery is finished (`finish_recovery`). On failure
    /// the request kind is reset and `recovery_in_progress` is cleared, but
    /// only for an attempt that got past its preconditions and raised them
    /// itself; a refused call never touches another attempt's traffic hold.
    pub async fn recover_node(&self, node: NodeId) -> Result<(), RecoveryError> {
        let attempt = self.attempt(node).await;
        match attempt.result {
            Ok(()) => {
                self.finish_recovery();
                Ok(())
            }
            Err(e) => {
                if attempt.held_traffic {
                    tracing::info!(node_id = node.0, "clearing recovery flag after failed recovery");
                    self.control.set_recovery_in_progress(false);
                }
                if attempt.announced {
                    self.control.announce(RequestKind::Idle);
                }
                Err(e)
            }
        }
    }

    /// Run the recovery protocol for `node`.
    ///
    /// Fails with `AlreadyUp` without contacting any backend if the node is
    /// serving. On a failure after stage 1, `recovery_in_progress` is left
    /// set for the caller to clear.
    pub async fn start_recovery(&self, node: NodeId) -> Result<(), RecoveryError> {
        self.attempt(node).await.result
    }

    async fn attempt(&self, node: NodeId) -> Attempt {
        let target = match self.check_preconditions(node) {
            Ok(target) => target,
            Err(e) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                harbor_observability::record_recovery_outcome(node.0, e.label(), 0);
                return Attempt::rejected(e);
            }
        };
        let Some(_guard) = AttemptGuard::acquire(&self.busy) else {
            tracing::warn!(node_id = node.0, "recovery rejected: another attempt is running");
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            harbor_observability::record_recovery_outcome(node.0, "in_progress", 0);
            return Attempt::rejected(RecoveryError::InProgress);
        };

        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut lifecycle = RecoveryLifecycle::new(node);

        let result = self.run_protocol(&target, &mut lifecycle).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.last_duration_ms.store(elapsed_ms, Ordering::Relaxed);
        let held_traffic = match &result {
            Ok(()) => {
                self.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                harbor_observability::record_recovery_outcome(node.0, "ok", elapsed_ms);
                tracing::info!(node_id = node.0, elapsed_ms, "recovery done");
                true
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                harbor_observability::record_recovery_outcome(node.0, e.label(), elapsed_ms);
                tracing::error!(node_id = node.0, elapsed_ms, error = %e, "recovery failed");
                lifecycle.failed_in().is_some_and(RecoveryState::holds_traffic)
            }
        };
        *self.last_attempt.lock() = Some(lifecycle);
        Attempt {
            result,
            announced: true,
            held_traffic,
        }
    }

    /// Terminal step once failback has propagated: drop the traffic hold and
    /// tell the supervisor.
    pub fn finish_recovery(&self) {
        self.control.set_recovery_in_progress(false);
        self.control.announce(RequestKind::Idle);
        self.control.notify_recovery_finished();
        tracing::info!("recovery finished");
    }

    fn check_preconditions(&self, node: NodeId) -> Result<BackendNode, RecoveryError> {
        let target = self
            .directory
            .node(node)
            .ok_or(RecoveryError::NoSuchNode(node))?;
        if target.is_up() {
            tracing::warn!(node_id = node.0, "recovery rejected: backend node is alive");
            return Err(RecoveryError::AlreadyUp(node));
        }
        if self.control.recovery_in_progress() {
            tracing::warn!(node_id = node.0, "recovery rejected: recovery flag already set");
            return Err(RecoveryError::InProgress);
        }
        Ok(target)
    }

    async fn run_protocol(
        &self,
        target: &BackendNode,
        lifecycle: &mut RecoveryLifecycle,
    ) -> Result<(), RecoveryError> {
        self.control.announce(RequestKind::NodeRecovery);
        tracing::info!(node_id = target.id.0, host = %target.connect_host(), "starting online recovery");

        let primary = self.connect_primary().await;
        let mut conn = self.record_step(lifecycle, primary)?;

        let result = self.run_primary_steps(target, conn.as_mut(), lifecycle).await;
        conn.close().await;
        result?;

        let failback = self.failback(target.id).await;
        self.record_step(lifecycle, failback)
    }

    /// Steps that need the primary connection, through readiness.
    async fn run_primary_steps(
        &self,
        target: &BackendNode,
        conn: &mut dyn AdminConnection,
        lifecycle: &mut RecoveryLifecycle,
    ) -> Result<(), RecoveryError> {
        let r = self.checkpoint(conn, RecoveryStage::First).await;
        self.record_step(lifecycle, r)?;

        let r = self
            .copy_stage(conn, target, RecoveryStage::First, &self.config.first_stage_command)
            .await;
        self.record_step(lifecycle, r)?;
        tracing::info!(node_id = target.id.0, "1st stage is done");

        self.control.set_recovery_in_progress(true);
        tracing::info!(node_id = target.id.0, "starting 2nd stage");

        let r = self.wait_connections_closed().await;
        self.record_step(lifecycle, r)?;

        let r = self.checkpoint(conn, RecoveryStage::Second).await;
        self.record_step(lifecycle, r)?;

        let r = self
            .copy_stage(conn, target, RecoveryStage::Second, &self.config.second_stage_command)
            .await;
        self.record_step(lifecycle, r)?;

        let r = self.remote_start(conn, target).await;
        self.record_step(lifecycle, r)?;

        let r = self.wait_node_ready(target).await;
        self.record_step(lifecycle, r)?;
        tracing::info!(node_id = target.id.0, "2nd stage is done");
        Ok(())
    }

    fn record_step<T>(
        &self,
        lifecycle: &mut RecoveryLifecycle,
        result: Result<T, RecoveryError>,
    ) -> Result<T, RecoveryError> {
        match &result {
            Ok(_) => {
                lifecycle.advance(StepOutcome::Succeeded, &self.events);
            }
            Err(e) => {
                tracing::error!(
                    node_id = lifecycle.node_id.0,
                    state = %lifecycle.state,
                    error = %e,
                    "recovery step failed"
                );
                lifecycle.fail(&e.to_string(), &self.events);
            }
        }
        result
    }

    fn target_for(&self, node: &BackendNode) -> ConnectTarget {
        ConnectTarget {
            host: node.connect_host().to_string(),
            port: node.port,
            database: self.config.database.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
        }
    }

    async fn connect_primary(&self) -> Result<Box<dyn AdminConnection>, RecoveryError> {
        let primary = self
            .directory
            .primary()
            .and_then(|id| self.directory.node(id))
            .ok_or_else(|| RecoveryError::PrimaryUnreachable {
                reason: "no primary node is designated".into(),
            })?;
        self.connector
            .connect(&self.target_for(&primary))
            .await
            .map_err(|e| RecoveryError::PrimaryUnreachable {
                reason: e.to_string(),
            })
    }

    async fn checkpoint(
        &self,
        conn: &mut dyn AdminConnection,
        stage: RecoveryStage,
    ) -> Result<(), RecoveryError> {
        tracing::info!(stage = %stage, "executing CHECKPOINT on primary");
        conn.simple_query(sql::CHECKPOINT)
            .await
            .map(|_| ())
            .map_err(|e| RecoveryError::CheckpointFailed {
                stage,
                reason: e.to_string(),
            })
    }

    /// Run a copy script through the recovery function. An empty script is
    /// skipped so the stage can be driven externally.
    async fn copy_stage(
        &self,
        conn: &mut dyn AdminConnection,
        target: &BackendNode,
        stage: RecoveryStage,
        script: &str,
    ) -> Result<(), RecoveryError> {
        if script.is_empty() {
            tracing::debug!(node_id = target.id.0, stage = %stage, "no recovery command configured, skipping");
            return Ok(());
        }
        let statement = sql::recovery_call(
            &self.config.recovery_function,
            script,
            target.connect_host(),
            &target.data_directory,
        );
        tracing::info!(node_id = target.id.0, stage = %stage, script, "executing recovery command");
        let failed = |reason: String| RecoveryError::CopyStageFailed {
            stage,
            node: target.id,
            reason,
        };
        match conn.simple_query(&statement).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(failed("recovery function returned no result".into())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    async fn remote_start(
        &self,
        conn: &mut dyn AdminConnection,
        target: &BackendNode,
    ) -> Result<(), RecoveryError> {
        let statement = sql::remote_start_call(
            &self.config.remote_start_function,
            target.connect_host(),
            &target.data_directory,
        );
        tracing::info!(node_id = target.id.0, "starting remote postmaster");
        let failed = |reason: String| RecoveryError::RemoteStartFailed {
            node: target.id,
            reason,
        };
        match conn.simple_query(&statement).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(failed("remote start function returned no result".into())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    /// Poll the active connection count until it reaches zero.
    async fn wait_connections_closed(&self) -> Result<(), RecoveryError> {
        let attempts = self.config.poll_attempts.max(1);
        let mut remaining = 0;
        for attempt in 1..=attempts {
            remaining = self.control.active_connection_count();
            if remaining == 0 {
                tracing::info!(attempt, "all client connections closed");
                return Ok(());
            }
            tracing::debug!(attempt, remaining, "waiting for client connections to close");
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        Err(RecoveryError::QuiesceTimeout {
            remaining,
            attempts,
        })
    }

    /// Trial logins to the target until one succeeds.
    async fn wait_node_ready(&self, target: &BackendNode) -> Result<(), RecoveryError> {
        let attempts = self.config.poll_attempts.max(1);
        let login = self.target_for(target);
        for attempt in 1..=attempts {
            match self.connector.connect(&login).await {
                Ok(conn) => {
                    conn.close().await;
                    tracing::info!(node_id = target.id.0, attempt, "node accepts connections");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(node_id = target.id.0, attempt, "node not ready: {}", e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        Err(RecoveryError::ReadinessTimeout {
            node: target.id,
            attempts,
        })
    }

    async fn failback(&self, node: NodeId) -> Result<(), RecoveryError> {
        self.control
            .send_failback_request(node)
            .map_err(|e| RecoveryError::FailbackRejected {
                node,
                reason: e.to_string(),
            })?;
        self.control.wait_failback_complete(node).await;
        Ok(())
    }
}
