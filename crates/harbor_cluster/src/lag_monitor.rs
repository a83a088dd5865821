//! Replication lag monitor ("streaming replication check").
//!
//! A long-lived worker that, once per period:
//! 1. opens a diagnostic connection to every up node that lacks one,
//! 2. samples the primary's write position and every standby's replay
//!    position, correlates `pg_stat_replication` rows with the standbys and
//!    writes lag and state back into the `BackendDirectory`,
//! 3. asks the node-status verifier for inconsistent nodes and requests
//!    their degeneration when policy allows,
//! 4. closes every diagnostic connection, whatever happened above.
//!
//! Per-node failures are soft: the node is "unknown" for the cycle and the
//! others proceed. Anything else aborts the cycle, which is retried after
//! the normal period. Reload/restart/shutdown requests are honoured only at
//! the top of the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harbor_common::config::{ConfigSource, HarborConfig};
use harbor_common::signal::{WorkerRequest, WorkerSignal};
use harbor_common::{HarborError, NodeId, ProbeError};

use crate::admin::AdminConnector;
use crate::backend::BackendDirectory;
use crate::control::{ClusterControl, RequestDetails};
use crate::diag_pool::DiagnosticConnectionPool;
use crate::fetch::{fetch_scalar, note_probe_failure, run_query, Probe};
use crate::lsn::{compute_lag, decode_lsn};
use crate::verify::{NodeStatusVerifier, NodeVerdict};

pub const VERSION_SQL: &str = "SELECT current_setting('server_version_num')";

/// First version with the `wal`/`lsn` function names.
pub const PG10_VERSION: u32 = 100_000;
/// First version with `pg_stat_replication`.
pub const PG91_VERSION: u32 = 90_100;

pub fn primary_position_sql(version: u32) -> &'static str {
    if version >= PG10_VERSION {
        "SELECT pg_current_wal_lsn()"
    } else {
        "SELECT pg_current_xlog_location()"
    }
}

pub fn standby_position_sql(version: u32) -> &'static str {
    if version >= PG10_VERSION {
        "SELECT pg_last_wal_replay_lsn()"
    } else {
        "SELECT pg_last_xlog_replay_location()"
    }
}

/// `None` for servers without `pg_stat_replication`. 9.1 lacks `sync_state`.
pub fn replication_status_sql(version: u32) -> Option<&'static str> {
    match version {
        v if v > PG91_VERSION => {
            Some("SELECT application_name, state, sync_state FROM pg_stat_replication")
        }
        PG91_VERSION => {
            Some("SELECT application_name, state, '' AS sync_state FROM pg_stat_replication")
        }
        _ => None,
    }
}

/// Per-node `server_version_num`, fetched once and kept for the lifetime
/// of the worker.
#[derive(Debug, Clone, Default)]
pub struct ServerVersionCache {
    versions: Vec<Option<u32>>,
}

impl ServerVersionCache {
    pub fn new(node_count: usize) -> Self {
        Self {
            versions: vec![None; node_count],
        }
    }

    pub fn cached(&self, id: NodeId) -> Option<u32> {
        self.versions.get(id.index()).copied().flatten()
    }

    /// Cached version, 0 when unknown.
    pub fn get(&self, id: NodeId) -> u32 {
        self.cached(id).unwrap_or(0)
    }

    pub fn set(&mut self, id: NodeId, version: u32) {
        if id.index() >= self.versions.len() {
            self.versions.resize(id.index() + 1, None);
        }
        self.versions[id.index()] = Some(version);
    }
}

/// Outcome for one up node in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node: NodeId,
    /// Decoded log position.
    pub position: Probe<u64>,
    /// Bytes behind the primary; `Ok(0)` for the primary itself.
    pub lag: Probe<u64>,
}

/// What one monitor cycle observed and did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub connections_opened: usize,
    /// False when lag checking was skipped (single node or no primary).
    pub lag_checked: bool,
    pub nodes: Vec<NodeReport>,
    /// Rows returned by the replication status query.
    pub replication_status: Option<Probe<usize>>,
    pub verdicts: Vec<NodeVerdict>,
    pub degenerated: Vec<NodeId>,
}

impl CycleReport {
    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node == id)
    }

    pub fn probe_failures(&self) -> usize {
        let status = usize::from(matches!(self.replication_status, Some(Probe::Failed(_))));
        self.nodes.iter().filter(|n| n.position.is_failed()).count() + status
    }
}

/// Counters for the monitor worker.
#[derive(Debug, Default)]
pub struct LagMonitorMetrics {
    pub cycles_ok: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub probe_failures: AtomicU64,
    pub degeneration_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagMonitorMetricsSnapshot {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub probe_failures: u64,
    pub degeneration_requests: u64,
}

impl LagMonitorMetrics {
    pub fn snapshot(&self) -> LagMonitorMetricsSnapshot {
        LagMonitorMetricsSnapshot {
            cycles_ok: self.cycles_ok.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            degeneration_requests: self.degeneration_requests.load(Ordering::Relaxed),
        }
    }
}

/// Why the worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Shutdown,
    /// The supervisor should start a fresh worker.
    Restart,
}

pub struct ReplicationLagMonitor {
    config: HarborConfig,
    source: Arc<dyn ConfigSource>,
    directory: Arc<BackendDirectory>,
    control: Arc<dyn ClusterControl>,
    verifier: Arc<dyn NodeStatusVerifier>,
    pool: DiagnosticConnectionPool,
    versions: ServerVersionCache,
    metrics: Arc<LagMonitorMetrics>,
}

impl ReplicationLagMonitor {
    pub fn new(
        config: HarborConfig,
        source: Arc<dyn ConfigSource>,
        directory: Arc<BackendDirectory>,
        control: Arc<dyn ClusterControl>,
        connector: Arc<dyn AdminConnector>,
        verifier: Arc<dyn NodeStatusVerifier>,
    ) -> Self {
        let node_count = directory.len();
        Self {
            config,
            source,
            directory,
            control,
            verifier,
            pool: DiagnosticConnectionPool::new(connector, node_count),
            versions: ServerVersionCache::new(node_count),
            metrics: Arc::new(LagMonitorMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<LagMonitorMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &HarborConfig {
        &self.config
    }

    pub fn versions(&self) -> &ServerVersionCache {
        &self.versions
    }

    /// Whether lag and status work runs at all.
    pub fn checking_enabled(&self) -> bool {
        self.config.cluster.mode.is_streaming() && self.config.sr_check.period_secs > 0
    }

    /// Pause between loop iterations: the check period, or the fixed idle
    /// sleep when the period is zero.
    pub fn sleep_interval(&self) -> Duration {
        if self.config.sr_check.period_secs == 0 {
            self.config.sr_check.idle_sleep()
        } else {
            self.config.sr_check.period()
        }
    }

    /// Run cycles until a restart or shutdown request arrives.
    pub async fn run(&mut self, signal: WorkerSignal) -> MonitorExit {
        tracing::info!(
            period_secs = self.config.sr_check.period_secs,
            nodes = self.directory.len(),
            "replication lag monitor started"
        );
        loop {
            match signal.take_request() {
                Some(WorkerRequest::Shutdown) => {
                    tracing::info!("replication lag monitor stopped");
                    return MonitorExit::Shutdown;
                }
                Some(WorkerRequest::Restart) => {
                    tracing::info!("replication lag monitor restarting");
                    return MonitorExit::Restart;
                }
                Some(WorkerRequest::Reload) => self.reload(),
                None => {}
            }

            if !self.checking_enabled() {
                signal.sleep(self.sleep_interval()).await;
                continue;
            }

            match self.run_cycle().await {
                Ok(report) => {
                    self.metrics.cycles_ok.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .probe_failures
                        .fetch_add(report.probe_failures() as u64, Ordering::Relaxed);
                    harbor_observability::record_monitor_cycle(true);
                }
                Err(e) => {
                    self.metrics.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    harbor_observability::record_monitor_cycle(false);
                    if e.is_soft() {
                        tracing::warn!(error = %e, "replication check cycle failed");
                    } else {
                        tracing::error!(error = %e, "replication check cycle failed");
                    }
                }
            }
            signal.sleep(self.sleep_interval()).await;
        }
    }

    /// Spawn `run` on the current tokio runtime.
    pub fn spawn(mut self, signal: WorkerSignal) -> LagMonitorHandle {
        let metrics = self.metrics.clone();
        let worker_signal = signal.clone();
        let join = tokio::spawn(async move { self.run(worker_signal).await });
        LagMonitorHandle {
            signal,
            join,
            metrics,
        }
    }

    /// One full cycle. Diagnostic connections are always closed before
    /// returning.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, HarborError> {
        let mut report = CycleReport::default();
        let result = self.cycle_body(&mut report).await;
        self.pool.discard_all().await;
        result.map(|()| report)
    }

    async fn cycle_body(&mut self, report: &mut CycleReport) -> Result<(), HarborError> {
        report.connections_opened = self
            .pool
            .establish(&self.directory, &self.config.sr_check)
            .await;
        self.check_replication_delay(report).await?;
        self.verify_node_status(report).await;
        Ok(())
    }

    async fn check_replication_delay(&mut self, report: &mut CycleReport) -> Result<(), HarborError> {
        self.directory.clear_replication_states();

        let node_count = self.directory.len();
        let primary = match self.directory.primary() {
            Some(p) if node_count >= 2 => p,
            _ => {
                tracing::debug!(node_count, "skipping replication delay check");
                return Ok(());
            }
        };
        report.lag_checked = true;

        self.refresh_versions().await;

        let mut positions: Vec<Probe<u64>> = vec![Probe::Unknown; node_count];
        for id in self.directory.node_ids() {
            if !self.directory.is_up(id) {
                continue;
            }
            let version = self.versions.get(id);
            let sql = if id == primary {
                primary_position_sql(version)
            } else {
                standby_position_sql(version)
            };
            positions[id.index()] = self.sample_position(id, sql).await?;
        }

        self.correlate_replication_status(primary, report).await;

        let primary_position = positions[primary.index()].ok().copied();
        for id in self.directory.node_ids() {
            if !self.directory.is_up(id) {
                continue;
            }
            let position = positions[id.index()].clone();
            let lag = if id == primary {
                Probe::Ok(0)
            } else {
                match (primary_position, position.ok()) {
                    (Some(p), Some(&s)) => Probe::Ok(compute_lag(p, s)),
                    _ => Probe::Unknown,
                }
            };

            let delay = lag.ok().copied().unwrap_or(0);
            self.directory.set_standby_delay(id, delay);
            harbor_observability::record_standby_delay(id.0, delay);
            if id != primary && lag.is_ok() && self.config.sr_check.should_log_delay(delay) {
                tracing::info!(
                    node_id = id.0,
                    lag_bytes = delay,
                    primary = primary.0,
                    "Replication of node:{} is behind {} bytes from the primary server (node:{})",
                    id.0,
                    delay,
                    primary.0
                );
            }
            report.nodes.push(NodeReport {
                node: id,
                position,
                lag,
            });
        }
        Ok(())
    }

    /// Cache `server_version_num` for every up node that lacks it.
    async fn refresh_versions(&mut self) {
        for id in self.directory.up_nodes() {
            if self.versions.cached(id).is_some() {
                continue;
            }
            let Ok(conn) = self.pool.conn(id) else {
                continue;
            };
            match fetch_scalar(conn, id, VERSION_SQL).await {
                Ok(Some(text)) => match text.trim().parse::<u32>() {
                    Ok(v) => {
                        tracing::debug!(node_id = id.0, version = v, "cached server version");
                        self.versions.set(id, v);
                    }
                    Err(_) => {
                        tracing::warn!(node_id = id.0, value = %text, "unparsable server_version_num");
                    }
                },
                // Already logged; retried next cycle.
                Ok(None) | Err(_) => {}
            }
        }
    }

    /// A node's position for this cycle. Soft failures become `Failed`, a
    /// NULL becomes `Unknown`; a malformed position aborts the cycle.
    async fn sample_position(&mut self, id: NodeId, sql: &str) -> Result<Probe<u64>, HarborError> {
        let conn = match self.pool.conn(id) {
            Ok(conn) => conn,
            Err(e) => {
                note_probe_failure(&e, id);
                return Ok(Probe::Failed(e));
            }
        };
        match fetch_scalar(conn, id, sql).await {
            Ok(Some(text)) => Ok(Probe::Ok(decode_lsn(&text)?)),
            Ok(None) => {
                tracing::debug!(node_id = id.0, "log position is NULL");
                Ok(Probe::Unknown)
            }
            Err(e) => Ok(Probe::Failed(e)),
        }
    }

    /// Copy `pg_stat_replication` state onto the standbys it names. The
    /// caller has already blanked every node's state for this cycle.
    async fn correlate_replication_status(&mut self, primary: NodeId, report: &mut CycleReport) {
        let Some(sql) = replication_status_sql(self.versions.get(primary)) else {
            return;
        };
        let conn = match self.pool.conn(primary) {
            Ok(conn) => conn,
            Err(e) => {
                report.replication_status = Some(Probe::Failed(e));
                return;
            }
        };
        let result = match run_query(conn, primary, sql).await {
            Ok(result) => result,
            Err(ProbeError::NoRows(_)) => {
                report.replication_status = Some(Probe::Ok(0));
                return;
            }
            Err(e) => {
                report.replication_status = Some(Probe::Failed(e));
                return;
            }
        };

        let nodes = self.directory.snapshot();
        for row in 0..result.num_rows() {
            let Some(app) = result.value(row, 0) else {
                continue;
            };
            let state = result.value(row, 1).unwrap_or("");
            let sync_state = result.value(row, 2).unwrap_or("");
            for node in nodes
                .iter()
                .filter(|n| n.id != primary && n.application_name == app)
            {
                self.directory.set_replication_state(node.id, state, sync_state);
            }
        }
        report.replication_status = Some(Probe::Ok(result.num_rows()));
    }

    async fn verify_node_status(&mut self, report: &mut CycleReport) {
        let verdicts = self.verifier.verify(&mut self.pool, &self.directory).await;

        for (i, verdict) in verdicts.iter().enumerate() {
            if *verdict != NodeVerdict::Invalid {
                continue;
            }
            let node = NodeId(i);
            if !self.config.cluster.detach_false_primary {
                tracing::warn!(node_id = node.0, "node status is invalid, auto detach is disabled");
                continue;
            }
            tracing::warn!(node_id = node.0, "node status is invalid, requesting degeneration");
            self.metrics
                .degeneration_requests
                .fetch_add(1, Ordering::Relaxed);
            match self.control.degenerate_backends(
                &[node],
                RequestDetails::SWITCHOVER | RequestDetails::CONFIRMED,
            ) {
                Ok(()) => {
                    harbor_observability::record_degeneration_request(node.0, true);
                    report.degenerated.push(node);
                }
                Err(e) => {
                    harbor_observability::record_degeneration_request(node.0, false);
                    tracing::warn!(node_id = node.0, error = %e, "degeneration request failed");
                }
            }
        }
        report.verdicts = verdicts;
    }

    /// Re-read configuration. The backend list itself needs a restart.
    fn reload(&mut self) {
        match self.source.load() {
            Ok(config) => {
                if self.config.backends_changed(&config) {
                    tracing::warn!(
                        configured = config.backends.len(),
                        running = self.directory.len(),
                        "backend list changed, send a restart request to apply it"
                    );
                }
                if config.cluster.enable_pool_hba {
                    self.control.request_hba_reload(&config.cluster.pool_hba_file);
                }
                self.config = config;
                tracing::info!("replication lag monitor reloaded configuration");
            }
            Err(e) => {
                tracing::warn!(error = %e, "reload failed, keeping current configuration");
            }
        }
    }
}

/// Handle to a spawned monitor worker.
pub struct LagMonitorHandle {
    signal: WorkerSignal,
    join: tokio::task::JoinHandle<MonitorExit>,
    pub metrics: Arc<LagMonitorMetrics>,
}

impl LagMonitorHandle {
    pub fn signal(&self) -> &WorkerSignal {
        &self.signal
    }

    pub fn stop(&self) {
        self.signal.request(WorkerRequest::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<MonitorExit, HarborError> {
        self.join
            .await
            .map_err(|e| HarborError::Internal(format!("lag monitor task failed: {}", e)))
    }
}
