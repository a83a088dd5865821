#![allow(dead_code, unused_imports)]

pub use std::sync::Arc;
pub use std::time::Duration;

pub use harbor_cluster::sim::{SimCall, SimCluster, SimReply};
pub use harbor_cluster::*;
pub use harbor_common::config::{BackendConfig, HarborConfig, StaticSource};
pub use harbor_common::{BackendStatus, NodeId, RecoveryError};

pub const PG_VERSION: &str = "150004";

/// Three backends `db0..db2` on a simulated cluster, `db0` primary.
pub struct Harness {
    pub config: HarborConfig,
    pub sim: SimCluster,
    pub directory: Arc<BackendDirectory>,
    pub state: Arc<RecoveryRequestState>,
    pub events: Arc<ClusterEventLog>,
    pub control: Arc<LocalControlPlane>,
}

pub fn backend(host: &str, status: BackendStatus) -> BackendConfig {
    BackendConfig {
        hostname: host.to_string(),
        port: 5432,
        data_directory: format!("/var/lib/pg/{}", host),
        application_name: host.to_string(),
        status,
    }
}

impl Harness {
    pub fn new(statuses: [BackendStatus; 3]) -> Self {
        let mut config = HarborConfig::default();
        config.backends = vec![
            backend("db0", statuses[0]),
            backend("db1", statuses[1]),
            backend("db2", statuses[2]),
        ];
        config.cluster.primary_node = Some(NodeId(0));
        Self::with_config(config)
    }

    pub fn with_config(config: HarborConfig) -> Self {
        let directory = Arc::new(BackendDirectory::from_config(
            &config.backends,
            config.cluster.primary_node,
        ));
        let state = RecoveryRequestState::new();
        let events = ClusterEventLog::new(256);
        let control = Arc::new(LocalControlPlane::new(
            directory.clone(),
            state.clone(),
            events.clone(),
        ));
        Self {
            config,
            sim: SimCluster::new(),
            directory,
            state,
            events,
            control,
        }
    }

    pub fn monitor(&self) -> ReplicationLagMonitor {
        ReplicationLagMonitor::new(
            self.config.clone(),
            Arc::new(StaticSource(self.config.clone())),
            self.directory.clone(),
            self.control.clone(),
            Arc::new(self.sim.clone()),
            Arc::new(FalsePrimaryVerifier),
        )
    }

    pub fn orchestrator(&self) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(
            self.config.recovery.clone(),
            self.directory.clone(),
            self.control.clone(),
            Arc::new(self.sim.clone()),
            self.events.clone(),
        )
    }

    /// A reachable PostgreSQL 15 host reporting `position` and recovery state.
    pub fn pg_host(&self, host: &str, primary: bool, position: &str) {
        self.sim.add_host(host);
        self.sim
            .reply(host, "SELECT current_setting('server_version_num')", SimReply::scalar(PG_VERSION));
        self.sim.reply(
            host,
            "SELECT pg_is_in_recovery()",
            SimReply::scalar(if primary { "f" } else { "t" }),
        );
        let sql = if primary {
            "SELECT pg_current_wal_lsn()"
        } else {
            "SELECT pg_last_wal_replay_lsn()"
        };
        self.sim.reply(host, sql, SimReply::scalar(position));
    }

    pub fn replication_rows(&self, rows: &[(&str, Option<&str>, Option<&str>)]) {
        let result = QueryResult::new(
            vec!["application_name".into(), "state".into(), "sync_state".into()],
            rows.iter()
                .map(|(app, state, sync)| {
                    vec![
                        Some(app.to_string()),
                        state.map(str::to_string),
                        sync.map(str::to_string),
                    ]
                })
                .collect(),
        );
        self.sim.reply(
            "db0",
            "SELECT application_name, state, sync_state FROM pg_stat_replication",
            SimReply::Rows(result),
        );
    }
}
