//! In-process simulated backends for tests and dry runs.
//!
//! `SimCluster` is an `AdminConnector` whose hosts answer from a script:
//! each host can be made unreachable, can refuse a number of connection
//! attempts before accepting, and maps exact SQL text to a reply. Every
//! connect, query and close is recorded in a call log.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use harbor_common::HarborError;

use crate::admin::{AdminConnection, AdminConnector, ConnectTarget, QueryResult};

/// Scripted reply to one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// A result set.
    Rows(QueryResult),
    /// Completed without a result set.
    Command,
    /// The statement raised an error.
    Error(String),
}

impl SimReply {
    pub fn scalar(value: &str) -> Self {
        SimReply::Rows(QueryResult::scalar("?column?", Some(value)))
    }

    pub fn null() -> Self {
        SimReply::Rows(QueryResult::scalar("?column?", None))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Connect { host: String, database: String, ok: bool },
    Query { host: String, sql: String },
    Close { host: String },
}

#[derive(Default)]
struct SimHost {
    reachable: bool,
    refuse_connects: u32,
    /// Replies are consumed in order; the last one repeats.
    replies: HashMap<String, Vec<SimReply>>,
}

#[derive(Default)]
struct SimState {
    hosts: HashMap<String, SimHost>,
    calls: Vec<SimCall>,
    open: usize,
}

/// Scripted cluster of simulated backends, keyed by host name.
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable host with no scripted statements.
    pub fn add_host(&self, host: &str) -> &Self {
        self.state.lock().hosts.insert(
            host.to_string(),
            SimHost {
                reachable: true,
                ..SimHost::default()
            },
        );
        self
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) -> &Self {
        self.state.lock().hosts.entry(host.to_string()).or_default().reachable = reachable;
        self
    }

    /// Refuse the next `n` connection attempts to `host`.
    pub fn refuse_connects(&self, host: &str, n: u32) -> &Self {
        self.state.lock().hosts.entry(host.to_string()).or_default().refuse_connects = n;
        self
    }

    pub fn reply(&self, host: &str, sql: &str, reply: SimReply) -> &Self {
        self.reply_sequence(host, sql, vec![reply])
    }

    /// Answer successive runs of `sql` with `replies` in order, repeating
    /// the last one once the rest are used up.
    pub fn reply_sequence(&self, host: &str, sql: &str, replies: Vec<SimReply>) -> &Self {
        self.state
            .lock()
            .hosts
            .entry(host.to_string())
            .or_default()
            .replies
            .insert(sql.to_string(), replies);
        self
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Statements run on `host`, in order.
    pub fn queries(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                SimCall::Query { host: h, sql } if h == host => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_attempts(&self, host: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::Connect { host: h, .. } if h == host))
            .count()
    }

    /// Sessions opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }
}

#[async_trait]
impl AdminConnector for SimCluster {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn AdminConnection>, HarborError> {
        let mut state = self.state.lock();
        let ok = match state.hosts.get_mut(&target.host) {
            Some(host) if host.reachable && host.refuse_connects == 0 => true,
            Some(host) => {
                host.refuse_connects = host.refuse_connects.saturating_sub(1);
                false
            }
            None => false,
        };
        state.calls.push(SimCall::Connect {
            host: target.host.clone(),
            database: target.database.clone(),
            ok,
        });
        if !ok {
            return Err(HarborError::Connect {
                host: target.host.clone(),
                port: target.port,
                reason: "connection refused".into(),
            });
        }
        state.open += 1;
        Ok(Box::new(SimConnection {
            host: target.host.clone(),
            state: self.state.clone(),
        }))
    }
}

/// One open session on a `SimCluster` host.
pub struct SimConnection {
    host: String,
    state: Arc<Mutex<SimState>>,
}

impl SimConnection {
    /// Standalone session answering from `script`.
    pub fn scripted<'a>(script: impl IntoIterator<Item = (&'a str, SimReply)>) -> Self {
        let cluster = SimCluster::new();
        cluster.add_host("sim");
        for (sql, reply) in script {
            cluster.reply("sim", sql, reply);
        }
        cluster.state.lock().open += 1;
        SimConnection {
            host: "sim".into(),
            state: cluster.state,
        }
    }
}

#[async_trait]
impl AdminConnection for SimConnection {
    async fn simple_query(&mut self, sql: &str) -> Result<Option<QueryResult>, HarborError> {
        let mut state = self.state.lock();
        state.calls.push(SimCall::Query {
            host: self.host.clone(),
            sql: sql.to_string(),
        });
        let reply = state
            .hosts
            .get_mut(&self.host)
            .and_then(|h| h.replies.get_mut(sql))
            .and_then(|replies| {
                if replies.len() > 1 {
                    Some(replies.remove(0))
                } else {
                    replies.first().cloned()
                }
            });
        match reply {
            Some(SimReply::Rows(r)) => Ok(Some(r)),
            Some(SimReply::Command) => Ok(None),
            Some(SimReply::Error(e)) => Err(HarborError::Query(e)),
            None => Err(HarborError::Query(format!("unexpected statement: {}", sql))),
        }
    }

    async fn close(self: Box<Self>) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        state.calls.push(SimCall::Close {
            host: self.host.clone(),
        });
    }
}
