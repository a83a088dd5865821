//! Diagnostic connection pool: one administrative session per backend,
//! owned by the lag monitor for the duration of a single cycle.

use std::sync::Arc;

use harbor_common::config::SrCheckConfig;
use harbor_common::{NodeId, ProbeError};

use crate::admin::{AdminConnection, AdminConnector, ConnectTarget};
use crate::backend::BackendDirectory;

pub struct DiagnosticConnectionPool {
    connector: Arc<dyn AdminConnector>,
    slots: Vec<Option<Box<dyn AdminConnection>>>,
}

impl DiagnosticConnectionPool {
    pub fn new(connector: Arc<dyn AdminConnector>, node_count: usize) -> Self {
        Self {
            connector,
            slots: (0..node_count).map(|_| None).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Open a session to every up node that lacks one.
    ///
    /// A node that cannot be reached keeps an empty slot and is retried on
    /// the next call. Returns the number of sessions opened.
    pub async fn establish(&mut self, directory: &BackendDirectory, creds: &SrCheckConfig) -> usize {
        if self.slots.len() < directory.len() {
            self.slots.resize_with(directory.len(), || None);
        }

        let mut opened = 0;
        for node in directory.snapshot() {
            if !node.is_up() || self.slots[node.id.index()].is_some() {
                continue;
            }
            let target = ConnectTarget {
                host: node.connect_host().to_string(),
                port: node.port,
                database: creds.database.clone(),
                user: creds.user.clone(),
                password: creds.password.clone(),
            };
            match self.connector.connect(&target).await {
                Ok(conn) => {
                    self.slots[node.id.index()] = Some(conn);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(node_id = node.id.0, "diagnostic connection failed: {}", e);
                }
            }
        }
        opened
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.slots.get(id.index()).is_some_and(Option::is_some)
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// Session for `id`, or `MissingConnection`.
    pub fn conn(&mut self, id: NodeId) -> Result<&mut (dyn AdminConnection + 'static), ProbeError> {
        self.slots
            .get_mut(id.index())
            .and_then(|s| s.as_deref_mut())
            .ok_or(ProbeError::MissingConnection(id))
    }

    /// Close and clear every session.
    pub async fn discard_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(conn) = slot.take() {
                conn.close().await;
            }
        }
    }
}
