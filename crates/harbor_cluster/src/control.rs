//! Cluster control signal: the narrow interface the monitor and the
//! orchestrator use to request topology changes and to touch the
//! process-wide recovery flags shared with the serving layer.
//!
//! `RecoveryRequestState` holds the flags as atomics behind an `Arc`;
//! nothing in this crate uses ambient globals. `LocalControlPlane` is the
//! in-process implementation: it applies degenerations and failbacks to
//! the `BackendDirectory` and forwards notifications to the supervisor
//! over a channel.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use harbor_common::{BackendStatus, HarborError, NodeId};

use crate::backend::BackendDirectory;
use crate::events::{ClusterEventLog, EventCategory, EventSeverity};

/// What the control plane is currently being asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestKind {
    #[default]
    Idle,
    NodeDown,
    NodeUp,
    NodeRecovery,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Idle => write!(f, "IDLE"),
            RequestKind::NodeDown => write!(f, "NODE_DOWN_REQUEST"),
            RequestKind::NodeUp => write!(f, "NODE_UP_REQUEST"),
            RequestKind::NodeRecovery => write!(f, "NODE_RECOVERY_REQUEST"),
        }
    }
}

/// Detail flags attached to a degeneration request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDetails(u8);

impl RequestDetails {
    pub const NONE: RequestDetails = RequestDetails(0);
    /// Requested as part of a switchover rather than a health failure.
    pub const SWITCHOVER: RequestDetails = RequestDetails(0b01);
    /// The condition was confirmed; no further consensus needed.
    pub const CONFIRMED: RequestDetails = RequestDetails(0b10);

    pub fn contains(self, other: RequestDetails) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RequestDetails {
    type Output = RequestDetails;

    fn bitor(self, rhs: Self) -> Self {
        RequestDetails(self.0 | rhs.0)
    }
}

impl fmt::Display for RequestDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(RequestDetails::SWITCHOVER) {
            parts.push("switchover");
        }
        if self.contains(RequestDetails::CONFIRMED) {
            parts.push("confirmed");
        }
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// Process-wide recovery flags shared with the serving layer.
///
/// While `recovery_in_progress` is set the serving layer must not hand out
/// new backend connections; `try_admit_connection` encodes that contract.
#[derive(Debug, Default)]
pub struct RecoveryRequestState {
    kind: Mutex<RequestKind>,
    recovery_in_progress: AtomicBool,
    active_connections: AtomicUsize,
}

impl RecoveryRequestState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kind(&self) -> RequestKind {
        *self.kind.lock()
    }

    pub fn set_kind(&self, kind: RequestKind) {
        *self.kind.lock() = kind;
    }

    pub fn recovery_in_progress(&self) -> bool {
        self.recovery_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_recovery_in_progress(&self, on: bool) {
        self.recovery_in_progress.store(on, Ordering::SeqCst);
        harbor_observability::record_recovery_in_progress(on);
    }

    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Admit a client connection unless a recovery is quiescing traffic.
    pub fn try_admit_connection(&self) -> bool {
        if self.recovery_in_progress() {
            return false;
        }
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Called by the serving layer as a client disconnects.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn set_active_connections(&self, n: usize) {
        self.active_connections.store(n, Ordering::SeqCst);
    }
}

/// Notifications delivered to the supervising process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Degenerated {
        nodes: Vec<NodeId>,
        details: RequestDetails,
    },
    FailbackRequested(NodeId),
    FailbackCompleted(NodeId),
    RecoveryFinished,
    HbaReloadRequested(String),
}

/// Topology-change and shared-flag interface used by the monitor and the
/// orchestrator.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Publish what kind of request is underway.
    fn announce(&self, kind: RequestKind);

    fn recovery_in_progress(&self) -> bool;

    fn set_recovery_in_progress(&self, on: bool);

    fn active_connection_count(&self) -> usize;

    /// Remove nodes from the serving set.
    fn degenerate_backends(&self, nodes: &[NodeId], details: RequestDetails)
        -> Result<(), HarborError>;

    /// Ask for `node` to be reintroduced into the serving set.
    fn send_failback_request(&self, node: NodeId) -> Result<(), HarborError>;

    /// Block until the routing layer acknowledges the failback of `node`.
    async fn wait_failback_complete(&self, node: NodeId);

    /// Tell the parent supervisor that recovery has finished.
    fn notify_recovery_finished(&self);

    /// Ask the serving layer to re-read client access rules.
    fn request_hba_reload(&self, path: &str);
}

/// In-process control plane backed by a `BackendDirectory`.
pub struct LocalControlPlane {
    directory: Arc<BackendDirectory>,
    state: Arc<RecoveryRequestState>,
    events: Arc<ClusterEventLog>,
    supervisor: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    /// When false, failbacks wait for `acknowledge_failback`.
    inline_failback: bool,
    /// Woken on every acknowledgement; waiters recheck their own node.
    failback_done: Notify,
    failback_requests: Mutex<Vec<NodeId>>,
}

impl LocalControlPlane {
    pub fn new(
        directory: Arc<BackendDirectory>,
        state: Arc<RecoveryRequestState>,
        events: Arc<ClusterEventLog>,
    ) -> Self {
        Self {
            directory,
            state,
            events,
            supervisor: None,
            inline_failback: true,
            failback_done: Notify::new(),
            failback_requests: Mutex::new(Vec::new()),
        }
    }

    /// Forward supervisor notifications to `tx`.
    pub fn with_supervisor(mut self, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.supervisor = Some(tx);
        self
    }

    /// Leave failbacks pending until the routing layer calls
    /// `acknowledge_failback`.
    pub fn with_external_failback(mut self) -> Self {
        self.inline_failback = false;
        self
    }

    pub fn state(&self) -> &Arc<RecoveryRequestState> {
        &self.state
    }

    /// Every failback requested so far, in order.
    pub fn failback_requests(&self) -> Vec<NodeId> {
        self.failback_requests.lock().clone()
    }

    /// Mark `node` up and wake the recovery waiting on it.
    pub fn acknowledge_failback(&self, node: NodeId) -> Result<(), HarborError> {
        let prev = self
            .directory
            .set_status(node, BackendStatus::Up)
            .ok_or_else(|| HarborError::Control(format!("failback of unknown node {}", node)))?;
        self.events.log(
            EventCategory::Failback,
            EventSeverity::Info,
            node,
            prev.to_string(),
            BackendStatus::Up.to_string(),
            format!("node {} is back in the serving set", node),
        );
        self.state.set_kind(RequestKind::Idle);
        self.notify_supervisor(SupervisorEvent::FailbackCompleted(node));
        self.failback_done.notify_waiters();
        Ok(())
    }

    fn notify_supervisor(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.supervisor {
            if tx.send(event).is_err() {
                tracing::warn!("supervisor channel closed, dropping notification");
            }
        }
    }
}

#[async_trait]
impl ClusterControl for LocalControlPlane {
    fn announce(&self, kind: RequestKind) {
        tracing::debug!(kind = %kind, "control request announced");
        self.state.set_kind(kind);
    }

    fn recovery_in_progress(&self) -> bool {
        self.state.recovery_in_progress()
    }

    fn set_recovery_in_progress(&self, on: bool) {
        self.state.set_recovery_in_progress(on);
    }

    fn active_connection_count(&self) -> usize {
        self.state.active_connection_count()
    }

    fn degenerate_backends(
        &self,
        nodes: &[NodeId],
        details: RequestDetails,
    ) -> Result<(), HarborError> {
        if let Some(bad) = nodes.iter().find(|n| n.index() >= self.directory.len()) {
            return Err(HarborError::Control(format!(
                "degenerate request for unknown node {}",
                bad
            )));
        }

        self.state.set_kind(RequestKind::NodeDown);
        let mut degenerated = Vec::new();
        for &node in nodes {
            match self.directory.mark_down_if_up(node) {
                Some(BackendStatus::Up) => {
                    self.events.log(
                        EventCategory::Degeneration,
                        EventSeverity::Warn,
                        node,
                        BackendStatus::Up.to_string(),
                        BackendStatus::Down.to_string(),
                        format!("node {} degenerated ({})", node, details),
                    );
                    degenerated.push(node);
                }
                Some(prev) => {
                    tracing::info!(node_id = node.0, status = %prev, "degenerate request ignored, node not up");
                }
                None => {}
            }
        }
        self.state.set_kind(RequestKind::Idle);

        if !degenerated.is_empty() {
            self.notify_supervisor(SupervisorEvent::Degenerated {
                nodes: degenerated,
                details,
            });
        }
        Ok(())
    }

    fn send_failback_request(&self, node: NodeId) -> Result<(), HarborError> {
        if node.index() >= self.directory.len() {
            return Err(HarborError::Control(format!(
                "failback request for unknown node {}",
                node
            )));
        }
        self.failback_requests.lock().push(node);
        self.state.set_kind(RequestKind::NodeUp);
        self.notify_supervisor(SupervisorEvent::FailbackRequested(node));
        tracing::info!(node_id = node.0, "failback requested");

        if self.inline_failback {
            self.acknowledge_failback(node)?;
        }
        Ok(())
    }

    async fn wait_failback_complete(&self, node: NodeId) {
        tracing::debug!(node_id = node.0, "waiting for failback to complete");
        loop {
            // Register before checking so an acknowledgement in between is not lost.
            let mut notified = std::pin::pin!(self.failback_done.notified());
            notified.as_mut().enable();
            if self.directory.is_up(node) {
                return;
            }
            notified.await;
        }
    }

    fn notify_recovery_finished(&self) {
        tracing::info!("recovery finished, notifying supervisor");
        self.notify_supervisor(SupervisorEvent::RecoveryFinished);
    }

    fn request_hba_reload(&self, path: &str) {
        tracing::info!(path, "access rule reload requested");
        self.notify_supervisor(SupervisorEvent::HbaReloadRequested(path.to_string()));
    }
}
