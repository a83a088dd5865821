//! Node-status verification: classifies each backend from what it reports
//! about itself, flagging nodes whose role contradicts the designated
//! topology.

use async_trait::async_trait;

use harbor_common::NodeId;

use crate::backend::BackendDirectory;
use crate::diag_pool::DiagnosticConnectionPool;
use crate::fetch::fetch_scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeVerdict {
    Primary,
    Standby,
    /// Down, not connected, or could not be classified this cycle.
    Unused,
    /// Role contradicts the designated topology.
    Invalid,
}

#[async_trait]
pub trait NodeStatusVerifier: Send + Sync {
    /// One verdict per node in the directory, indexed by node id.
    async fn verify(
        &self,
        pool: &mut DiagnosticConnectionPool,
        directory: &BackendDirectory,
    ) -> Vec<NodeVerdict>;
}

pub const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery()";

/// Flags standbys that have been promoted behind the proxy's back, and a
/// designated primary that has gone back into recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct FalsePrimaryVerifier;

#[async_trait]
impl NodeStatusVerifier for FalsePrimaryVerifier {
    async fn verify(
        &self,
        pool: &mut DiagnosticConnectionPool,
        directory: &BackendDirectory,
    ) -> Vec<NodeVerdict> {
        let primary = directory.primary();
        let mut verdicts = Vec::with_capacity(directory.len());

        for id in directory.node_ids() {
            if !directory.is_up(id) {
                verdicts.push(NodeVerdict::Unused);
                continue;
            }
            let Ok(conn) = pool.conn(id) else {
                verdicts.push(NodeVerdict::Unused);
                continue;
            };
            let in_recovery = match fetch_scalar(conn, id, IN_RECOVERY_SQL).await {
                Ok(Some(v)) if v == "t" => true,
                Ok(Some(v)) if v == "f" => false,
                _ => {
                    verdicts.push(NodeVerdict::Unused);
                    continue;
                }
            };
            verdicts.push(classify(id, primary, in_recovery));
        }
        verdicts
    }
}

fn classify(id: NodeId, primary: Option<NodeId>, in_recovery: bool) -> NodeVerdict {
    match (primary, in_recovery) {
        (Some(p), true) if p == id => NodeVerdict::Invalid,
        (Some(p), false) if p != id => NodeVerdict::Invalid,
        (_, true) => NodeVerdict::Standby,
        (_, false) => NodeVerdict::Primary,
    }
}
