//! Query result fetcher: runs one statement on a diagnostic connection and
//! converts every failure into a logged, typed soft error.

use harbor_common::{NodeId, ProbeError};

use crate::admin::{AdminConnection, QueryResult};

/// Per-node outcome of one probe within a monitor cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ok(T),
    /// Nothing to report (node down, not applicable, or no value).
    Unknown,
    Failed(ProbeError),
}

impl<T> Probe<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            Probe::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Probe::Ok(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Probe::Failed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Probe<U> {
        match self {
            Probe::Ok(v) => Probe::Ok(f(v)),
            Probe::Unknown => Probe::Unknown,
            Probe::Failed(e) => Probe::Failed(e),
        }
    }
}

impl<T> From<Result<T, ProbeError>> for Probe<T> {
    fn from(r: Result<T, ProbeError>) -> Self {
        match r {
            Ok(v) => Probe::Ok(v),
            Err(e) => Probe::Failed(e),
        }
    }
}

fn probe_kind(e: &ProbeError) -> &'static str {
    match e {
        ProbeError::MissingConnection(_) => "missing_connection",
        ProbeError::QueryFailed { .. } => "query_failed",
        ProbeError::NoResult(_) => "no_result",
        ProbeError::NoRows(_) => "no_rows",
    }
}

/// Record a soft failure in logs and metrics.
pub(crate) fn note_probe_failure(e: &ProbeError, node: NodeId) {
    match e {
        // An empty pg_stat_replication is routine.
        ProbeError::NoRows(_) => tracing::debug!(node_id = node.0, "replication check: {}", e),
        _ => tracing::warn!(node_id = node.0, "replication check: {}", e),
    }
    harbor_observability::record_probe_failure(node.0, probe_kind(e));
}

/// Run `sql` on `conn`.
///
/// A statement that returns no result set gives `NoResult`; a result set
/// with zero rows gives `NoRows`. Errors never escape as anything but a
/// `ProbeError`, and each one is logged here.
pub async fn run_query(
    conn: &mut dyn AdminConnection,
    node: NodeId,
    sql: &str,
) -> Result<QueryResult, ProbeError> {
    let outcome = match conn.simple_query(sql).await {
        Ok(Some(result)) if result.num_rows() == 0 => Err(ProbeError::NoRows(node)),
        Ok(Some(result)) => Ok(result),
        Ok(None) => Err(ProbeError::NoResult(node)),
        Err(e) => Err(ProbeError::QueryFailed {
            node,
            reason: e.to_string(),
        }),
    };
    if let Err(e) = &outcome {
        tracing::debug!(node_id = node.0, sql, "query did not produce rows");
        note_probe_failure(e, node);
    }
    outcome
}

/// First column of the first row, `None` when it is NULL.
pub async fn fetch_scalar(
    conn: &mut dyn AdminConnection,
    node: NodeId,
    sql: &str,
) -> Result<Option<String>, ProbeError> {
    let result = run_query(conn, node, sql).await?;
    Ok(result.value(0, 0).map(str::to_string))
}
