//! Administrative connection factory.
//!
//! The monitor and the orchestrator talk to backends only through the
//! `AdminConnector` / `AdminConnection` traits; `PgAdminConnector` is the
//! production implementation over tokio-postgres' simple query protocol.

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

use harbor_common::HarborError;

/// Where and as whom to open an administrative connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Rows x columns of nullable text values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    /// Single-column, single-row result.
    pub fn scalar(column: &str, value: Option<&str>) -> Self {
        Self {
            columns: vec![column.to_string()],
            rows: vec![vec![value.map(str::to_string)]],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Text of `(row, col)`, `None` for SQL NULL or out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

/// An open administrative session.
#[async_trait]
pub trait AdminConnection: Send {
    /// Run one statement. `Ok(None)` means the statement completed without
    /// returning a result set (e.g. `CHECKPOINT`).
    async fn simple_query(&mut self, sql: &str) -> Result<Option<QueryResult>, HarborError>;

    /// Close the session.
    async fn close(self: Box<Self>);
}

/// Opens administrative sessions.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn AdminConnection>, HarborError>;
}

/// tokio-postgres backed connector.
#[derive(Debug, Clone)]
pub struct PgAdminConnector {
    connect_timeout: Duration,
}

impl PgAdminConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PgAdminConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl AdminConnector for PgAdminConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn AdminConnection>, HarborError> {
        let mut config = Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .dbname(&target.database)
            .user(&target.user)
            .connect_timeout(self.connect_timeout)
            .application_name("harbor");
        if !target.password.is_empty() {
            config.password(&target.password);
        }

        tracing::debug!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            user = %target.user,
            "opening admin connection"
        );
        let (client, connection) =
            config
                .connect(NoTls)
                .await
                .map_err(|e| HarborError::Connect {
                    host: target.host.clone(),
                    port: target.port,
                    reason: e.to_string(),
                })?;

        let host = target.host.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(host = %host, "admin connection error: {}", e);
            }
        });

        Ok(Box::new(PgAdminConnection { client, driver }))
    }
}

struct PgAdminConnection {
    client: Client,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl AdminConnection for PgAdminConnection {
    async fn simple_query(&mut self, sql: &str) -> Result<Option<QueryResult>, HarborError> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| HarborError::Query(format!("{}: {}", sql, e)))?;

        let mut result: Option<QueryResult> = None;
        for msg in messages {
            match msg {
                SimpleQueryMessage::RowDescription(cols) => {
                    result = Some(QueryResult::new(
                        cols.iter().map(|c| c.name().to_string()).collect(),
                        Vec::new(),
                    ));
                }
                SimpleQueryMessage::Row(row) => {
                    let values = (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect();
                    result
                        .get_or_insert_with(|| {
                            QueryResult::new(
                                row.columns().iter().map(|c| c.name().to_string()).collect(),
                                Vec::new(),
                            )
                        })
                        .rows
                        .push(values);
                }
                _ => {}
            }
        }
        Ok(result)
    }

    async fn close(self: Box<Self>) {
        let PgAdminConnection { client, driver } = *self;
        // Dropping the client terminates the session; the driver then exits.
        drop(client);
        if let Err(e) = driver.await {
            tracing::debug!("admin connection driver ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_result_accessors() {
        let r = QueryResult::new(
            vec!["application_name".into(), "state".into()],
            vec![
                vec![Some("db1".into()), Some("streaming".into())],
                vec![Some("db2".into()), None],
            ],
        );
        assert_eq!(r.num_rows(), 2);
        assert_eq!(r.value(0, 1), Some("streaming"));
        assert_eq!(r.value(1, 1), None);
        assert_eq!(r.value(5, 0), None);
    }

    #[test]
    fn test_scalar_result() {
        let r = QueryResult::scalar("pg_is_in_recovery", Some("t"));
        assert_eq!(r.columns, vec!["pg_is_in_recovery"]);
        assert_eq!(r.value(0, 0), Some("t"));
    }
}
