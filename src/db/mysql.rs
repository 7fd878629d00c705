//! MySQL driver built on `sqlx::MySqlConnection`.
//!
//! One [`MySqlConnector`] per repository opens bare connections; pooling is done by
//! [`crate::db::pool::ConnectionPool`], not by sqlx.

use crate::config::RepoConfig;
use crate::db::driver::{Connector, DriverConnection};
use crate::db::params::bind_all;
use crate::db::types::{column_names, decode_row};
use crate::error::{DbError, DbResult};
use crate::models::{Ack, QueryOutcome, QueryParam, RowSet};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{Connection, Either, Execute, Executor, MySql};
use tracing::{debug, warn};

/// Leading keywords of statements that answer with a result set, even an empty one.
const ROW_RETURNING_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];

/// Opens MySQL sessions from a [`RepoConfig`].
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
}

impl MySqlConnector {
    pub fn new(config: &RepoConfig) -> DbResult<Self> {
        Ok(Self {
            options: connect_options(config)?,
        })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> DbResult<Box<dyn DriverConnection>> {
        let conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|e| match DbError::from(e) {
                // e.g. access denied, unknown database
                DbError::Driver { message, .. } => DbError::connection(
                    message,
                    "Check the credentials and that the database exists",
                ),
                other => other,
            })?;
        Ok(Box::new(MySqlDriverConnection { conn }))
    }
}

struct MySqlDriverConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl DriverConnection for MySqlDriverConnection {
    async fn execute(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryOutcome> {
        // When params is empty, use raw SQL to avoid prepared statement issues
        // (some SQL like CREATE PROCEDURE doesn't support prepared statements)
        if params.is_empty() {
            collect_outcome(&mut self.conn, statement, statement).await
        } else {
            collect_outcome(&mut self.conn, bind_all(statement, params), statement).await
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().await.map_err(DbError::from)
    }
}

/// Drain every result of one statement into rows or an acknowledgement.
async fn collect_outcome<'q, E>(
    conn: &mut MySqlConnection,
    query: E,
    statement: &str,
) -> DbResult<QueryOutcome>
where
    E: Execute<'q, MySql> + 'q,
{
    let mut stream = conn.fetch_many(query);
    let mut columns = None;
    let mut rows = Vec::new();
    let mut affected_rows = 0;
    let mut last_insert_id = 0;

    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(result) => {
                affected_rows += result.rows_affected();
                if result.last_insert_id() != 0 {
                    last_insert_id = result.last_insert_id();
                }
            }
            Either::Right(row) => {
                if columns.is_none() {
                    columns = Some(column_names(&row));
                }
                rows.push(decode_row(&row)?);
            }
        }
    }

    if columns.is_some() || returns_rows(statement) {
        return Ok(QueryOutcome::Rows(RowSet {
            columns: columns.unwrap_or_default(),
            rows,
        }));
    }

    Ok(QueryOutcome::Ack(Ack {
        inserted_id: (last_insert_id != 0).then_some(last_insert_id),
        affected_rows: Some(affected_rows),
    }))
}

fn returns_rows(statement: &str) -> bool {
    let keyword = statement
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    ROW_RETURNING_KEYWORDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(keyword))
}

fn connect_options(config: &RepoConfig) -> DbResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::new()
        .host(&config.hostname)
        .port(config.port)
        .charset("utf8mb4");

    if let Some(username) = &config.username {
        options = options.username(username);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }

    options = if config.ssl {
        let ssl = &config.ssl_options;
        let mut options = options.ssl_mode(if ssl.ca.is_some() {
            MySqlSslMode::VerifyCa
        } else {
            MySqlSslMode::Required
        });
        if let Some(ca) = &ssl.ca {
            options = options.ssl_ca(ca);
        }
        if let Some(cert) = &ssl.cert {
            options = options.ssl_client_cert(cert);
        }
        if let Some(key) = &ssl.key {
            options = options.ssl_client_key(key);
        }
        options
    } else {
        options.ssl_mode(MySqlSslMode::Disabled)
    };

    for (key, value) in &config.connection_params {
        options = match key.to_ascii_lowercase().as_str() {
            "charset" => options.charset(value),
            "collation" => options.collation(value),
            "timezone" => options.timezone(Some(value.clone())),
            "statement_cache_capacity" => {
                let capacity = value.parse().map_err(|_| {
                    DbError::invalid_input(format!(
                        "statement_cache_capacity must be a non-negative integer, got '{value}'"
                    ))
                })?;
                options.statement_cache_capacity(capacity)
            }
            _ => {
                warn!(param = %key, "Ignoring unrecognized connection parameter");
                options
            }
        };
    }

    debug!(
        host = %config.hostname,
        port = config.port,
        database = ?config.database,
        ssl = config.ssl,
        "Built MySQL connect options"
    );

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows_by_leading_keyword() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  select * from t"));
        assert!(returns_rows("(SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(returns_rows("show tables"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("CREATE TABLE t(id INT)"));
        assert!(!returns_rows(""));
    }

    #[test]
    fn test_connector_from_config() {
        let config =
            RepoConfig::from_url("mysql://app:pw@db:3307/shop?collation=utf8mb4_bin").unwrap();
        assert!(MySqlConnector::new(&config).is_ok());
    }

    #[test]
    fn test_invalid_statement_cache_capacity_rejected() {
        let config =
            RepoConfig::from_url("mysql://localhost/shop?statement_cache_capacity=lots").unwrap();
        assert!(matches!(
            MySqlConnector::new(&config),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_unknown_params_ignored() {
        let config = RepoConfig::from_url("mysql://localhost/shop?flavour=vanilla").unwrap();
        assert!(MySqlConnector::new(&config).is_ok());
    }
}
