//! Schema migration ledger.
//!
//! Records which schema versions have been applied in a `schema_migrations` table. The
//! table is created (if absent) before every read or write, so concurrent first use is
//! harmless. A version's commands and its ledger row are written in one transaction;
//! the row is only touched after every command succeeded.

use crate::db::normalize::normalize;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOptions, QueryParam};
use crate::repo::Repo;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, info};

/// Ledger table name.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

const CREATE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
     version BIGINT NOT NULL PRIMARY KEY, \
     inserted_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)";
const SELECT_VERSIONS: &str = "SELECT version FROM schema_migrations";
const SELECT_VERSION: &str = "SELECT version FROM schema_migrations WHERE version = ?";
const INSERT_VERSION: &str = "INSERT INTO schema_migrations (version) VALUES (?)";
const DELETE_VERSION: &str = "DELETE FROM schema_migrations WHERE version = ?";

/// Result of a ledger operation. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Commands ran and the version was recorded
    Applied,
    /// The version was already recorded; nothing ran
    AlreadyApplied,
    /// Commands ran and the version was removed
    Reverted,
    /// The version was never recorded; nothing ran
    MissingUp,
}

#[derive(Debug, Clone)]
pub struct MigrationLedger {
    repo: Repo,
}

impl MigrationLedger {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// Every recorded version, in no particular order.
    pub async fn migrated_versions(&self) -> DbResult<Vec<i64>> {
        self.ensure_table().await?;
        let rows = self
            .repo
            .query(SELECT_VERSIONS, &[], &QueryOptions::default())
            .await?
            .into_rows();
        rows.into_iter().map(version_of).collect()
    }

    /// Run `commands` in order and record `version`, unless it is already recorded.
    pub async fn migrate_up(&self, version: i64, commands: &[String]) -> DbResult<MigrationOutcome> {
        self.ensure_table().await?;
        if self.is_applied(version).await? {
            info!(version, "Migration already applied");
            return Ok(MigrationOutcome::AlreadyApplied);
        }

        self.run_in_transaction(version, commands, INSERT_VERSION).await?;
        info!(version, commands = commands.len(), "Migration applied");
        Ok(MigrationOutcome::Applied)
    }

    /// Run `commands` in order and remove `version`, if it is recorded.
    pub async fn migrate_down(
        &self,
        version: i64,
        commands: &[String],
    ) -> DbResult<MigrationOutcome> {
        self.ensure_table().await?;
        if !self.is_applied(version).await? {
            info!(version, "Migration was never applied");
            return Ok(MigrationOutcome::MissingUp);
        }

        self.run_in_transaction(version, commands, DELETE_VERSION).await?;
        info!(version, commands = commands.len(), "Migration reverted");
        Ok(MigrationOutcome::Reverted)
    }

    async fn ensure_table(&self) -> DbResult<()> {
        self.repo
            .query(CREATE_LEDGER, &[], &QueryOptions::default())
            .await?;
        Ok(())
    }

    async fn is_applied(&self, version: i64) -> DbResult<bool> {
        let outcome = self
            .repo
            .query(SELECT_VERSION, &[QueryParam::Int(version)], &QueryOptions::default())
            .await?;
        Ok(outcome.row_count() > 0)
    }

    /// Run the commands, then the ledger statement, all in one transaction.
    async fn run_in_transaction(
        &self,
        version: i64,
        commands: &[String],
        ledger_statement: &'static str,
    ) -> DbResult<()> {
        let commands = commands.to_vec();
        self.repo
            .transaction(move |tx| {
                async move {
                    let opts = QueryOptions::default();
                    for command in &commands {
                        debug!(version, command = %command, "Running migration command");
                        tx.query(command, &[], &opts).await?;
                    }
                    tx.query(ledger_statement, &[QueryParam::Int(version)], &opts)
                        .await?;
                    Ok(())
                }
                .boxed()
            })
            .await
    }
}

/// Split a SQL script into `;`-terminated commands.
///
/// Semicolons inside quotes and `--` line comments are not separators.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    // Skip to end of line
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

fn version_of(row: Vec<crate::models::RawValue>) -> DbResult<i64> {
    row.into_iter()
        .next()
        .map(normalize)
        .and_then(|value| value.as_i64())
        .ok_or_else(|| DbError::internal("schema_migrations returned a non-integer version"))
}
