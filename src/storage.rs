//! Database provisioning through the native `mysql` client.
//!
//! Creating and dropping the database is delegated to the command-line client. Its
//! output decides the outcome: no output is success, a known message is an expected
//! outcome, anything else is passed through as [`DbError::Storage`].

use crate::config::RepoConfig;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Client execution timeout in seconds
pub const CLIENT_TIMEOUT_SECS: u64 = 30;

/// Default client program
pub const MYSQL_CLIENT: &str = "mysql";

/// Output from one client invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Everything the client printed, trimmed.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Runs an external program (testable)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> DbResult<CommandOutput>;
}

/// Real runner using tokio::process
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> DbResult<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(CLIENT_TIMEOUT_SECS);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| DbError::timeout(format!("{program} invocation"), timeout))?
            .map_err(|e| DbError::storage(format!("Failed to run {program}: {e}")))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Result of a provisioning call. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOutcome {
    Created,
    AlreadyExists,
    Dropped,
    AlreadyDown,
}

pub struct StorageManager {
    config: RepoConfig,
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl StorageManager {
    pub fn new(config: RepoConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: RepoConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            program: MYSQL_CLIENT.to_string(),
        }
    }

    /// Use a different client binary (e.g. `mariadb`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Create the configured database.
    pub async fn create_database(&self) -> DbResult<StorageOutcome> {
        let name = self.database_name()?;
        let sql = format!(
            "CREATE DATABASE `{name}` DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
        );
        let output = self.run_client(&sql).await?;
        let outcome = classify(
            &output,
            StorageOutcome::Created,
            "database exists",
            StorageOutcome::AlreadyExists,
        )?;
        info!(database = %name, outcome = ?outcome, "Create database");
        Ok(outcome)
    }

    /// Drop the configured database.
    pub async fn drop_database(&self) -> DbResult<StorageOutcome> {
        let name = self.database_name()?;
        let sql = format!("DROP DATABASE `{name}`");
        let output = self.run_client(&sql).await?;
        let outcome = classify(
            &output,
            StorageOutcome::Dropped,
            "database doesn't exist",
            StorageOutcome::AlreadyDown,
        )?;
        info!(database = %name, outcome = ?outcome, "Drop database");
        Ok(outcome)
    }

    fn database_name(&self) -> DbResult<&str> {
        let name = self
            .config
            .database
            .as_deref()
            .ok_or_else(|| DbError::invalid_input("No database name in the connection URL"))?;
        if name.contains('`') {
            return Err(DbError::invalid_input(format!(
                "Database name must not contain a backtick: {name}"
            )));
        }
        Ok(name)
    }

    async fn run_client(&self, sql: &str) -> DbResult<CommandOutput> {
        let args = self.client_args(sql);
        let env: Vec<(String, String)> = self
            .config
            .password
            .iter()
            .map(|p| ("MYSQL_PWD".to_string(), p.clone()))
            .collect();

        debug!(program = %self.program, sql, "Running database client");
        self.runner.run(&self.program, &args, &env).await
    }

    /// Server-level client arguments; the password travels in `MYSQL_PWD`.
    fn client_args(&self, sql: &str) -> Vec<String> {
        let config = &self.config;
        let mut args = vec![
            "--host".to_string(),
            config.hostname.clone(),
            "--port".to_string(),
            config.port.to_string(),
            "--protocol=tcp".to_string(),
        ];
        if let Some(user) = &config.username {
            args.push("--user".to_string());
            args.push(user.clone());
        }

        if config.ssl {
            let ssl = &config.ssl_options;
            let mode = if ssl.ca.is_some() { "VERIFY_CA" } else { "REQUIRED" };
            args.push(format!("--ssl-mode={mode}"));
            let files = [
                ("--ssl-ca", &ssl.ca),
                ("--ssl-cert", &ssl.cert),
                ("--ssl-key", &ssl.key),
            ];
            for (flag, path) in files {
                if let Some(path) = path {
                    args.push(format!("{flag}={}", path.display()));
                }
            }
        }

        args.push("--silent".to_string());
        args.push("--execute".to_string());
        args.push(sql.to_string());
        args
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("program", &self.program)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

fn classify(
    output: &CommandOutput,
    success: StorageOutcome,
    known: &str,
    expected: StorageOutcome,
) -> DbResult<StorageOutcome> {
    let text = output.combined();
    if text.is_empty() {
        return Ok(success);
    }
    if text.contains(known) {
        return Ok(expected);
    }
    Err(DbError::storage(text))
}
