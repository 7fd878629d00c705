//! mysql-repo - Main entry point.
//!
//! Command-line front end for the repository runtime: provisions the database,
//! applies and reverts migration versions, and runs ad-hoc statements.

use clap::Parser;
use mysql_repo::config::{Command, Config, MigrationArgs};
use mysql_repo::db::normalize;
use mysql_repo::migration::split_statements;
use mysql_repo::models::{QueryOptions, QueryOutcome, QueryParam, Value};
use mysql_repo::{MigrationLedger, Repo, RepoConfig, StorageManager};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; stdout carries command output.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Commands given inline, followed by those read from `--file`.
fn load_commands(args: &MigrationArgs) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut commands = args.commands.clone();
    if let Some(path) = &args.file {
        let script = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        commands.extend(split_statements(&script));
    }
    Ok(commands)
}

fn parse_params(raw: &[String]) -> Result<Vec<QueryParam>, Box<dyn std::error::Error>> {
    raw.iter()
        .map(|p| {
            serde_json::from_str(p)
                .map(QueryParam::from_json)
                .map_err(|e| {
                    Box::<dyn std::error::Error>::from(format!(
                        "Parameter '{p}' is not a JSON literal: {e}"
                    ))
                })
        })
        .collect()
}

async fn run(config: &Config, repo_config: RepoConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &config.command {
        Command::StorageUp => {
            let outcome = StorageManager::new(repo_config).create_database().await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Command::StorageDown => {
            let outcome = StorageManager::new(repo_config).drop_database().await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Command::MigrateUp(args) | Command::MigrateDown(args) => {
            let commands = load_commands(args)?;
            let repo = Repo::connect(repo_config).await?;
            let ledger = MigrationLedger::new(repo.clone());
            let result = match &config.command {
                Command::MigrateUp(_) => ledger.migrate_up(args.version, &commands).await,
                _ => ledger.migrate_down(args.version, &commands).await,
            };
            repo.stop().await;
            println!("{}", serde_json::to_string(&result?)?);
        }
        Command::Migrations => {
            let repo = Repo::connect(repo_config).await?;
            let result = MigrationLedger::new(repo.clone()).migrated_versions().await;
            repo.stop().await;
            let mut versions = result?;
            versions.sort_unstable();
            for version in versions {
                println!("{version}");
            }
        }
        Command::Query { sql, params } => {
            let params = parse_params(params)?;
            let repo = Repo::connect(repo_config).await?;
            let result = repo.query(sql, &params, &QueryOptions::default()).await;
            repo.stop().await;
            match result? {
                QueryOutcome::Rows(set) => {
                    for row in set.rows {
                        let values: Vec<Value> = row.into_iter().map(normalize).collect();
                        println!("{}", serde_json::to_string(&values)?);
                    }
                }
                QueryOutcome::Ack(ack) => {
                    let ack = serde_json::json!({
                        "affected_rows": ack.affected_rows,
                        "inserted_id": ack.inserted_id,
                    });
                    println!("{ack}");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let repo_config = config.repo_config()?;
    info!(
        host = %repo_config.hostname,
        database = ?repo_config.database,
        "Starting mysql-repo v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&config, repo_config).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
