//! Data jobs CLI - entry point.
//!
//! Jobs implemented in Rust are registered by embedding the library; this binary runs
//! self-contained SQL definitions.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use data_jobs::config::Config;
use data_jobs::db::{backup, DbPool, JobRepository};
use data_jobs::error::{AppError, AppResult};
use data_jobs::jobs::JobRegistry;
use data_jobs::models::JobStatus;
use data_jobs::services::{
    ConsoleNotifier, JobResolver, Orchestrator, RollbackOptions, RunOptions,
};

#[derive(Parser, Debug)]
#[command(name = "data-jobs", version, about = "Run one-off data transformation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the job record table
    Install,
    /// Run pending jobs
    Migrate {
        /// Show what would run without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Skip production and row-threshold confirmations
        #[arg(long)]
        force: bool,
        /// Give each job its own batch
        #[arg(long)]
        step: bool,
        /// Skip the row-threshold confirmation
        #[arg(long)]
        no_confirm: bool,
    },
    /// Roll back the last batch, a given batch, or the most recent N jobs
    Rollback {
        #[arg(long)]
        batch: Option<i64>,
        #[arg(long)]
        step: Option<u64>,
        #[arg(long)]
        force: bool,
    },
    /// Show every job and its last recorded outcome
    Status {
        /// Only pending jobs
        #[arg(long)]
        pending: bool,
        /// Only jobs with a record
        #[arg(long, conflicts_with = "pending")]
        ran: bool,
    },
    /// Delete every job record and run all jobs again
    Fresh {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please check your environment variables:");
            error!("  - RUST_ENV must be set to 'development' or 'production'");
            error!("  - In production, DATABASE_URL must be set");
            return ExitCode::FAILURE;
        }
    };

    info!("Environment: {}", config.environment);

    match execute(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: &Config) -> AppResult<ExitCode> {
    // Create the directory holding a file-backed SQLite database
    let db_dir = backup::sqlite_file(&config.database.url)
        .and_then(|file| file.parent().map(Path::to_path_buf))
        .filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = db_dir {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::FileSystem(format!("Failed to create data directory: {}", e)))?;
    }

    let pool = DbPool::new(&config.database).await?;

    if let Command::Install = command {
        let repository = JobRepository::new(pool.connection().clone(), config.jobs.table.clone());
        repository.create_repository().await?;
        println!("Job record table '{}' is ready.", config.jobs.table);
        return Ok(ExitCode::SUCCESS);
    }

    let resolver = JobResolver::new(&config.jobs.path, JobRegistry::new());
    let mut orchestrator = Orchestrator::new(
        pool,
        resolver,
        backup::from_config(config),
        config.jobs.clone(),
    )
    .with_notifier(Arc::new(ConsoleNotifier));

    match command {
        Command::Install => Ok(ExitCode::SUCCESS),
        Command::Migrate {
            dry_run,
            force,
            step,
            no_confirm,
        } => {
            if !dry_run && !confirm_production(config, force, "run data jobs") {
                return Ok(ExitCode::FAILURE);
            }

            if dry_run {
                println!("=== DRY RUN MODE ===");
            } else if !(force || no_confirm) && !confirm_row_threshold(config, &orchestrator).await? {
                return Ok(ExitCode::FAILURE);
            }

            let ran = orchestrator.run(RunOptions { dry_run, step }).await?;
            if dry_run {
                println!("{} job(s) would run.", ran.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Rollback { batch, step, force } => {
            if !confirm_production(config, force, "roll back data jobs") {
                return Ok(ExitCode::FAILURE);
            }
            let rolled_back = orchestrator.rollback(RollbackOptions { batch, step }).await?;
            info!("Rolled back {} job(s)", rolled_back.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { pending, ran } => {
            let entries: Vec<_> = orchestrator
                .status()
                .await?
                .into_iter()
                .filter(|e| match (pending, ran) {
                    (true, _) => e.status == JobStatus::Pending,
                    (_, true) => e.status != JobStatus::Pending,
                    _ => true,
                })
                .collect();

            if entries.is_empty() {
                println!("No jobs found.");
                return Ok(ExitCode::SUCCESS);
            }

            println!(
                "{:<48} {:>6} {:<12} {:>10} {:>10}  Ran At",
                "Job", "Batch", "Status", "Rows", "Duration"
            );
            for entry in &entries {
                println!(
                    "{:<48} {:>6} {:<12} {:>10} {:>10}  {}",
                    entry.name,
                    dash(entry.batch),
                    entry.status.as_str(),
                    dash(entry.rows_affected),
                    entry
                        .duration_ms
                        .map_or_else(|| "-".to_string(), |ms| format!("{}ms", ms)),
                    entry
                        .completed_at
                        .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string()),
                );
            }

            let pending_count = entries
                .iter()
                .filter(|e| e.status == JobStatus::Pending)
                .count();
            let failed_count = entries
                .iter()
                .filter(|e| e.status == JobStatus::Failed)
                .count();
            println!();
            println!(
                "Total: {}, Pending: {}, Failed: {}",
                entries.len(),
                pending_count,
                failed_count
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Fresh { force } => {
            if !confirm_production(config, force, "delete every job record and re-run all jobs") {
                return Ok(ExitCode::FAILURE);
            }
            orchestrator.fresh(RunOptions::default()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn confirm_production(config: &Config, force: bool, action: &str) -> bool {
    if force || !config.requires_confirmation() {
        return true;
    }
    warn!("Running in production");
    ask(&format!("You are about to {} in production. Continue?", action))
}

async fn confirm_row_threshold(config: &Config, orchestrator: &Orchestrator) -> AppResult<bool> {
    let threshold = config.jobs.safety.confirm_threshold;
    if threshold == 0 {
        return Ok(true);
    }

    let estimated = orchestrator.estimated_pending_rows().await?;
    if estimated <= threshold {
        return Ok(true);
    }

    warn!("Estimated rows to be affected: {}", estimated);
    warn!("This exceeds the confirmation threshold of {} rows", threshold);
    Ok(ask("Do you wish to continue?"))
}

fn ask(question: &str) -> bool {
    print!("{} [yes/no] ", question);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

fn dash(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
