use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{command, mailer, Controller, JobRegistry, SqliteStore, Store};

mod commands;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Periodic job scheduler")]
struct Cli {
    /// Path to cadence.toml (defaults to ~/.cadence/cadence.toml)
    #[arg(long, env = "CADENCE_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scheduler tick and wait for the jobs it started
    Tick,
    /// Tick on an interval until Ctrl-C
    Serve,
    /// List job definitions with their next run
    Jobs,
    /// Show recent runs of a job
    History {
        namespace: String,
        name: String,
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Show one run, including its full output
    Show {
        /// Schedule instance id
        id: String,
    },
    /// Run a job now, outside its cron cadence
    Run { namespace: String, name: String },
    /// Run one scheduled instance by id
    RunInstance {
        /// Schedule instance id
        id: String,
    },
    /// Edit a job definition
    Configure {
        namespace: String,
        name: String,
        /// Five-field cron expression
        #[arg(long)]
        cron: Option<String>,
        /// Days to keep reported runs (0 keeps them forever)
        #[arg(long)]
        retention_days: Option<u32>,
        /// Digest recipients, comma separated (empty string clears them)
        #[arg(long)]
        recipients: Option<String>,
        /// Minimum days between two digests
        #[arg(long)]
        digest_days: Option<u32>,
        /// Only mail runs that reported errors
        #[arg(long)]
        error_only: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    if let Err(e) = ensure_parent_dir(db_path) {
        warn!(path = %db_path, "cannot create database directory: {e}");
    }
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(db_path)?);

    let mut registry = JobRegistry::new();
    command::register_commands(&mut registry, &config.jobs);
    let registry = Arc::new(registry);

    let controller = Controller::new(
        store,
        registry,
        Arc::from(mailer::from_config(&config.mail)?),
        config.scheduler.max_concurrent_jobs,
    );

    match cli.command {
        Command::Tick => commands::tick(&controller).await,
        Command::Serve => commands::serve(&controller, config.scheduler.tick_secs).await,
        Command::Jobs => commands::jobs(&controller),
        Command::History {
            namespace,
            name,
            limit,
        } => commands::history(&controller, &namespace, &name, limit),
        Command::Show { id } => commands::show(&controller, &id),
        Command::Run { namespace, name } => commands::run(&controller, &namespace, &name).await,
        Command::RunInstance { id } => commands::run_instance(&controller, &id).await,
        Command::Configure {
            namespace,
            name,
            cron,
            retention_days,
            recipients,
            digest_days,
            error_only,
        } => commands::configure(
            &controller,
            &namespace,
            &name,
            cadence_scheduler::types::DefinitionUpdate {
                cron_expression: cron,
                retention_days,
                recipients: recipients
                    .as_deref()
                    .map(cadence_scheduler::types::parse_recipients),
                digest_days,
                error_only,
            },
        ),
    }
}

fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}
