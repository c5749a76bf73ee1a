//! # Lease Queue CLI
//!
//! Command-line front end for the lease queue.
//!
//! This module provides CLI commands for:
//! - Producing tasks (`enqueue`) and running the bundled demo (`demo`)
//! - Consuming tasks with a logging worker (`work`)
//! - Inspecting and maintaining the queue (`stats`, `reap`, `quarantine`)
//! - Validating configuration (`config`)
//!
//! Configuration is layered with the `config` crate: `config/lease-queue.yaml`
//! (optional), then the file given with `--config`, then `LQ__` environment
//! variables such as `LQ__QUEUE__MAX_DELIVERY_ATTEMPTS=3`.

use clap::{Parser, Subcommand};
use lease_queue_core::{
    ConfigurationError, Entry, EntryId, LoggingHandler, QueueConfig, QueueError, QueueService,
    Reaper, StorageConfig, Worker, WorkerConfig, WorkerStats,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Tasks enqueued by the `demo` command
pub const DEMO_TASKS: [&str; 4] = [
    "Send welcome email to new user",
    "Process payment for order #12345",
    "Generate monthly sales report",
    "Backup database at midnight",
];

/// Optional configuration file read from the working directory
const DEFAULT_CONFIG_FILE: &str = "config/lease-queue";

/// Prefix of configuration environment variables
const ENV_PREFIX: &str = "LQ";

// ============================================================================
// CLI Structure
// ============================================================================

/// Lease Queue CLI - at-least-once task queue with leases and quarantine
#[derive(Parser)]
#[command(name = "lease-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "At-least-once task queue with leases, retry backoff and quarantine")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Store entries under this directory (overrides the configured storage)
    #[arg(short, long, env = "LQ_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Logging level or filter directive (defaults to RUST_LOG, then "info")
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Add tasks to the queue
    Enqueue {
        /// Task payloads, one entry per argument
        #[arg(required = true, num_args = 1..)]
        payloads: Vec<String>,
    },

    /// Enqueue the four sample tasks and process them until the queue drains
    Demo {
        /// Simulated processing time per task in milliseconds
        #[arg(long, default_value = "2000")]
        processing_ms: u64,
    },

    /// Process tasks until interrupted
    Work {
        /// Simulated processing time per task in milliseconds
        #[arg(long, default_value = "2000")]
        processing_ms: u64,

        /// Stop after handling this many tasks
        #[arg(long)]
        max_tasks: Option<u64>,
    },

    /// Show the number of entries per state
    Stats {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Reclaim expired leases once
    Reap,

    /// Operator actions on quarantined entries
    Quarantine {
        #[command(subcommand)]
        action: QuarantineCommands,
    },

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Quarantine management subcommands
#[derive(Subcommand)]
pub enum QuarantineCommands {
    /// List quarantined entries
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Make a quarantined entry visible again
    Requeue {
        /// Entry ID to requeue
        entry_id: String,
    },

    /// Permanently delete a quarantined entry
    Purge {
        /// Entry ID to purge
        entry_id: String,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error class
    ///
    /// | Code | Class |
    /// |------|-------|
    /// | 1 | configuration |
    /// | 2 | transient queue failure (storage, contention) |
    /// | 3 | rejected queue operation |
    /// | 4 | invalid argument |
    /// | 5 | I/O |
    /// | 6 | command failed |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(QueueError::ConfigurationError(_)) => 1,
            Self::Queue(e) if e.is_transient() => 2,
            Self::Queue(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::CommandFailed { .. } => 6,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),
}

// ============================================================================
// Configuration Types
// ============================================================================

/// CLI configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// Queue behaviour and storage
    pub queue: QueueConfig,

    /// Worker behaviour for `work` and `demo`
    pub worker: WorkerConfig,
}

impl CliConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.worker.validate()?;
        Ok(())
    }
}

/// Build the configuration from files and environment
///
/// Sources, later ones overriding earlier ones:
///  1. `config/lease-queue.yaml` if present
///  2. `explicit_path`, which must exist; format follows the extension
///  3. `LQ__`-prefixed environment variables, `__` separating nested keys
///
/// `data_dir`, when given, replaces the storage section with a filesystem
/// store at that path.
pub fn load_configuration(
    explicit_path: Option<&Path>,
    data_dir: Option<&Path>,
) -> Result<CliConfig, ConfigError> {
    let mut builder = config::Config::builder().add_source(
        config::File::with_name(DEFAULT_CONFIG_FILE)
            .required(false)
            .format(config::FileFormat::Yaml),
    );

    if let Some(path) = explicit_path {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        info!(path = %path.display(), "Loading configuration from explicit path");
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut cli_config: CliConfig = settings.try_deserialize()?;

    if let Some(dir) = data_dir {
        cli_config.queue.storage = StorageConfig::Filesystem {
            path: dir.to_path_buf(),
        };
    }

    cli_config.validate()?;
    Ok(cli_config)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    run(Cli::parse()).await
}

/// Execute an already parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    initialize_logging(cli.log_level.as_deref(), cli.json_logs)?;

    let config = load_configuration(cli.config.as_deref(), cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Enqueue { payloads } => execute_enqueue_command(&config, payloads).await,
        Commands::Demo { processing_ms } => execute_demo_command(&config, processing_ms).await,
        Commands::Work {
            processing_ms,
            max_tasks,
        } => execute_work_command(&config, processing_ms, max_tasks).await,
        Commands::Stats { format } => execute_stats_command(&config, format).await,
        Commands::Reap => execute_reap_command(&config).await,
        Commands::Quarantine { action } => execute_quarantine_command(&config, action).await,
        Commands::Config { show, format } => execute_config_command(&config, show, format),
    }
}

/// Initialize logging to stderr so command output on stdout stays parseable
pub fn initialize_logging(level: Option<&str>, json: bool) -> Result<(), CliError> {
    let filter = match level {
        Some(directive) => {
            EnvFilter::try_new(directive).map_err(|e| CliError::InvalidArgument {
                arg: "log-level".to_string(),
                message: e.to_string(),
            })?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    // A subscriber may already be installed when running inside tests
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }

    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn open_service(config: &CliConfig) -> Result<QueueService, CliError> {
    if config.queue.storage == StorageConfig::InMemory {
        warn!("Using in-memory storage; entries do not outlive this command");
    }
    Ok(QueueService::open(config.queue.clone()).await?)
}

fn parse_entry_id(raw: &str) -> Result<EntryId, CliError> {
    raw.parse().map_err(|e: lease_queue_core::ValidationError| CliError::InvalidArgument {
        arg: "entry_id".to_string(),
        message: e.to_string(),
    })
}

fn worker_config(config: &CliConfig, max_tasks: Option<u64>, stop_when_empty: bool) -> WorkerConfig {
    WorkerConfig {
        max_tasks: max_tasks.or(config.worker.max_tasks),
        stop_when_empty,
        ..config.worker.clone()
    }
}

/// Execute enqueue command
async fn execute_enqueue_command(config: &CliConfig, payloads: Vec<String>) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let ids = service.enqueue_batch(payloads).await?;

    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

/// Execute demo command
async fn execute_demo_command(config: &CliConfig, processing_ms: u64) -> Result<(), CliError> {
    let service = open_service(config).await?;

    let ids = service.enqueue_batch(DEMO_TASKS).await?;
    for (id, task) in ids.iter().zip(DEMO_TASKS) {
        println!("Enqueued {}: {}", id, task);
    }

    let stats = run_worker(
        service,
        worker_config(config, None, true),
        processing_ms,
    )
    .await?;

    println!(
        "Processed {} tasks (acked {}, failed {}, abandoned {})",
        stats.handled(),
        stats.acked,
        stats.failed,
        stats.abandoned
    );
    Ok(())
}

/// Execute work command
async fn execute_work_command(
    config: &CliConfig,
    processing_ms: u64,
    max_tasks: Option<u64>,
) -> Result<(), CliError> {
    let service = open_service(config).await?;

    let stats = run_worker(
        service,
        worker_config(config, max_tasks, config.worker.stop_when_empty),
        processing_ms,
    )
    .await?;

    println!(
        "Processed {} tasks (acked {}, failed {}, abandoned {})",
        stats.handled(),
        stats.acked,
        stats.failed,
        stats.abandoned
    );
    Ok(())
}

/// Run a logging worker alongside a reaper until it finishes or a signal arrives
async fn run_worker(
    service: QueueService,
    worker_config: WorkerConfig,
    processing_ms: u64,
) -> Result<WorkerStats, CliError> {
    let handler = Arc::new(LoggingHandler::new(std::time::Duration::from_millis(
        processing_ms,
    )));
    let worker = Worker::new(service.clone(), handler, worker_config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(service).spawn(shutdown_rx.clone());
    let worker = worker.spawn(shutdown_rx);
    tokio::pin!(worker);

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = shutdown_signal() => {
            info!("Shutdown requested, finishing the current task");
            let _ = shutdown_tx.send(true);
            (&mut worker).await
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper.await {
        warn!(error = %e, "Reaper task did not stop cleanly");
    }

    let stats = joined.map_err(|e| CliError::CommandFailed {
        message: format!("worker task failed: {}", e),
    })??;
    Ok(stats)
}

/// Resolve when Ctrl+C or SIGTERM is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Execute stats command
async fn execute_stats_command(config: &CliConfig, format: OutputFormat) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let counts = service.stats().await?;

    match format {
        OutputFormat::Text => {
            println!("visible:     {}", counts.visible);
            println!("leased:      {}", counts.leased);
            println!("quarantined: {}", counts.quarantined);
            println!("total:       {}", counts.total());
        }
        OutputFormat::Json => println!("{}", to_json(&counts)?),
    }
    Ok(())
}

/// Execute reap command
async fn execute_reap_command(config: &CliConfig) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let reclaimed = service.reap_expired().await?;
    println!("Reclaimed {} expired leases", reclaimed);
    Ok(())
}

/// Execute quarantine command
async fn execute_quarantine_command(
    config: &CliConfig,
    action: QuarantineCommands,
) -> Result<(), CliError> {
    match action {
        QuarantineCommands::List { format } => {
            let service = open_service(config).await?;
            let entries = service.list_quarantined().await?;
            match format {
                OutputFormat::Text => {
                    for entry in &entries {
                        println!("{}", describe_entry(entry));
                    }
                }
                OutputFormat::Json => println!("{}", to_json(&entries)?),
            }
        }
        QuarantineCommands::Requeue { entry_id } => {
            let id = parse_entry_id(&entry_id)?;
            let service = open_service(config).await?;
            let entry = service.requeue_quarantined(id).await?;
            println!(
                "Requeued {} (delivery count {})",
                entry.id(),
                entry.delivery_count()
            );
        }
        QuarantineCommands::Purge { entry_id } => {
            let id = parse_entry_id(&entry_id)?;
            let service = open_service(config).await?;
            service.purge_quarantined(id).await?;
            println!("Purged {}", id);
        }
    }
    Ok(())
}

/// One-line summary of an entry for text output
pub fn describe_entry(entry: &Entry) -> String {
    let payload = match std::str::from_utf8(entry.payload()) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes>", entry.payload().len()),
    };
    format!(
        "{}  deliveries={}  enqueued={}  {}",
        entry.id(),
        entry.delivery_count(),
        entry.enqueued_at(),
        payload
    )
}

/// Execute config command
fn execute_config_command(config: &CliConfig, show: bool, format: ConfigFormat) -> Result<(), CliError> {
    if show {
        let rendered = match format {
            ConfigFormat::Yaml => {
                serde_yaml::to_string(config).map_err(|e| CliError::CommandFailed {
                    message: format!("failed to render configuration: {}", e),
                })?
            }
            ConfigFormat::Json => to_json(config)?,
        };
        println!("{}", rendered.trim_end());
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::CommandFailed {
        message: format!("failed to render JSON: {}", e),
    })
}
