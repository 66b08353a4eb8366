use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use anomalyd::config::AppConfig;
use anomalyd::pipeline::Pipeline;
use anomalyd::sink::memory;
use anomalyd::storage::{self, dead_letter::DeadLetterStore};

#[derive(Parser)]
#[command(
    name = "anomalyd",
    about = "Streaming telemetry anomaly detection daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $ANOMALYD_CONFIG, then /etc/anomalyd/anomalyd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (pipeline + health/metrics API)
    Serve {
        /// Bind address, overrides [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate the configuration and exit
    CheckConfig,

    /// Inspect or replay dead-lettered batches
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List dead-lettered batches
    List {
        #[arg(long, default_value = "50")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Deliver dead-lettered batches again; delivered ones are removed
    Replay {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::load_or_default()),
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "starting anomalyd");
            anomalyd::serve(config).await?;
        }
        Commands::CheckConfig => {
            config.validate().context("configuration is invalid")?;
            // The daemon has no embedding program to supply a handler or bus.
            memory::from_config(&config.memory, None, config.pipeline.delivery_timeout())
                .context("memory mode cannot be served standalone")?;
            println!(
                "Configuration OK: {} detector(s), {} source(s), memory mode {:?}",
                config.detectors.len(),
                config.sources.len(),
                config.memory.mode
            );
        }
        Commands::DeadLetter { action } => match action {
            DeadLetterAction::List { limit, json } => {
                let store = DeadLetterStore::new(storage::open_pool(&config.storage.path)?);
                let letters = store.list(limit)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&letters)?);
                } else if letters.is_empty() {
                    println!("No dead-lettered batches.");
                } else {
                    println!(
                        "{:<36} | {:<6} | {:<8} | {:<25} | Last error",
                        "Batch", "Events", "Attempts", "Dead-lettered at"
                    );
                    println!("{:-<36}-|-{:-<6}-|-{:-<8}-|-{:-<25}-|-{:-<20}", "", "", "", "", "");
                    for letter in letters {
                        println!(
                            "{:<36} | {:<6} | {:<8} | {:<25} | {}",
                            letter.batch.batch_id,
                            letter.batch.len(),
                            letter.attempts,
                            letter.created_at.to_rfc3339(),
                            letter.last_error
                        );
                    }
                }
            }
            DeadLetterAction::Replay { limit } => {
                let pipeline = Pipeline::builder(config).build()?;
                let report = pipeline.context().sink.replay_dead_letters(limit).await?;
                println!(
                    "Replayed dead letters: {} delivered, {} still failing",
                    report.delivered, report.failed
                );
            }
        },
    }

    Ok(())
}
