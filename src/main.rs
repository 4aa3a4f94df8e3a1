//! ragweave CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use ragweave::{
    agent::AgentKind,
    commands::{
        cmd_ingest, cmd_init, cmd_query, cmd_status, print_answer, print_ingest_report,
        print_status, IngestOptions, QueryOptions,
    },
    config::Config,
    error::Result,
    models::RunStatus,
    progress::LogWriterFactory,
    strategy::StrategyKind,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ragweave")]
#[command(version, about = "Multi-strategy RAG over repository docs and record graphs", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "RAGWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the working database
    Init {
        /// Base directory (default: ~/.ragweave)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Ingest sources into one strategy
    ///
    /// The doc agent takes comma-separated repository URLs; the inh agent takes
    /// a record source: a directory, persons=<file>,properties=<file>, or sqlite://<path>
    Ingest {
        /// Agent: doc or inh
        agent: String,

        /// Strategy: nv (naive), lr (graph-hybrid) or gr (temporal-graph)
        strategy: String,

        /// Sources to ingest
        sources: String,
    },

    /// Answer a question through one strategy
    Query {
        /// Agent: doc or inh
        agent: String,

        /// Strategy: nv (naive), lr (graph-hybrid) or gr (temporal-graph)
        strategy: String,

        /// The question
        question: String,

        /// Number of context items to retrieve
        #[arg(short)]
        k: Option<usize>,

        /// Answer as of a time: RFC 3339, YYYY-MM-DD, YYYY-MM or YYYY
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Show per-strategy totals and the last ingestion run
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { dir, force } => {
            let config = cmd_init(dir, force).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "config": config.paths.config_file,
                        "database": config.paths.db_file,
                    })
                );
            } else {
                println!("✓ ragweave initialized");
                println!("  Config: {}", config.paths.config_file.display());
                println!("  Database: {}", config.paths.db_file.display());
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ragweave", &mut std::io::stdout());
        }

        Commands::Ingest {
            agent,
            strategy,
            sources,
        } => {
            let config = load_config(cli.config)?;
            let options = IngestOptions {
                agent: agent.parse::<AgentKind>()?,
                strategy: strategy.parse::<StrategyKind>()?,
                sources,
                show_progress: !cli.json,
            };

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing documents already in flight");
                    on_interrupt.cancel();
                }
            });

            let report = cmd_ingest(&config, options, cancel).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_ingest_report(&report);
            }
            if report.status == RunStatus::Cancelled {
                return Ok(130);
            }
        }

        Commands::Query {
            agent,
            strategy,
            question,
            k,
            as_of,
        } => {
            let config = load_config(cli.config)?;
            let options = QueryOptions {
                agent: agent.parse::<AgentKind>()?,
                strategy: strategy.parse::<StrategyKind>()?,
                k,
                as_of,
            };

            let answer = cmd_query(&config, &question, options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&question, &answer);
            }
        }

        Commands::Status => {
            let config = load_config(cli.config)?;
            let status = cmd_status(&config).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    Ok(0)
}

/// An explicit config path must exist; otherwise defaults apply under ~/.ragweave
fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Config::load_from(None),
    }
}
