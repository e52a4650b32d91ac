use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unified_thinking_storage::{
    config::{Config, LogFormat},
    storage::{close_storage, new_storage, ThinkingMode},
};

/// Inspect a unified-thinking store.
#[derive(Debug, Parser)]
#[command(name = "unified-thinking-storage", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print usage metrics
    Metrics,
    /// Search thoughts, newest first
    Search {
        /// Words to match (any of them)
        #[arg(default_value = "")]
        query: String,
        /// Restrict to one thinking mode
        #[arg(long, value_parser = parse_mode)]
        mode: Option<ThinkingMode>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List branches, newest first
    Branches,
}

fn parse_mode(raw: &str) -> Result<ThinkingMode, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    config.storage.prepare_data_dir()?;

    let storage = match new_storage(&config.storage).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to initialize storage");
            return Err(e.into());
        }
    };

    let output = match cli.command {
        Command::Metrics => serde_json::to_string_pretty(&storage.get_metrics().await?)?,
        Command::Search {
            query,
            mode,
            limit,
            offset,
        } => serde_json::to_string_pretty(
            &storage.search_thoughts(&query, mode, limit, offset).await?,
        )?,
        Command::Branches => serde_json::to_string_pretty(&storage.list_branches().await?)?,
    };
    println!("{}", output);

    close_storage(storage.as_ref()).await;
    info!("Done");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
