//! tankbot - ISS urine tank level notifications over Telegram
//!
//! Subcommands:
//! - `tankbot run` - Follow the feed and serve Telegram subscribers
//! - `tankbot config` - Print the effective configuration and its sources
//! - `tankbot probe` - Connect to the feed and print a few updates

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tankconf::TankConfig;
use tracing_subscriber::EnvFilter;

use tankbot::{probe, serve};

#[derive(Parser)]
#[command(name = "tankbot")]
#[command(about = "ISS urine tank level notifications over Telegram")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the telemetry feed and serve subscribers
    Run {
        /// Config file (replaces ./tankwatch.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration (token redacted)
    Config {
        /// Config file (replaces ./tankwatch.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Connect to the feed and print the first few updates
    Probe {
        /// Config file (replaces ./tankwatch.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Updates to wait for
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = TankConfig::load_from(config.as_deref()).context("Failed to load configuration")?;
            init_logging(&config.telemetry.log_level);
            serve::run(config).await?;
        }
        Commands::Config { config } => {
            let (config, sources) = TankConfig::load_with_sources_from(config.as_deref())
                .context("Failed to load configuration")?;

            println!("# Sources:");
            if sources.files.is_empty() {
                println!("#   (no config files found, using defaults)");
            }
            for file in &sources.files {
                println!("#   {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("#   env: {}", var);
            }
            println!();
            print!("{}", config.to_toml());

            if let Err(e) = config.validate() {
                eprintln!("\nwarning: {}", e);
            }
        }
        Commands::Probe {
            config,
            count,
            timeout,
        } => {
            let config = TankConfig::load_from(config.as_deref()).context("Failed to load configuration")?;
            init_logging(&config.telemetry.log_level);
            probe::run(&config, count, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}
