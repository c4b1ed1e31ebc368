//! admission-gate CLI entry point.

mod cli;

use admission_gate::config::GateConfig;
use admission_gate::roster::{source_from_config, Lookup, RosterCache, RosterPolicy};
use admission_gate::verify::LabelFormat;
use admission_gate::OperatorLog;
use clap::Parser;
use cli::{Cli, Command, LogFormat};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    info!("admission-gate v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config()?;

    match cli.command {
        Command::Validate { label } => validate(&config, &label)?,
        Command::Check { label } => check(&config, &label).await?,
        Command::Roster => roster(&config).await?,
    }
    Ok(())
}

fn validate(config: &GateConfig, label: &str) -> color_eyre::Result<()> {
    let format = LabelFormat::from_config(&config.format)?;
    match format.validate(label) {
        Ok(id) => println!("valid: application id {id}"),
        Err(e) => println!("invalid: {e}"),
    }
    Ok(())
}

async fn check(config: &GateConfig, label: &str) -> color_eyre::Result<()> {
    let format = LabelFormat::from_config(&config.format)?;
    let id = match format.validate(label) {
        Ok(id) => id,
        Err(e) => {
            println!("invalid: {e}");
            return Ok(());
        }
    };

    let cache = open_roster(config)?;
    match cache.lookup(id.as_str()).await? {
        Lookup::Present => println!("{id} is on the roster"),
        Lookup::Absent => println!("{id} is not on the roster"),
    }
    Ok(())
}

async fn roster(config: &GateConfig) -> color_eyre::Result<()> {
    let cache = open_roster(config)?;
    let entries = cache.init().await?;
    println!("roster holds {entries} entries");
    Ok(())
}

fn open_roster(config: &GateConfig) -> color_eyre::Result<RosterCache> {
    let source = source_from_config(&config.roster)?;
    Ok(RosterCache::new(
        source,
        RosterPolicy::from(&config.roster),
        OperatorLog::detached(),
    ))
}
