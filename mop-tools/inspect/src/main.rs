//! mop-inspect binary
//!
//! Run with: `mop-inspect run <SCHEMA> [--trace] [--config FILE]`

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use mop_inspect::{run, Schema};
use mop_runtime::RuntimeConfig;

#[derive(Parser)]
#[command(name = "mop-inspect")]
#[command(about = "Run dispatch schemas against the meta-object runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (TOML)
    #[arg(short = 'c', long, global = true, env = "MOP_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Declare the schema's types and members, run its calls, print JSON
    Run {
        /// Schema file
        #[arg(value_name = "SCHEMA")]
        schema: PathBuf,

        /// Include resolution trace events in the output
        #[arg(short, long)]
        trace: bool,
    },
    /// Print the effective runtime configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run { schema, trace } => {
            debug!("Running schema: {}", schema.display());
            let parsed = Schema::load(schema)
                .with_context(|| format!("Failed to load schema: {}", schema.display()))?;
            let report = run(&parsed, config, *trace)
                .with_context(|| format!("Failed to apply schema: {}", schema.display()))?;

            for warning in &report.warnings {
                warn!("{}", warning);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.calls.iter().any(|c| c.error.is_some()) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}
