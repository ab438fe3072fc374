use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fxjoin::config::EngineConfig;
use fxjoin::federation::FederationEngine;
use fxjoin::index::load_fixture;
use fxjoin::query::ComposedQuery;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fxjoin")]
#[command(about = "Federated join queries over full-text index cores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a composed query and print the response as JSON
    Run {
        /// Fixture file describing the cores and their segments
        #[arg(long)]
        cores: PathBuf,

        /// Composed query file
        #[arg(long)]
        query: PathBuf,

        /// Pretty-print the response
        #[arg(short, long)]
        pretty: bool,
    },
    /// Show segment and document counts of every core
    Stats {
        #[arg(long)]
        cores: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            cores,
            query,
            pretty,
        } => {
            let engine = open_engine(config, &cores)?;
            let text = fs::read_to_string(&query)
                .with_context(|| format!("failed to read query {}", query.display()))?;
            let request: ComposedQuery = serde_json::from_str(&text)
                .with_context(|| format!("invalid composed query in {}", query.display()))?;
            let response = engine.execute(&request)?;
            let out = if pretty {
                serde_json::to_string_pretty(&response)?
            } else {
                serde_json::to_string(&response)?
            };
            println!("{}", out);
        }
        Commands::Stats { cores } => {
            let engine = open_engine(config, &cores)?;
            println!("{:<20} {:>10} {:>12}", "CORE", "SEGMENTS", "DOCS");
            for core in engine.stats() {
                println!("{:<20} {:>10} {:>12}", core.name, core.segments, core.docs);
            }
        }
    }

    Ok(())
}

fn open_engine(config: EngineConfig, fixture: &Path) -> Result<FederationEngine> {
    let cores = load_fixture(fixture)
        .with_context(|| format!("failed to load cores from {}", fixture.display()))?;
    let mut engine = FederationEngine::new(config)?;
    for core in cores {
        engine.register(Arc::new(core))?;
    }
    Ok(engine)
}
