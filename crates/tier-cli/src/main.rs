use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod repl;

use commands::{run_demo, show_catalog_file};
use config::TopologyConfig;
use repl::Repl;

#[derive(Parser)]
#[command(name = "tq")]
#[command(author, version, about = "Query one relation across storage tiers and move partitions between them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the three-tier walkthrough
    Demo,

    /// Start interactive REPL
    Repl {
        /// Topology file (JSON); the built-in demo topology when absent
        #[arg(short, long)]
        topology: Option<PathBuf>,
    },

    /// Validate and print a persisted catalog
    Catalog {
        /// Catalog file written by a topology's `catalog_file`
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write the demo topology to a file as a starting point
    InitTopology {
        #[arg(short, long, default_value = "topology.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    print_banner();

    match cli.command {
        Some(Commands::Demo) => run_demo().await?,
        Some(Commands::Repl { topology }) => start_repl(topology).await?,
        Some(Commands::Catalog { file }) => show_catalog_file(&file)?,
        Some(Commands::InitTopology { output }) => {
            TopologyConfig::demo().save(&output)?;
            println!("{} Wrote {}", "✓".bright_green(), output.display());
        }
        None => start_repl(None).await?,
    }

    Ok(())
}

async fn start_repl(topology: Option<PathBuf>) -> Result<()> {
    let config = match topology {
        Some(path) => TopologyConfig::from_file(&path)?,
        None => TopologyConfig::demo(),
    };
    let topology = config.build().await?;
    let _reaper = topology
        .relation
        .spawn_pool_reaper(config.federation.pool.idle_timeout());

    let mut repl = Repl::new(topology)?;
    repl.run().await
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "tier_cli=debug,tier_federation=debug,tier_core=debug,tier_storage=debug"
    } else {
        "tier_cli=info,tier_federation=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
  _____ _             _
 |_   _(_) ___ _ __  | |_ __ _
   | | | |/ _ \ '__| | __/ _` |
   | | | |  __/ |    | || (_| |
   |_| |_|\___|_|     \__\__, |
                            |_|
    "#
        .bright_cyan()
    );
    println!("{}", "Tiered Query Federation v0.1.0".bright_yellow());
    println!("{}", "Type 'help' for available commands\n".bright_black());
}
