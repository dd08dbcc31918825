use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use appliance_builder::plugins::register_builtins;
use appliance_builder::{Appliance, BuildConfig, PluginRegistry};

/// Build a virtual machine appliance from a definition file.
#[derive(Debug, Parser)]
#[command(name = "appliance-builder", version, about)]
struct Cli {
    /// Appliance definition file.
    definition: PathBuf,

    /// Configuration file (default: ~/.appliance-builder/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remove previous build output before building.
    #[arg(long)]
    force: bool,

    /// Platform plugin to convert the image with.
    #[arg(long)]
    platform: Option<String>,

    /// Delivery plugin to ship the result with.
    #[arg(long)]
    delivery: Option<String>,

    /// Root directory for build output.
    #[arg(long, default_value = "build")]
    build_root: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("appliance_builder={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = BuildConfig::load(cli.config.as_deref())?;
    if cli.force {
        config.force = true;
    }
    if cli.platform.is_some() {
        config.platform = cli.platform.clone();
    }
    if cli.delivery.is_some() {
        config.delivery = cli.delivery.clone();
    }

    let mut registry = PluginRegistry::new();
    register_builtins(&mut registry)?;

    let appliance = Appliance::new(&registry, config, &cli.build_root);
    let outcome = appliance.create(&cli.definition)?;

    println!("Build finished. Deliverables:");
    for path in &outcome.result.deliverables {
        println!("  {}", path.display());
    }
    if outcome.delivered {
        println!("Appliance delivered.");
    }
    Ok(())
}
