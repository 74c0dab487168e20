//! `split-sync` binary entry point.
//!
//! Loads the configuration file, installs the logger and runs the agent until the process is
//! killed.
use std::path::PathBuf;

use clap::Parser;
use split_sync::{Agent, AgentConfig, Collaborators, Error, Mode};

/// Keeps split and segment caches in sync and relays SDK telemetry.
#[derive(Parser, Debug)]
#[command(name = "split-sync", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "splitio.agent.conf.json", env = "SPLIT_SYNC_CONFIG")]
    config: PathBuf,

    /// Run as a proxy with an embedded store instead of writing into Redis
    #[arg(long)]
    proxy: bool,

    /// Write a configuration file with default values to this path and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,

    /// API key (overrides config file)
    #[arg(long, env = "SPLIT_SYNC_API_KEY")]
    api_key: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(path) = cli.write_default_config {
        std::fs::write(&path, AgentConfig::default().to_json_pretty()?)?;
        println!("Default configuration written to {}", path.display());
        return Ok(());
    }

    let (mut config, missing_file) = match AgentConfig::from_file(&cli.config) {
        Ok(config) => (config, false),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            (AgentConfig::default(), true)
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(api_key) = cli.api_key {
        config.api_key = api_key;
    }

    env_logger::Builder::new()
        .filter_level(config.log.level_filter())
        .parse_default_env()
        .init();

    if missing_file {
        log::warn!(target: "split_sync", path:? = cli.config; "configuration file not found, using defaults");
    }
    config.validate()?;

    let mode = if cli.proxy { Mode::Proxy } else { Mode::Producer };
    log::info!(target: "split_sync", version = env!("CARGO_PKG_VERSION"), mode:% = mode; "starting split-sync");

    let collaborators = Collaborators::from_config(mode, &config)?;
    let _agent = Agent::start(mode, &config, collaborators)?;

    // Tasks run on their own threads; keep the process alive.
    loop {
        std::thread::park();
    }
}
