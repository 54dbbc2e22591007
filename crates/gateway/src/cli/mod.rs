//! Command-line surface. `relay` with no subcommand serves; the other
//! subcommands are operational helpers around the same `Config`.

pub mod config;
pub mod doctor;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_domain::Config;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Multi-backend CLI-agent gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway service (default if no subcommand is given).
    Serve,
    /// Validate configuration and probe backend binaries.
    Doctor,
    /// Inspect or validate the resolved configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration as TOML.
    Show,
    /// Run `Config::validate` and print any issues.
    Validate,
}

/// Resolves the config file path from `RELAY_CONFIG` (default `config.toml`),
/// loads it (or falls back to defaults), and applies environment overrides.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
    let config = Config::load(&PathBuf::from(&path))?;
    Ok((config, path))
}
