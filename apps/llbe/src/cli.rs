use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "llbe", version)]
#[command(about = "Low-latency relay between the signaling backend, browser sessions and the robot")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (JSON)
    #[arg(short, long, env = "LLBE_CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a configuration file with every default filled in
    InitConfig {
        /// Where to write the file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load, apply environment overrides and validate, then print the result
    CheckConfig,
}

/// Loads the effective configuration: the file if present (defaults
/// otherwise), then `LLBE_*` environment overrides, then validation.
/// Logging is not up yet when this runs, so callers report a missing file.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load_from_file(path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default()
        .save_to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

pub fn check_config(path: &Path) -> Result<()> {
    if !path.exists() {
        eprintln!("{} not found; showing defaults", path.display());
    }
    let config = load_config(path)?;
    println!("{}", config.to_json_string()?);
    Ok(())
}
