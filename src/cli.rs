use crate::config::loader::SupervisorConfig;
use crate::sandbox::{SandboxLevel, SandboxLevelDetector};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flatpak portal supervisor diagnostics", long_about = None)]
struct Cli {
    /// Supervisor configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report how strictly this process is sandboxed
    Level {
        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
        /// Override the Flatpak instance descriptor path
        #[arg(long)]
        info_path: Option<PathBuf>,
    },
    /// Load and validate a configuration file, then print the effective values
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SupervisorConfig::default(),
    };
    config
        .with_env_overrides()
        .context("invalid environment override")
}

/// Text printed by `portalbox level`.
pub fn render_level(level: SandboxLevel, json: bool) -> Result<String> {
    if json {
        let value = serde_json::json!({
            "level": level,
            "sandboxed": level.is_sandboxed(),
        });
        return Ok(serde_json::to_string(&value)?);
    }
    Ok(match level {
        SandboxLevel::None => "none".to_string(),
        SandboxLevel::Flatpak => "flatpak".to_string(),
        SandboxLevel::Restricted => "restricted".to_string(),
    })
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Level { json, info_path } => {
            let config = load_config(cli.config.as_ref())?;
            let info_path = info_path.unwrap_or(config.flatpak_info_path);
            let detector = SandboxLevelDetector::new(info_path, config.disable_full_sandbox);
            println!("{}", render_level(detector.level(), json)?);
            Ok(())
        }
        Commands::CheckConfig { path } => {
            let config = load_config(Some(&path))?;
            eprintln!("Configuration {} is valid", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
