//! `opsboard config`: effective sync configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use opsboard_core::config;

/// Arguments for `opsboard config`.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Home directory to read `.opsboard/config.yaml` from (defaults to `$HOME`).
    #[arg(long)]
    pub home: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn run(self) -> Result<()> {
        let home = match self.home {
            Some(home) => home,
            None => dirs::home_dir().context("could not determine home directory")?,
        };
        let path = config::config_path_at(&home);
        let cfg = config::load_at(&home)
            .with_context(|| format!("failed to load {}", path.display()))?;

        let source = if path.exists() {
            path.display().to_string()
        } else {
            format!("{} (not found, defaults)", path.display())
        };
        println!("{} {}", "config:".bold(), source);
        print!(
            "{}",
            serde_yaml::to_string(&cfg).context("failed to serialize config")?
        );
        Ok(())
    }
}
