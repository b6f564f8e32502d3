//! `weft config`

use std::path::Path;

use anyhow::{Context, Result};
use weft_core::WeftConfig;

use super::ConfigCommand;

fn masked(config: &WeftConfig) -> WeftConfig {
    let mut shown = config.clone();
    if let Some(key) = shown.llm.api_key.as_mut() {
        let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        *key = format!("****{}", tail);
    }
    shown
}

pub fn handle_config(cmd: &ConfigCommand, config: &WeftConfig, explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => WeftConfig::default_path(),
    };

    match cmd {
        ConfigCommand::Path => match path {
            Some(path) => println!("{}", path.display()),
            None => println!("No config directory is available on this platform."),
        },
        ConfigCommand::Show => {
            let rendered = toml::to_string_pretty(&masked(config)).context("Failed to render config")?;
            print!("{}", rendered);
        }
        ConfigCommand::Init => {
            let path = path.context("No config directory is available on this platform")?;
            if path.exists() {
                println!("Config already exists at {}", path.display());
            } else {
                WeftConfig::default().save(&path)?;
                println!("Wrote default config to {}", path.display());
            }
        }
    }
    Ok(())
}
