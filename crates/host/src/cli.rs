//! Command-line surface and configuration loading.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use hm_domain::config::Config;
use hm_domain::{Error, Result};

#[derive(Parser)]
#[command(name = "hivemind", about = "Local multi-agent coding assistant", version)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the interactive chat (default).
    Chat,
    /// Print the version and exit.
    Version,
    /// Validate the configuration and exit non-zero on errors.
    ConfigCheck,
}

/// Default config location: `~/.hivemind/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hivemind")
        .join("config.json")
}

/// Load the configuration. A missing file yields defaults; a malformed
/// one is an error.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<(Config, PathBuf)> {
    let path = explicit
        .cloned()
        .unwrap_or_else(default_config_path);
    if !path.is_file() {
        if explicit.is_some() {
            return Err(Error::Config(format!("config not found: {}", path.display())));
        }
        return Ok((Config::default(), path));
    }
    let raw = fs::read_to_string(&path)?;
    let config: Config = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_default_config_yields_defaults() {
        let (config, _) = load_config(None).unwrap();
        assert!(config.memory.enabled);
    }

    #[test]
    fn explicit_missing_config_errors() {
        let path = PathBuf::from("/nonexistent/config.json");
        assert!(matches!(
            load_config(Some(&path)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn json_config_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"memory": {"memory_md_max_chars": 1234}, "runtime": {"max_steps": 7}}"#,
        )
        .unwrap();
        let (config, loaded_from) = load_config(Some(&path)).unwrap();
        assert_eq!(config.memory.memory_md_max_chars, 1234);
        assert_eq!(config.runtime.max_steps, 7);
        assert_eq!(loaded_from, path);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
