use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_compact_after() -> usize {
    64
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,

    /// `EnvFilter` directive used when IDHINI_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// WAL frames after which a command compacts on exit, 0 disables
    #[serde(default = "default_compact_after")]
    pub compact_after: usize,
}

impl Config {
    /// Get (~/.idhini)
    pub fn idhini_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".idhini"))
    }

    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::idhini_dir()?.join("default.idhini"))
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::idhini_dir()?.join("config.json"))
    }

    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::config_file()?;

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Config {
                db_path: Self::default_db_path()?,
                log_level: default_log_level(),
                compact_after: default_compact_after(),
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }
}
