use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::str;
use directories_next::ProjectDirs;
use log::{info, warn};
use tokio::fs;

use crate::config::types::Config;
use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "ble-manager.json";

// a config file next to the executable wins, which is handy for portable installs
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // /opt/ble-manager => /opt/ble-manager.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// an os dependent standard directory, such as ~/.config/ble-manager on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "ble-manager", "ble-manager").map(|dirs| {
        dirs.config_dir().join(CONFIG_FILE_NAME)
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        if path.is_file() {
            return Ok(path);
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    /// Use `path` if given, otherwise the portable or per-user location.
    pub fn new(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_config_path()?,
        };
        Ok(ConfigIO { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or empty file yields the default config.
    pub async fn read(&self) -> Result<Config, ConfigError> {
        info!("Reading config file {}", self.path.to_string_lossy());

        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(source) => {
                let err = ConfigError::from(source);
                if err.is_file_not_found_error() {
                    info!("No config file, using defaults");
                    return Ok(Config::default());
                }
                return Err(err);
            },
        };

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        info!("Saving config to {}", self.path.to_string_lossy());

        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory).await?;
        }

        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}
