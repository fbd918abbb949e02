use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_ID: &str = "phototags";
pub const DB_FILE_NAME: &str = "tags.sqlite3";

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "PHOTOTAGS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityProviderType {
    /// Platform provider where one exists (inode identity on Unix)
    #[default]
    Auto,
    /// Path matching only
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub provider: IdentityProviderType,

    /// Directory levels searched around a bookmarked file's last known path.
    #[serde(default = "default_bookmark_search_depth")]
    pub bookmark_search_depth: usize,
}

fn default_bookmark_search_depth() -> usize {
    2
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: IdentityProviderType::default(),
            bookmark_search_depth: default_bookmark_search_depth(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_ID)
        .join(DB_FILE_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            database: DatabaseConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)
            .with_context(|| format!("writing {}", config_path.display()))?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => config_dir().join("config.toml"),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_ID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "db_path = \"/tmp/elsewhere.sqlite3\"\n[identity]\nprovider = \"none\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/elsewhere.sqlite3"));
        assert_eq!(config.identity.provider, IdentityProviderType::None);
        assert_eq!(config.identity.bookmark_search_depth, 2);
        assert_eq!(config.database.busy_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            db_path: dir.path().join("tags.sqlite3"),
            database: DatabaseConfig { busy_timeout_ms: 250 },
            identity: IdentityConfig {
                provider: IdentityProviderType::None,
                bookmark_search_depth: 4,
            },
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[identity]\nprovider = \"bogus\"\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
