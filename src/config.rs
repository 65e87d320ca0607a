use crate::cache::DEFAULT_MAX_CACHE_BYTES;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Could not determine a data directory; set TANDEM_DATA_DIR")]
    NoDataDir,
}

/// Application configuration, read once at startup.
/// In debug builds a .env file is loaded first.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Root of the asset store; one subdirectory per content id
    pub cache_dir: PathBuf,
    pub database_path: PathBuf,
    pub max_cache_bytes: u64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Config: Dev mode activated - loaded .env file");
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = match lookup("TANDEM_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("tandem"),
        };

        let cache_dir = lookup("TANDEM_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("files"));

        let database_path = lookup("TANDEM_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("tandem.db"));

        let max_cache_bytes = match lookup("TANDEM_MAX_CACHE_BYTES") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|bytes| *bytes > 0)
                .ok_or(ConfigError::InvalidValue {
                    key: "TANDEM_MAX_CACHE_BYTES",
                    value,
                })?,
            None => DEFAULT_MAX_CACHE_BYTES,
        };

        let ffmpeg_path = lookup("TANDEM_FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe_path = lookup("TANDEM_FFPROBE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffprobe"));

        info!(
            "Config: cache at {} (budget {} bytes), database at {}",
            cache_dir.display(),
            max_cache_bytes,
            database_path.display()
        );

        Ok(Config {
            data_dir,
            cache_dir,
            database_path,
            max_cache_bytes,
            ffmpeg_path,
            ffprobe_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_data_dir() {
        let config = Config::from_lookup(lookup(&[("TANDEM_DATA_DIR", "/tmp/tandem")])).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/tandem/files"));
        assert_eq!(config.database_path, PathBuf::from("/tmp/tandem/tandem.db"));
        assert_eq!(config.max_cache_bytes, DEFAULT_MAX_CACHE_BYTES);
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TANDEM_DATA_DIR", "/d"),
            ("TANDEM_CACHE_DIR", "/c"),
            ("TANDEM_MAX_CACHE_BYTES", "1024"),
            ("TANDEM_FFPROBE_PATH", "/opt/ffprobe"),
        ]))
        .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/c"));
        assert_eq!(config.max_cache_bytes, 1024);
        assert_eq!(config.ffprobe_path, PathBuf::from("/opt/ffprobe"));
    }

    #[test]
    fn test_invalid_budget() {
        let result = Config::from_lookup(lookup(&[
            ("TANDEM_DATA_DIR", "/d"),
            ("TANDEM_MAX_CACHE_BYTES", "lots"),
        ]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                key: "TANDEM_MAX_CACHE_BYTES",
                value: "lots".to_string()
            })
        );
    }
}
