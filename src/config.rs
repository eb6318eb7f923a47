//! Runtime configuration (`~/.meetboard/config.json`).
//!
//! Environment variables override file values:
//! `MEETBOARD_USE_DATABASE`, `MEETBOARD_DATABASE_URL`, `MEETBOARD_BACKUP_PATH`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditContext, DEFAULT_ACTOR};
use crate::db::{DbError, MeetingDb};
use crate::flatfile::{row::parse_bool, FlatFileStore, RetryPolicy};
use crate::sync::{Dashboard, SyncCoordinator};

pub const ENV_USE_DATABASE: &str = "MEETBOARD_USE_DATABASE";
pub const ENV_DATABASE_URL: &str = "MEETBOARD_DATABASE_URL";
pub const ENV_BACKUP_PATH: &str = "MEETBOARD_BACKUP_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find home directory")]
    NoHomeDir,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("useDatabase is set but no databaseUrl is configured")]
    MissingDatabaseUrl,

    #[error(transparent)]
    Database(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Use the relational store as primary. Off means the flat file alone.
    #[serde(default)]
    pub use_database: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default)]
    pub lock_retry: RetryPolicy,
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_database: false,
            database_url: None,
            backup_path: None,
            actor: default_actor(),
            lock_retry: RetryPolicy::default(),
        }
    }
}

/// `~/.meetboard`
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".meetboard"))
}

/// Get the canonical config file path (~/.meetboard/config.json)
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(state_dir()?.join("config.json"))
}

impl Config {
    /// Load from `path` (or the canonical location), then apply environment
    /// overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };
        let mut config = Self::from_file(&path)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment variables, looked up via `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_USE_DATABASE) {
            self.use_database = parse_bool(&value).ok_or(ConfigError::InvalidEnv {
                var: ENV_USE_DATABASE,
                value,
            })?;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(path) = lookup(ENV_BACKUP_PATH).filter(|v| !v.trim().is_empty()) {
            self.backup_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Flat-file location, defaulting to `~/.meetboard/meetings.csv`.
    pub fn resolved_backup_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.backup_path {
            Some(p) => Ok(p.clone()),
            None => Ok(state_dir()?.join("meetings.csv")),
        }
    }

    pub fn audit_context(&self) -> AuditContext {
        AuditContext::new(self.actor.clone())
    }

    /// Build the coordinator this configuration describes. Does not connect:
    /// an unreachable database only shows up on first use.
    pub fn open(&self) -> Result<Dashboard, ConfigError> {
        let backup = FlatFileStore::new(self.resolved_backup_path()?).with_retry(self.lock_retry);
        if !self.use_database {
            log::info!("Relational backend disabled; using {}", backup.path().display());
            return Ok(SyncCoordinator::backup_only(backup));
        }
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        let db = MeetingDb::new(url)?;
        log::info!(
            "Relational backend {:?} with backup {}",
            db.target(),
            backup.path().display()
        );
        Ok(SyncCoordinator::new(db, backup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.use_database);
    }

    #[test]
    fn test_parse_camel_case_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "useDatabase": true,
                "databaseUrl": "sqlite:///srv/meetings.db",
                "backupPath": "/srv/meetings.csv",
                "actor": "dana",
                "lockRetry": { "maxAttempts": 2 }
            }"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.use_database);
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///srv/meetings.db"));
        assert_eq!(config.actor, "dana");
        assert_eq!(config.lock_retry.max_attempts, 2);
        assert_eq!(config.lock_retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                (ENV_USE_DATABASE, "yes"),
                (ENV_DATABASE_URL, ":memory:"),
                (ENV_BACKUP_PATH, "/tmp/m.csv"),
            ]))
            .unwrap();
        assert!(config.use_database);
        assert_eq!(config.database_url.as_deref(), Some(":memory:"));
        assert_eq!(config.backup_path, Some(PathBuf::from("/tmp/m.csv")));

        let err = config
            .apply_env(env(&[(ENV_USE_DATABASE, "sometimes")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_open_requires_url_when_database_enabled() {
        let config = Config {
            use_database: true,
            backup_path: Some(PathBuf::from("/tmp/unused.csv")),
            ..Default::default()
        };
        assert!(matches!(config.open(), Err(ConfigError::MissingDatabaseUrl)));

        let config = Config {
            database_url: Some(":memory:".to_string()),
            ..config
        };
        let dashboard = config.open().expect("lazy open");
        assert!(dashboard.primary().is_some());
    }
}
