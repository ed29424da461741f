//! Pipeline configuration.
//!
//! Built-in defaults, then an optional TOML file, then environment
//! variables; command-line flags are applied last by `main`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nyc311_database::paths;
use nyc311_document_store::mongo::MongoConfig;
use nyc311_ingest::sync::{DEFAULT_SYNC_BATCH_SIZE, SyncOptions};
use nyc311_ingest::DEFAULT_CHUNK_SIZE;
use nyc311_validate::{ConsistencyPolicy, DEFAULT_MISMATCH_THRESHOLD};
use serde::Deserialize;

pub const ENV_DB_PATH: &str = "NYC311_DB_PATH";
pub const ENV_MONGODB_URI: &str = "MONGODB_URI";
pub const ENV_MONGO_DB: &str = "MONGO_DB";
pub const ENV_MONGO_COLLECTION: &str = "MONGO_COLLECTION";
pub const ENV_MONGO_SYNC_LEDGER: &str = "MONGO_SYNC_LEDGER";
pub const ENV_EXTRACT_PATH: &str = "NYC311_CSV";
pub const ENV_BATCH_SIZE: &str = "BATCH_SIZE";
pub const ENV_SYNC_BATCH_SIZE: &str = "SYNC_BATCH_SIZE";
pub const ENV_SYNC_LIMIT: &str = "MONGO_SYNC_LIMIT";
pub const ENV_MISMATCH_THRESHOLD: &str = "MISMATCH_THRESHOLD";
pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL_SECS";
pub const ENV_METRICS_LISTEN: &str = "METRICS_LISTEN";

/// Errors raised while assembling configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting required by the command is absent.
    #[error("Missing required configuration: {name}")]
    Missing { name: &'static str },

    #[error("Invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },

    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Everything the pipeline's components need, passed in explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub primary_db_path: PathBuf,
    /// Required by any command that touches the secondary store.
    pub secondary_uri: Option<String>,
    pub secondary_db: String,
    pub secondary_collection: String,
    pub sync_ledger_collection: String,
    pub extract_path: PathBuf,
    pub chunk_size: usize,
    pub sync_batch_size: usize,
    pub sync_limit: Option<u64>,
    pub mismatch_threshold: u64,
    pub poll_interval_secs: u64,
    pub metrics_listen: SocketAddr,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            primary_db_path: paths::primary_db_path(),
            secondary_uri: None,
            secondary_db: "nyc311".to_string(),
            secondary_collection: "service_requests".to_string(),
            sync_ledger_collection: "sync_ledger".to_string(),
            extract_path: paths::default_extract_path(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            sync_limit: None,
            mismatch_threshold: DEFAULT_MISMATCH_THRESHOLD,
            poll_interval_secs: 60,
            metrics_listen: SocketAddr::from(([0, 0, 0, 0], 9311)),
        }
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

impl PipelineConfig {
    /// Loads defaults, the optional TOML file and the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or a
    /// value is invalid.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file; keys it omits keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields from variables returned by `lookup`.
    ///
    /// Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable numbers or addresses.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_DB_PATH) {
            self.primary_db_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_MONGODB_URI) {
            self.secondary_uri = Some(v);
        }
        if let Some(v) = get(ENV_MONGO_DB) {
            self.secondary_db = v;
        }
        if let Some(v) = get(ENV_MONGO_COLLECTION) {
            self.secondary_collection = v;
        }
        if let Some(v) = get(ENV_MONGO_SYNC_LEDGER) {
            self.sync_ledger_collection = v;
        }
        if let Some(v) = get(ENV_EXTRACT_PATH) {
            self.extract_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_BATCH_SIZE) {
            self.chunk_size = parse_value(ENV_BATCH_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_SYNC_BATCH_SIZE) {
            self.sync_batch_size = parse_value(ENV_SYNC_BATCH_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_SYNC_LIMIT) {
            self.sync_limit = Some(parse_value(ENV_SYNC_LIMIT, &v)?);
        }
        if let Some(v) = get(ENV_MISMATCH_THRESHOLD) {
            self.mismatch_threshold = parse_value(ENV_MISMATCH_THRESHOLD, &v)?;
        }
        if let Some(v) = get(ENV_POLL_INTERVAL) {
            self.poll_interval_secs = parse_value(ENV_POLL_INTERVAL, &v)?;
        }
        if let Some(v) = get(ENV_METRICS_LISTEN) {
            self.metrics_listen = parse_value(ENV_METRICS_LISTEN, &v)?;
        }

        Ok(())
    }

    /// Rejects zero chunk, batch or poll sizes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (ENV_BATCH_SIZE, self.chunk_size as u64),
            (ENV_SYNC_BATCH_SIZE, self.sync_batch_size as u64),
            (ENV_POLL_INTERVAL, self.poll_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The secondary store URI.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no URI was configured.
    pub fn require_secondary_uri(&self) -> Result<&str, ConfigError> {
        self.secondary_uri
            .as_deref()
            .ok_or(ConfigError::Missing {
                name: ENV_MONGODB_URI,
            })
    }

    /// Connection settings for the secondary store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no URI was configured.
    pub fn mongo_config(&self) -> Result<MongoConfig, ConfigError> {
        Ok(MongoConfig {
            uri: self.require_secondary_uri()?.to_string(),
            database: self.secondary_db.clone(),
            collection: self.secondary_collection.clone(),
            ledger_collection: self.sync_ledger_collection.clone(),
        })
    }

    #[must_use]
    pub const fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.sync_batch_size,
            limit: self.sync_limit,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ConsistencyPolicy {
        ConsistencyPolicy {
            mismatch_threshold: self.mismatch_threshold,
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
