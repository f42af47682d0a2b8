use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tally_store::SyncMode;

use crate::error::ConfigError;

/// Ledger construction settings, loadable from TOML.
///
/// ```toml
/// caching = true
///
/// [backend]
/// kind = "durable"
/// path = "/var/lib/tally/records.journal"
/// sync = "every_write"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Keep an identity map so repeated lookups share one instance.
    pub caching: bool,
    pub backend: BackendConfig,
}

/// Which record store backs the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Memory,
    Durable {
        path: PathBuf,
        #[serde(default)]
        sync: SyncMode,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Durable { .. } => "durable",
        }
    }
}

impl LedgerConfig {
    /// A durable ledger journaling to `path` with default sync behaviour.
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            caching: false,
            backend: BackendConfig::Durable {
                path: path.into(),
                sync: SyncMode::default(),
            },
        }
    }

    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}
