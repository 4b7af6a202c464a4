//! Key-value substrate selection and limits.

use std::{path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigError, invalid};

/// Which substrate engine backs a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Copy-on-write in-memory trees with optimistic conflict detection.
    #[default]
    Memory,
    /// Embedded B-tree file (redb). Without a path the engine runs in memory.
    Embedded,
    /// Relational tables in SQLite, one table per tree.
    Relational,
}

/// Substrate configuration.
///
/// # Validation Rules
///
/// - `path` is required for the relational engine
/// - `max_key_size` and `max_value_size` must be >= 1
/// - `reader_pool_size` must be >= 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubstrateConfig {
    /// Engine kind.
    #[serde(default)]
    pub engine: EngineKind,
    /// Database file for the embedded and relational engines.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Byte budget for the memory engine; commits that would exceed it fail with StorageFull.
    #[serde(default)]
    pub memory_capacity_bytes: Option<u64>,
    /// Largest key accepted by `put`.
    #[serde(default = "default_max_key_size")]
    pub max_key_size: usize,
    /// Largest value accepted by `put`.
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    /// How long the relational engine waits on a locked database.
    #[serde(default = "default_busy_timeout", with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub busy_timeout: Duration,
    /// Read connections kept open by the relational engine.
    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: usize,
}

#[bon::bon]
impl SubstrateConfig {
    /// Creates a new substrate configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule above is violated.
    #[builder]
    pub fn new(
        #[builder(default)] engine: EngineKind,
        path: Option<PathBuf>,
        memory_capacity_bytes: Option<u64>,
        #[builder(default = default_max_key_size())] max_key_size: usize,
        #[builder(default = default_max_value_size())] max_value_size: usize,
        #[builder(default = default_busy_timeout())] busy_timeout: Duration,
        #[builder(default = default_reader_pool_size())] reader_pool_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            engine,
            path,
            memory_capacity_bytes,
            max_key_size,
            max_value_size,
            busy_timeout,
            reader_pool_size,
        };
        config.validate()?;
        Ok(config)
    }
}

impl SubstrateConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine == EngineKind::Relational && self.path.is_none() {
            return Err(invalid("the relational engine requires a database path"));
        }
        if self.max_key_size == 0 {
            return Err(invalid("max_key_size must be >= 1"));
        }
        if self.max_value_size == 0 {
            return Err(invalid("max_value_size must be >= 1"));
        }
        if self.reader_pool_size == 0 {
            return Err(invalid("reader_pool_size must be >= 1"));
        }
        Ok(())
    }

    /// Size limits as a compact value.
    pub fn limits(&self) -> SubstrateLimits {
        SubstrateLimits { max_key_size: self.max_key_size, max_value_size: self.max_value_size }
    }
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Memory,
            path: None,
            memory_capacity_bytes: None,
            max_key_size: default_max_key_size(),
            max_value_size: default_max_value_size(),
            busy_timeout: default_busy_timeout(),
            reader_pool_size: default_reader_pool_size(),
        }
    }
}

/// Format limits enforced by every engine on `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstrateLimits {
    /// Largest key in bytes.
    pub max_key_size: usize,
    /// Largest value in bytes.
    pub max_value_size: usize,
}

impl Default for SubstrateLimits {
    fn default() -> Self {
        Self { max_key_size: default_max_key_size(), max_value_size: default_max_value_size() }
    }
}

fn default_max_key_size() -> usize {
    4096
}

fn default_max_value_size() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reader_pool_size() -> usize {
    4
}
