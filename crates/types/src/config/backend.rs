//! Backend configuration: base DN, indexes, entry encoding, search and import tuning.

use std::{collections::BTreeMap, path::Path, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{ConfigError, IndexConfig, ParseSnafu, ReadSnafu, VlvIndexConfig, invalid};
use crate::{
    dn::Dn,
    matching::{MatchingRule, RuleSet},
};

/// Maximum zstd compression level.
const MAX_COMPRESSION_LEVEL: i32 = 22;

/// Minimum zstd compression level.
const MIN_COMPRESSION_LEVEL: i32 = 1;

/// Length of the entry encryption key in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;

// =========================================================================
// EntryEncodingConfig
// =========================================================================

/// How entries are encoded before they are stored.
///
/// # Validation Rules
///
/// - `compression_level` must be 1-22 (zstd valid range)
/// - `encryption_key`, when set, must be 64 hex characters (32 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EntryEncodingConfig {
    /// Compress encoded entries with zstd.
    #[serde(default)]
    pub compress: bool,
    /// Zstd compression level.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Hex-encoded 256-bit key for XChaCha20-Poly1305 entry encryption.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[bon::bon]
impl EntryEncodingConfig {
    /// Creates a new encoding configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the compression level or key is invalid.
    #[builder]
    pub fn new(
        #[builder(default)] compress: bool,
        #[builder(default = default_compression_level())] compression_level: i32,
        encryption_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self { compress, compression_level, encryption_key };
        config.validate()?;
        Ok(config)
    }
}

impl EntryEncodingConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(invalid(format!(
                "compression_level must be {}-{}, got {}",
                MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        self.encryption_key_bytes()?;
        Ok(())
    }

    /// Decodes the configured encryption key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the key is not 32 hex-encoded bytes.
    pub fn encryption_key_bytes(&self) -> Result<Option<[u8; ENCRYPTION_KEY_LEN]>, ConfigError> {
        let Some(hex_key) = &self.encryption_key else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| invalid(format!("encryption_key is not valid hex: {e}")))?;
        let key: [u8; ENCRYPTION_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            invalid(format!("encryption_key must be {ENCRYPTION_KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Some(key))
    }
}

impl Default for EntryEncodingConfig {
    fn default() -> Self {
        Self { compress: false, compression_level: default_compression_level(), encryption_key: None }
    }
}

fn default_compression_level() -> i32 {
    3
}

// =========================================================================
// SearchConfig
// =========================================================================

/// Query evaluator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchConfig {
    /// An AND stops intersecting further children once its running candidate
    /// set is defined and no larger than this.
    #[serde(default = "default_candidate_threshold")]
    pub candidate_threshold: usize,
    /// Candidate sets up to this size are fetched by id; larger ones are
    /// checked during an ordered scan of the search scope.
    #[serde(default = "default_candidate_fetch_limit")]
    pub candidate_fetch_limit: usize,
    /// Size limit applied when a request sets none.
    #[serde(default)]
    pub default_size_limit: Option<usize>,
    /// Time limit applied when a request sets none.
    #[serde(default, with = "super::humantime_serde::option")]
    #[schemars(with = "Option<String>")]
    pub default_time_limit: Option<Duration>,
}

#[bon::bon]
impl SearchConfig {
    /// Creates a new search configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `candidate_fetch_limit` is zero.
    #[builder]
    pub fn new(
        #[builder(default = default_candidate_threshold())] candidate_threshold: usize,
        #[builder(default = default_candidate_fetch_limit())] candidate_fetch_limit: usize,
        default_size_limit: Option<usize>,
        default_time_limit: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { candidate_threshold, candidate_fetch_limit, default_size_limit, default_time_limit };
        config.validate()?;
        Ok(config)
    }
}

impl SearchConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_fetch_limit == 0 {
            return Err(invalid("candidate_fetch_limit must be >= 1"));
        }
        Ok(())
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_threshold: default_candidate_threshold(),
            candidate_fetch_limit: default_candidate_fetch_limit(),
            default_size_limit: None,
            default_time_limit: None,
        }
    }
}

fn default_candidate_threshold() -> usize {
    10
}

fn default_candidate_fetch_limit() -> usize {
    10_000
}

// =========================================================================
// ImportConfig
// =========================================================================

/// Bulk loader tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImportConfig {
    /// Entries per bulk-load transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl ImportConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `batch_size` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be >= 1"));
        }
        Ok(())
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { batch_size: default_batch_size() }
    }
}

fn default_batch_size() -> usize {
    1000
}

// =========================================================================
// BackendConfig
// =========================================================================

/// Complete configuration of one backend (one entry container).
///
/// # Example
///
/// ```
/// # use dirstore_types::{Dn, config::{BackendConfig, IndexConfig, IndexKind}};
/// let config = BackendConfig::builder()
///     .base_dn(Dn::parse("dc=example,dc=com").expect("dn"))
///     .indexes(vec![
///         IndexConfig::builder()
///             .attribute("mail".to_string())
///             .kinds(vec![IndexKind::Equality])
///             .build()
///             .expect("index"),
///     ])
///     .build()
///     .expect("valid backend config");
/// assert_eq!(config.indexes.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackendConfig {
    /// DN of the container's base entry.
    #[schemars(with = "String")]
    pub base_dn: Dn,
    /// Attribute indexes.
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
    /// VLV indexes.
    #[serde(default)]
    pub vlv_indexes: Vec<VlvIndexConfig>,
    /// Matching rules for attributes that are not indexed (or override the default).
    #[serde(default)]
    pub matching_rules: BTreeMap<String, MatchingRule>,
    /// Entry encoding.
    #[serde(default)]
    pub encoding: EntryEncodingConfig,
    /// Search tuning.
    #[serde(default)]
    pub search: SearchConfig,
    /// Bulk-load tuning.
    #[serde(default)]
    pub import: ImportConfig,
}

#[bon::bon]
impl BackendConfig {
    /// Creates a new backend configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any nested config is invalid,
    /// two indexes name the same attribute, two VLV indexes share a name, or
    /// a VLV base lies outside `base_dn`.
    #[builder]
    pub fn new(
        base_dn: Dn,
        #[builder(default)] indexes: Vec<IndexConfig>,
        #[builder(default)] vlv_indexes: Vec<VlvIndexConfig>,
        #[builder(default)] matching_rules: BTreeMap<String, MatchingRule>,
        #[builder(default)] encoding: EntryEncodingConfig,
        #[builder(default)] search: SearchConfig,
        #[builder(default)] import: ImportConfig,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { base_dn, indexes, vlv_indexes, matching_rules, encoding, search, import };
        config.validate()?;
        Ok(config)
    }
}

impl BackendConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut attributes = std::collections::HashSet::new();
        for index in &self.indexes {
            index.validate()?;
            if !attributes.insert(index.attribute_key()) {
                return Err(invalid(format!(
                    "attribute {} is configured by more than one index",
                    index.attribute_key()
                )));
            }
        }
        let mut names = std::collections::HashSet::new();
        for vlv in &self.vlv_indexes {
            vlv.validate()?;
            if !names.insert(vlv.name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate VLV index name {}", vlv.name)));
            }
            if !vlv.base_dn.is_within(&self.base_dn) {
                return Err(invalid(format!(
                    "VLV index {} base {} is outside backend base {}",
                    vlv.name, vlv.base_dn, self.base_dn
                )));
            }
        }
        self.encoding.validate()?;
        self.search.validate()?;
        self.import.validate()?;
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or
    /// [`ConfigError::Validation`] on invalid values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`BackendConfig::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_toml_str(&text)
    }

    /// The index configured for `attribute`, if any.
    pub fn index_for(&self, attribute: &str) -> Option<&IndexConfig> {
        self.indexes.iter().find(|i| i.attribute.eq_ignore_ascii_case(attribute))
    }

    /// Matching rules for every attribute: explicit rules, then index rules,
    /// case-ignore for the rest.
    pub fn rule_set(&self) -> RuleSet {
        let mut rules = RuleSet::new(MatchingRule::CaseIgnore);
        for index in &self.indexes {
            rules.set(&index.attribute, index.matching_rule);
        }
        for (attribute, rule) in &self.matching_rules {
            rules.set(attribute, *rule);
        }
        rules
    }
}
