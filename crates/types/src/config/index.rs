//! Attribute index and VLV index configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConfigError, invalid};
use crate::{dn::Dn, filter::Filter, matching::MatchingRule, search::Scope};

/// Default maximum EntryIDSet size per index key before it degrades to undefined.
const DEFAULT_ENTRY_LIMIT: usize = 4000;

/// Default length of the fixed-size fragments a substring index stores.
const DEFAULT_SUBSTRING_LENGTH: usize = 6;

/// Kind of attribute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    /// Normalized value → entries.
    Equality,
    /// Fixed-length fragments of the normalized value → entries.
    Substring,
    /// Byte-sortable value → entries, scanned by range.
    Ordering,
    /// Single key holding every entry that has the attribute.
    Presence,
    /// Phonetic reduction of the value → entries.
    Approximate,
}

impl IndexKind {
    /// All kinds, in planner cost order (cheapest first).
    pub const ALL: [IndexKind; 5] =
        [Self::Equality, Self::Approximate, Self::Presence, Self::Substring, Self::Ordering];

    /// The kind's name as used in tree names and configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equality => "equality",
            Self::Substring => "substring",
            Self::Ordering => "ordering",
            Self::Presence => "presence",
            Self::Approximate => "approximate",
        }
    }

    /// Parses a kind name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

pub(crate) fn valid_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// Configuration of the indexes kept for one attribute.
///
/// # Validation Rules
///
/// - `attribute` must be a valid attribute name
/// - `kinds` must be non-empty without duplicates
/// - `entry_limit` must be >= 1
/// - `substring_length` must be >= 1
///
/// # Example
///
/// ```
/// # use dirstore_types::config::{IndexConfig, IndexKind};
/// let config = IndexConfig::builder()
///     .attribute("mail".to_string())
///     .kinds(vec![IndexKind::Equality, IndexKind::Substring])
///     .build()
///     .expect("valid index config");
/// assert_eq!(config.entry_limit, 4000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IndexConfig {
    /// Indexed attribute.
    pub attribute: String,
    /// Index kinds maintained for the attribute.
    pub kinds: Vec<IndexKind>,
    /// Maximum number of entry ids tracked per key.
    #[serde(default = "default_entry_limit")]
    pub entry_limit: usize,
    /// Fragment length for substring keys.
    #[serde(default = "default_substring_length")]
    pub substring_length: usize,
    /// Matching rule used to derive keys.
    #[serde(default)]
    pub matching_rule: MatchingRule,
}

#[bon::bon]
impl IndexConfig {
    /// Creates a new index configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any rule above is violated.
    #[builder]
    pub fn new(
        attribute: String,
        kinds: Vec<IndexKind>,
        #[builder(default = default_entry_limit())] entry_limit: usize,
        #[builder(default = default_substring_length())] substring_length: usize,
        #[builder(default)] matching_rule: MatchingRule,
    ) -> Result<Self, ConfigError> {
        let config = Self { attribute, kinds, entry_limit, substring_length, matching_rule };
        config.validate()?;
        Ok(config)
    }
}

impl IndexConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_attribute_name(&self.attribute) {
            return Err(invalid(format!("invalid index attribute name {:?}", self.attribute)));
        }
        if self.kinds.is_empty() {
            return Err(invalid(format!("index on {} must list at least one of kinds", self.attribute)));
        }
        let mut seen = self.kinds.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.kinds.len() {
            return Err(invalid(format!("index on {} lists duplicate kinds", self.attribute)));
        }
        if self.entry_limit == 0 {
            return Err(invalid(format!("entry_limit for {} must be >= 1", self.attribute)));
        }
        if self.substring_length == 0 {
            return Err(invalid(format!("substring_length for {} must be >= 1", self.attribute)));
        }
        Ok(())
    }

    /// Lower-cased attribute name used in tree names.
    pub fn attribute_key(&self) -> String {
        self.attribute.to_ascii_lowercase()
    }

    /// Name of the substrate tree holding one kind of this index.
    pub fn tree_name(&self, kind: IndexKind) -> String {
        format!("{}.{}", self.attribute_key(), kind.as_str())
    }

    /// Whether the given kind is configured.
    pub fn has(&self, kind: IndexKind) -> bool {
        self.kinds.contains(&kind)
    }
}

fn default_entry_limit() -> usize {
    DEFAULT_ENTRY_LIMIT
}

fn default_substring_length() -> usize {
    DEFAULT_SUBSTRING_LENGTH
}

// =========================================================================
// VLV
// =========================================================================

/// One sort key of a VLV index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SortKey {
    /// Attribute to sort on.
    pub attribute: String,
    /// Sort descending.
    #[serde(default)]
    pub reverse: bool,
    /// Ordering rule; defaults to the attribute's configured rule.
    #[serde(default)]
    pub matching_rule: Option<MatchingRule>,
}

impl SortKey {
    /// Ascending sort on `attribute`.
    pub fn ascending(attribute: &str) -> Self {
        Self { attribute: attribute.to_string(), reverse: false, matching_rule: None }
    }

    /// Descending sort on `attribute`.
    pub fn descending(attribute: &str) -> Self {
        Self { attribute: attribute.to_string(), reverse: true, matching_rule: None }
    }
}

/// A virtual list view index: a pre-sorted view of the entries under a base
/// matching a filter, supporting offset-based paging without a post-sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VlvIndexConfig {
    /// Index name, unique per backend.
    pub name: String,
    /// Entries below this DN are candidates.
    #[schemars(with = "String")]
    pub base_dn: Dn,
    /// Which entries relative to `base_dn` are candidates.
    #[serde(default)]
    pub scope: Scope,
    /// Candidates must match this filter (RFC 4515).
    #[serde(default = "default_vlv_filter")]
    pub filter: String,
    /// Sort order.
    pub sort_keys: Vec<SortKey>,
}

#[bon::bon]
impl VlvIndexConfig {
    /// Creates a new VLV index configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the name is invalid, the filter
    /// does not parse, or no sort keys are given.
    #[builder]
    pub fn new(
        name: String,
        base_dn: Dn,
        #[builder(default)] scope: Scope,
        #[builder(default = default_vlv_filter())] filter: String,
        sort_keys: Vec<SortKey>,
    ) -> Result<Self, ConfigError> {
        let config = Self { name, base_dn, scope, filter, sort_keys };
        config.validate()?;
        Ok(config)
    }
}

impl VlvIndexConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || !self.name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid(format!("invalid VLV index name {:?}", self.name)));
        }
        if let Err(e) = Filter::parse(&self.filter) {
            return Err(invalid(format!("VLV index {} filter: {e}", self.name)));
        }
        if self.sort_keys.is_empty() {
            return Err(invalid(format!("VLV index {} needs at least one of sort_keys", self.name)));
        }
        if let Some(key) = self.sort_keys.iter().find(|k| !valid_attribute_name(&k.attribute)) {
            return Err(invalid(format!("VLV index {} sorts on invalid attribute {:?}", self.name, key.attribute)));
        }
        Ok(())
    }

    /// The parsed filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the filter does not parse.
    pub fn parsed_filter(&self) -> Result<Filter, ConfigError> {
        Filter::parse(&self.filter)
            .map_err(|e| invalid(format!("VLV index {} filter: {e}", self.name)))
    }

    /// Name of the substrate tree holding this index.
    pub fn tree_name(&self) -> String {
        format!("vlv.{}", self.name.to_ascii_lowercase())
    }
}

fn default_vlv_filter() -> String {
    "(objectClass=*)".to_string()
}
