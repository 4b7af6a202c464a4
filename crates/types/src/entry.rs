//! Directory entries, attributes, and modifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{dn::Dn, matching::MatchingRule};

/// A named attribute with a set of opaque byte-string values.
///
/// Values keep insertion order. Callers decide what counts as a duplicate
/// because that depends on the attribute's matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    values: Vec<Vec<u8>>,
}

impl Attribute {
    /// Creates an attribute with the given values.
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self { name: name.into(), values }
    }

    /// The attribute name as first written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attribute's values.
    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// Whether the attribute holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether a value equal to `value` under `rule` is present.
    pub fn contains(&self, rule: MatchingRule, value: &[u8]) -> bool {
        let wanted = rule.normalize(value);
        self.values.iter().any(|v| rule.normalize(v) == wanted)
    }
}

/// A directory entry: a DN and its attributes.
///
/// Attribute names are matched case-insensitively. Operational metadata
/// (`entryUUID`, `createTimestamp`, `modifyTimestamp`) is stored as ordinary
/// attributes maintained by the write pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    /// Keyed by lower-cased attribute name.
    attributes: BTreeMap<String, Attribute>,
}

impl Entry {
    /// Creates an entry with no attributes.
    pub fn new(dn: Dn) -> Self {
        Self { dn, attributes: BTreeMap::new() }
    }

    /// Builder-style helper adding string values to an attribute.
    #[must_use]
    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        for value in values {
            self.add_value(name, value.as_bytes().to_vec());
        }
        self
    }

    /// The entry's DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Replaces the entry's DN.
    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// Iterates attributes in lower-cased name order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// Number of attributes.
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Looks up an attribute by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    /// Values of an attribute, empty if absent.
    pub fn values(&self, name: &str) -> &[Vec<u8>] {
        self.get(name).map(Attribute::values).unwrap_or(&[])
    }

    /// First value of an attribute as UTF-8 text.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.values(name).first().and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Whether the attribute is present with at least one value.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| !a.is_empty())
    }

    /// Appends a value, creating the attribute if needed. Exact duplicates are ignored.
    ///
    /// Returns `true` if the value was added.
    pub fn add_value(&mut self, name: &str, value: Vec<u8>) -> bool {
        let attr = self
            .attributes
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Attribute::new(name, Vec::new()));
        if attr.values.contains(&value) {
            return false;
        }
        attr.values.push(value);
        true
    }

    /// Removes every value equal to `value` under `rule`. Drops the attribute
    /// when its last value goes.
    ///
    /// Returns `true` if a value was removed.
    pub fn remove_value(&mut self, name: &str, rule: MatchingRule, value: &[u8]) -> bool {
        let key = name.to_ascii_lowercase();
        let Some(attr) = self.attributes.get_mut(&key) else {
            return false;
        };
        let wanted = rule.normalize(value);
        let before = attr.values.len();
        attr.values.retain(|v| rule.normalize(v) != wanted);
        let removed = attr.values.len() != before;
        if attr.values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    /// Replaces all values of an attribute. An empty list removes it.
    pub fn replace(&mut self, name: &str, values: Vec<Vec<u8>>) {
        let key = name.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, Attribute::new(name, values));
        }
    }

    /// Removes an attribute entirely, returning it if present.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.remove(&name.to_ascii_lowercase())
    }
}

/// The kind of change a [`Modification`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationKind {
    /// Add values; adding a value that exists is an error.
    Add,
    /// Remove the listed values, or the whole attribute when no values are listed.
    Delete,
    /// Replace all values; no values removes the attribute.
    Replace,
    /// Add an integer delta to a single-valued integer attribute.
    Increment,
}

/// One change in an ordered modify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do.
    pub kind: ModificationKind,
    /// Which attribute.
    pub attribute: String,
    /// The values involved.
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    /// Adds string values.
    pub fn add(attribute: &str, values: &[&str]) -> Self {
        Self::with_kind(ModificationKind::Add, attribute, values)
    }

    /// Deletes string values, or the whole attribute when `values` is empty.
    pub fn delete(attribute: &str, values: &[&str]) -> Self {
        Self::with_kind(ModificationKind::Delete, attribute, values)
    }

    /// Replaces the attribute's values.
    pub fn replace(attribute: &str, values: &[&str]) -> Self {
        Self::with_kind(ModificationKind::Replace, attribute, values)
    }

    /// Increments an integer attribute by `delta`.
    pub fn increment(attribute: &str, delta: i64) -> Self {
        Self {
            kind: ModificationKind::Increment,
            attribute: attribute.to_string(),
            values: vec![delta.to_string().into_bytes()],
        }
    }

    fn with_kind(kind: ModificationKind, attribute: &str, values: &[&str]) -> Self {
        Self {
            kind,
            attribute: attribute.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }
}
