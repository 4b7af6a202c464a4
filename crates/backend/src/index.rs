//! Attribute indexes.
//!
//! Each configured attribute gets one tree per index kind, named
//! `<attribute>.<kind>`. A tree maps index keys (see [`crate::indexer`]) to
//! an [`EntryIdSet`]. The manager reads a set, updates it in memory and
//! writes it back inside the caller's transaction, deleting keys whose set
//! becomes empty.

use std::collections::{BTreeMap, HashMap};

use dirstore_substrate::{
    Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn, open_cursor,
};
use dirstore_types::{
    Entry, EntryId, MatchingRule, RuleSet,
    codec::encode,
    config::{IndexConfig, IndexKind},
};
use serde::Serialize;
use snafu::ResultExt;

use crate::{
    entry_id_set::EntryIdSet,
    error::{CodecSnafu, Result, StorageSnafu},
    indexer::{KeyDeriver, diff_keys},
    trust::index_descriptor,
};

/// The trees of one indexed attribute.
#[derive(Debug, Clone)]
pub struct AttributeIndex {
    config: IndexConfig,
    deriver: KeyDeriver,
    trees: BTreeMap<IndexKind, Tree>,
}

impl AttributeIndex {
    /// The index configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The key deriver for this attribute.
    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// The tree of `kind`, if configured.
    pub fn tree(&self, kind: IndexKind) -> Option<&Tree> {
        self.trees.get(&kind)
    }

    /// Configured kinds and their trees.
    pub fn trees(&self) -> impl Iterator<Item = (IndexKind, &Tree)> {
        self.trees.iter().map(|(k, t)| (*k, t))
    }
}

/// Definition fields whose change invalidates stored index contents.
#[derive(Serialize)]
struct IndexDefinition<'a> {
    attribute: &'a str,
    kind: IndexKind,
    rule: MatchingRule,
    entry_limit: usize,
    substring_length: usize,
}

/// A pending change to one index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    /// The index tree.
    pub tree: Tree,
    /// The index key.
    pub key: Vec<u8>,
    /// `true` to add the entry id, `false` to remove it.
    pub add: bool,
    /// Entry limit of the index.
    pub limit: usize,
}

/// Manages every configured attribute index.
#[derive(Debug)]
pub struct IndexManager {
    /// Keyed by lower-cased attribute name.
    indexes: BTreeMap<String, AttributeIndex>,
}

#[allow(clippy::result_large_err)]
impl IndexManager {
    /// Opens the trees of every configured index.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a tree cannot be opened.
    pub fn open(substrate: &dyn Substrate, configs: &[IndexConfig], rules: &RuleSet) -> Result<Self> {
        let mut indexes = BTreeMap::new();
        for config in configs {
            let mut trees = BTreeMap::new();
            for kind in &config.kinds {
                let tree = substrate.open_tree(&config.tree_name(*kind)).context(StorageSnafu)?;
                trees.insert(*kind, tree);
            }
            let deriver = KeyDeriver {
                rule: rules.rule_for(&config.attribute),
                substring_length: config.substring_length,
            };
            indexes.insert(config.attribute_key(), AttributeIndex { config: config.clone(), deriver, trees });
        }
        Ok(Self { indexes })
    }

    /// Encoded definitions keyed by descriptor name, for trust reconciliation.
    ///
    /// # Errors
    ///
    /// Returns a codec error.
    pub fn definitions(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for index in self.indexes.values() {
            let attribute = index.config.attribute_key();
            for kind in index.trees.keys() {
                let definition = IndexDefinition {
                    attribute: &attribute,
                    kind: *kind,
                    rule: index.deriver.rule,
                    entry_limit: index.config.entry_limit,
                    substring_length: index.config.substring_length,
                };
                let bytes = encode(&definition).context(CodecSnafu)?;
                out.insert(index_descriptor(&index.config.tree_name(*kind)), bytes);
            }
        }
        Ok(out)
    }

    /// The index on `attribute`, if configured.
    pub fn index_for(&self, attribute: &str) -> Option<&AttributeIndex> {
        self.indexes.get(&attribute.to_ascii_lowercase())
    }

    /// Every configured attribute index.
    pub fn indexes(&self) -> impl Iterator<Item = &AttributeIndex> {
        self.indexes.values()
    }

    /// Index key changes turning `old` into `new`.
    ///
    /// Pass `None` for `old` when adding and for `new` when deleting.
    pub fn changes(&self, old: Option<&Entry>, new: Option<&Entry>) -> Vec<IndexChange> {
        let mut changes = Vec::new();
        for index in self.indexes.values() {
            let attribute = &index.config.attribute;
            let before = old.map_or(&[][..], |e| e.values(attribute));
            let after = new.map_or(&[][..], |e| e.values(attribute));
            if before == after {
                continue;
            }
            for (kind, tree) in &index.trees {
                let diff = diff_keys(&index.deriver, *kind, before, after);
                let limit = index.config.entry_limit;
                changes.extend(diff.removed.into_iter().map(|key| IndexChange {
                    tree: tree.clone(),
                    key,
                    add: false,
                    limit,
                }));
                changes.extend(diff.added.into_iter().map(|key| IndexChange {
                    tree: tree.clone(),
                    key,
                    add: true,
                    limit,
                }));
            }
        }
        changes
    }

    /// Applies `changes` for entry `id` inside `txn`.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn apply(&self, txn: &mut dyn WriteTxn, id: EntryId, changes: &[IndexChange]) -> Result<()> {
        for change in changes {
            let mut set = read_set(txn.as_read(), &change.tree, &change.key)?;
            if change.add {
                if set.add(id, change.limit) {
                    tracing::warn!(
                        index = %change.tree,
                        limit = change.limit,
                        "index key exceeded its entry limit and is now unindexed"
                    );
                }
            } else {
                set.remove(id);
            }
            write_set(txn, &change.tree, &change.key, &set)?;
        }
        Ok(())
    }

    /// Reads the set under one key. Missing keys read as the empty set.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn read_set(&self, txn: &dyn ReadTxn, tree: &Tree, key: &[u8]) -> Result<EntryIdSet> {
        read_set(txn, tree, key)
    }

    /// Unions the sets of every key in `range`.
    ///
    /// The scan stops early with an undefined result when it meets an
    /// undefined key or the union grows past `cap` ids.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn scan_union(
        &self,
        txn: &dyn ReadTxn,
        tree: &Tree,
        range: KeyRange,
        cap: usize,
    ) -> Result<EntryIdSet> {
        let mut ids = Vec::new();
        for pair in open_cursor(txn, tree, range, Direction::Forward) {
            let (_, value) = pair.context(StorageSnafu)?;
            match EntryIdSet::from_bytes(&value).context(CodecSnafu)? {
                EntryIdSet::Defined(members) => ids.extend(members),
                EntryIdSet::Undefined { count } => {
                    return Ok(EntryIdSet::Undefined { count: count + ids.len() as u64 });
                },
            }
            if ids.len() > cap.saturating_mul(2) {
                ids.sort_unstable();
                ids.dedup();
                if ids.len() > cap {
                    return Ok(EntryIdSet::Undefined { count: ids.len() as u64 });
                }
            }
        }
        let set = EntryIdSet::from_ids(ids);
        match set.len() {
            Some(n) if n > cap => Ok(EntryIdSet::Undefined { count: n as u64 }),
            _ => Ok(set),
        }
    }
}

pub(crate) fn read_set(txn: &dyn ReadTxn, tree: &Tree, key: &[u8]) -> Result<EntryIdSet> {
    match txn.get(tree, key).context(StorageSnafu)? {
        Some(bytes) => EntryIdSet::from_bytes(&bytes).context(CodecSnafu),
        None => Ok(EntryIdSet::empty()),
    }
}

pub(crate) fn write_set(
    txn: &mut dyn WriteTxn,
    tree: &Tree,
    key: &[u8],
    set: &EntryIdSet,
) -> Result<()> {
    if set.is_empty() {
        txn.delete(tree, key).context(StorageSnafu)?;
    } else {
        let bytes = set.to_bytes().context(CodecSnafu)?;
        txn.put(tree, key, &bytes).context(StorageSnafu)?;
    }
    Ok(())
}

/// Accumulates index additions for many entries and writes each key once.
///
/// Used by bulk load and rebuild, where entries arrive in id order and
/// per-entry read-modify-write of hot keys would dominate.
#[derive(Debug, Default)]
pub struct IndexBuffer {
    pending: BTreeMap<(Tree, Vec<u8>), (Vec<EntryId>, usize)>,
    len: usize,
}

#[allow(clippy::result_large_err)]
impl IndexBuffer {
    /// Buffers the additions in `changes` for entry `id`. Removals are ignored.
    pub fn add(&mut self, id: EntryId, changes: Vec<IndexChange>) {
        for change in changes.into_iter().filter(|c| c.add) {
            let slot = self.pending.entry((change.tree, change.key)).or_insert((Vec::new(), change.limit));
            slot.0.push(id);
            self.len += 1;
        }
    }

    /// Number of buffered additions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is buffered.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Merges every buffered addition into the stored sets.
    ///
    /// Returns the number of keys that became undefined.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn flush(&mut self, txn: &mut dyn WriteTxn) -> Result<usize> {
        let mut degraded = 0;
        let mut per_tree: HashMap<Tree, usize> = HashMap::new();
        for ((tree, key), (mut ids, limit)) in std::mem::take(&mut self.pending) {
            ids.sort_unstable();
            ids.dedup();
            let mut set = read_set(txn.as_read(), &tree, &key)?;
            if set.add_all(&ids, limit) {
                degraded += 1;
                *per_tree.entry(tree.clone()).or_default() += 1;
            }
            write_set(txn, &tree, &key, &set)?;
        }
        for (tree, count) in per_tree {
            tracing::warn!(index = %tree, keys = count, "index keys exceeded their entry limit");
        }
        self.len = 0;
        Ok(degraded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_substrate::MemorySubstrate;
    use dirstore_test_utils::fixtures;

    use super::*;

    fn manager(substrate: &MemorySubstrate) -> IndexManager {
        let config = fixtures::standard_config();
        IndexManager::open(substrate, &config.indexes, &config.rule_set()).unwrap()
    }

    fn cn_eq(m: &IndexManager) -> Tree {
        m.index_for("CN").unwrap().tree(IndexKind::Equality).unwrap().clone()
    }

    #[test]
    fn test_changes_cover_every_kind() {
        let substrate = MemorySubstrate::new();
        let m = manager(&substrate);
        let alice = fixtures::person("alice", "Alice Smith", "Smith", "alice@example.com");
        let changes = m.changes(None, Some(&alice));
        assert!(changes.iter().all(|c| c.add));
        let trees: std::collections::BTreeSet<&str> =
            changes.iter().map(|c| c.tree.name()).collect();
        for name in ["cn.equality", "cn.substring", "cn.approximate", "mail.presence", "uid.equality"] {
            assert!(trees.contains(name), "missing {name}");
        }
        assert!(m.changes(Some(&alice), Some(&alice)).is_empty());
    }

    #[test]
    fn test_apply_adds_and_removes_ids() {
        let substrate = MemorySubstrate::new();
        let m = manager(&substrate);
        let alice = fixtures::person("alice", "Alice", "Smith", "alice@example.com");
        let mut txn = substrate.begin_write().unwrap();
        m.apply(txn.as_mut(), EntryId::new(7), &m.changes(None, Some(&alice))).unwrap();
        let set = m.read_set(txn.as_read(), &cn_eq(&m), b"alice").unwrap();
        assert_eq!(set, EntryIdSet::from_ids(vec![EntryId::new(7)]));

        m.apply(txn.as_mut(), EntryId::new(7), &m.changes(Some(&alice), None)).unwrap();
        assert!(!txn.contains(&cn_eq(&m), b"alice").unwrap());
    }

    #[test]
    fn test_entry_limit_degrades_key() {
        let substrate = MemorySubstrate::new();
        let config = IndexConfig::builder()
            .attribute("departmentNumber".into())
            .kinds(vec![IndexKind::Equality])
            .entry_limit(2)
            .build()
            .unwrap();
        let m = IndexManager::open(&substrate, &[config], &RuleSet::default()).unwrap();
        let tree = m.index_for("departmentnumber").unwrap().tree(IndexKind::Equality).unwrap().clone();
        let mut txn = substrate.begin_write().unwrap();
        for i in 1..=3 {
            let e = fixtures::numbered_person(i).with("departmentNumber", &["42"]);
            m.apply(txn.as_mut(), EntryId::new(i as u64), &m.changes(None, Some(&e))).unwrap();
        }
        let set = m.read_set(txn.as_read(), &tree, b"42").unwrap();
        assert!(!set.is_defined());
    }

    #[test]
    fn test_scan_union_caps_and_propagates_undefined() {
        let substrate = MemorySubstrate::new();
        let m = manager(&substrate);
        let sn = m.index_for("sn").unwrap().tree(IndexKind::Ordering).unwrap().clone();
        let mut txn = substrate.begin_write().unwrap();
        for i in 0..10u64 {
            let e = fixtures::numbered_person(i as usize);
            m.apply(txn.as_mut(), EntryId::new(i + 1), &m.changes(None, Some(&e))).unwrap();
        }
        let all = m.scan_union(txn.as_read(), &sn, KeyRange::all(), 100).unwrap();
        assert_eq!(all.len(), Some(10));
        let capped = m.scan_union(txn.as_read(), &sn, KeyRange::all(), 5).unwrap();
        assert!(!capped.is_defined());

        write_set(txn.as_mut(), &sn, b"surname5", &EntryIdSet::undefined()).unwrap();
        let undefined = m.scan_union(txn.as_read(), &sn, KeyRange::all(), 100).unwrap();
        assert!(!undefined.is_defined());
    }

    #[test]
    fn test_buffer_flush_merges_with_stored_sets() {
        let substrate = MemorySubstrate::new();
        let m = manager(&substrate);
        let mut txn = substrate.begin_write().unwrap();
        let first = fixtures::person("a", "Same", "X", "a@x");
        m.apply(txn.as_mut(), EntryId::new(1), &m.changes(None, Some(&first))).unwrap();

        let mut buffer = IndexBuffer::default();
        for i in 2..=4u64 {
            let e = fixtures::person(&format!("p{i}"), "Same", "X", "p@x");
            buffer.add(EntryId::new(i), m.changes(None, Some(&e)));
        }
        assert!(!buffer.is_empty());
        assert_eq!(buffer.flush(txn.as_mut()).unwrap(), 0);
        assert!(buffer.is_empty());
        let set = m.read_set(txn.as_read(), &cn_eq(&m), b"same").unwrap();
        assert_eq!(set.len(), Some(4));
    }

    #[test]
    fn test_definitions_name_every_tree() {
        let substrate = MemorySubstrate::new();
        let m = manager(&substrate);
        let defs = m.definitions().unwrap();
        assert!(defs.contains_key("index:cn.substring"));
        assert!(defs.contains_key("index:employeenumber.ordering"));
    }
}
