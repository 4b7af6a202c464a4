//! Virtual list view indexes.
//!
//! A VLV index keeps every entry that is in scope of its base and matches its
//! filter, keyed by a composite sort key followed by the entry id, so a
//! forward scan yields entries in sort order without a post-sort.
//!
//! Each sort key contributes one component:
//!
//! - `0x00`, then the escaped ordering key of the entry's first value in sort
//!   order (smallest ascending, largest descending), then `0x00 0x00`.
//!   Descending components have every byte after the marker inverted.
//! - `0x01` when the entry lacks the attribute, so such entries sort after
//!   those having it in either direction.
//!
//! Inside a component `0x00` is escaped as `0x00 0xFF`, which keeps the
//! encoding prefix-free and lets byte inversion reverse the order exactly.
//! Ordering keys are cut at [`MAX_INDEX_KEY_LEN`] bytes before escaping;
//! values that agree up to the cut tie and fall back to entry id order.

use std::collections::BTreeMap;

use dirstore_substrate::{Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn, open_cursor};
use dirstore_types::{
    Entry, EntryId, Filter, MatchingRule, RuleSet,
    codec::encode,
    config::VlvIndexConfig,
};
use serde::Serialize;
use snafu::ResultExt;

use crate::{
    container::EntryContainer,
    error::{BackendError, CodecSnafu, ConfigSnafu, Result, StorageSnafu, corruption},
    indexer::MAX_INDEX_KEY_LEN,
    trust::vlv_descriptor,
};

const PRESENT: u8 = 0x00;
const MISSING: u8 = 0x01;
const ID_LEN: usize = 8;

/// Where a VLV window is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    /// 1-based position in sort order. Zero is treated as 1 and positions
    /// past the end as the last entry.
    Offset(usize),
    /// The first entry whose primary sort value is at or after this value.
    GreaterOrEqual(Vec<u8>),
}

/// A VLV page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvRequest {
    /// Name of the VLV index.
    pub index: String,
    /// Window anchor.
    pub target: VlvTarget,
    /// Entries to return before the target.
    pub before_count: usize,
    /// Entries to return after the target.
    pub after_count: usize,
}

/// A VLV page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponse {
    /// The window, in sort order.
    pub entries: Vec<Entry>,
    /// 1-based position of the target. `content_count + 1` when a
    /// `GreaterOrEqual` target lies past every entry, 0 for an empty index.
    pub target_position: usize,
    /// Number of entries in the index.
    pub content_count: usize,
}

#[derive(Debug, Clone)]
struct SortSpec {
    attribute: String,
    rule: MatchingRule,
    reverse: bool,
}

/// One configured VLV index.
#[derive(Debug, Clone)]
pub struct VlvIndex {
    config: VlvIndexConfig,
    filter: Filter,
    tree: Tree,
    sort: Vec<SortSpec>,
}

#[derive(Serialize)]
struct VlvDefinition<'a> {
    config: &'a VlvIndexConfig,
    rules: Vec<MatchingRule>,
}

impl VlvIndex {
    /// The index name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The index tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Whether `entry` belongs in this index.
    pub fn includes(&self, entry: &Entry, rules: &RuleSet) -> bool {
        self.config.scope.contains(&self.config.base_dn, entry.dn())
            && self.filter.matches(entry, rules)
    }

    /// The composite key of `entry` stored under `id`.
    pub fn key_for(&self, id: EntryId, entry: &Entry) -> Vec<u8> {
        let mut key = Vec::new();
        for spec in &self.sort {
            let chosen = entry
                .values(&spec.attribute)
                .iter()
                .map(|v| spec.rule.ordering_key(v))
                .reduce(|a, b| if (b < a) != spec.reverse { b } else { a });
            match chosen {
                Some(ordering) => encode_component(&ordering, spec.reverse, true, &mut key),
                None => key.push(MISSING),
            }
        }
        key.extend_from_slice(&id.to_key());
        key
    }

    /// The smallest key at or after `value` on the primary sort key, in the
    /// key's own direction.
    pub fn seek_key(&self, value: &[u8]) -> Vec<u8> {
        let mut key = Vec::new();
        if let Some(primary) = self.sort.first() {
            // Descending: longer values sharing the prefix sort before it.
            let ordering = primary.rule.ordering_key(value);
            encode_component(&ordering, primary.reverse, primary.reverse, &mut key);
        }
        key
    }
}

fn encode_component(ordering: &[u8], reverse: bool, terminate: bool, out: &mut Vec<u8>) {
    let ordering = &ordering[..ordering.len().min(MAX_INDEX_KEY_LEN)];
    out.push(PRESENT);
    let start = out.len();
    for &b in ordering {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    if terminate {
        out.extend_from_slice(&[0x00, 0x00]);
    }
    if reverse {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

/// A pending change to a VLV tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvChange {
    pub(crate) tree: Tree,
    pub(crate) key: Vec<u8>,
    pub(crate) add: bool,
}

/// Every configured VLV index.
#[derive(Debug)]
pub struct VlvManager {
    /// Keyed by lower-cased name.
    indexes: BTreeMap<String, VlvIndex>,
}

#[allow(clippy::result_large_err)]
impl VlvManager {
    /// Opens the tree of every configured VLV index.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or a configuration error for filters that
    /// do not parse.
    pub fn open(
        substrate: &dyn Substrate,
        configs: &[VlvIndexConfig],
        rules: &RuleSet,
    ) -> Result<Self> {
        let mut indexes = BTreeMap::new();
        for config in configs {
            let tree = substrate.open_tree(&config.tree_name()).context(StorageSnafu)?;
            let filter = config.parsed_filter().context(ConfigSnafu)?;
            let sort = config
                .sort_keys
                .iter()
                .map(|k| SortSpec {
                    attribute: k.attribute.clone(),
                    rule: k.matching_rule.unwrap_or_else(|| rules.rule_for(&k.attribute)),
                    reverse: k.reverse,
                })
                .collect();
            indexes.insert(
                config.name.to_ascii_lowercase(),
                VlvIndex { config: config.clone(), filter, tree, sort },
            );
        }
        Ok(Self { indexes })
    }

    /// Encoded definitions keyed by descriptor name.
    ///
    /// # Errors
    ///
    /// Returns a codec error.
    pub fn definitions(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for index in self.indexes.values() {
            let definition = VlvDefinition {
                config: &index.config,
                rules: index.sort.iter().map(|s| s.rule).collect(),
            };
            out.insert(vlv_descriptor(index.name()), encode(&definition).context(CodecSnafu)?);
        }
        Ok(out)
    }

    /// The index named `name`.
    pub fn get(&self, name: &str) -> Option<&VlvIndex> {
        self.indexes.get(&name.to_ascii_lowercase())
    }

    /// Every configured index.
    pub fn indexes(&self) -> impl Iterator<Item = &VlvIndex> {
        self.indexes.values()
    }

    /// Changes turning `old` into `new` for entry `id`.
    pub fn changes(
        &self,
        id: EntryId,
        old: Option<&Entry>,
        new: Option<&Entry>,
        rules: &RuleSet,
    ) -> Vec<VlvChange> {
        let mut changes = Vec::new();
        for index in self.indexes.values() {
            let before = old.filter(|e| index.includes(e, rules)).map(|e| index.key_for(id, e));
            let after = new.filter(|e| index.includes(e, rules)).map(|e| index.key_for(id, e));
            if before == after {
                continue;
            }
            if let Some(key) = before {
                changes.push(VlvChange { tree: index.tree.clone(), key, add: false });
            }
            if let Some(key) = after {
                changes.push(VlvChange { tree: index.tree.clone(), key, add: true });
            }
        }
        changes
    }

    /// Applies `changes` inside `txn`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn apply(&self, txn: &mut dyn WriteTxn, changes: &[VlvChange]) -> Result<()> {
        for change in changes {
            if change.add {
                txn.put(&change.tree, &change.key, &[]).context(StorageSnafu)?;
            } else {
                txn.delete(&change.tree, &change.key).context(StorageSnafu)?;
            }
        }
        Ok(())
    }

    /// Serves one VLV page from a read snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::UnknownIndex`] for unconfigured names, or a
    /// storage or decoding error.
    pub fn search(
        &self,
        txn: &dyn ReadTxn,
        container: &EntryContainer,
        request: &VlvRequest,
    ) -> Result<VlvResponse> {
        let index = self
            .get(&request.index)
            .ok_or_else(|| BackendError::UnknownIndex { name: request.index.clone() })?;
        let tree = &index.tree;
        let after = request.after_count.saturating_add(1);

        // No order statistics in the substrate: positions come from counting
        // keys, but only the window itself is read and materialized.
        let (keys, target_position, content_count) = match &request.target {
            VlvTarget::Offset(offset) => {
                let content_count = count_keys(txn, tree, KeyRange::all())?;
                if content_count == 0 {
                    (Vec::new(), 0, 0)
                } else {
                    let position = (*offset).clamp(1, content_count);
                    let start = (position - 1).saturating_sub(request.before_count);
                    let take = (position - 1 - start).saturating_add(after);
                    let mut keys = Vec::with_capacity(take.min(content_count));
                    let cursor = open_cursor(txn, tree, KeyRange::all(), Direction::Forward);
                    for (at, pair) in cursor.enumerate() {
                        let (key, _) = pair.context(StorageSnafu)?;
                        if at >= start {
                            keys.push(key);
                        }
                        if keys.len() == take {
                            break;
                        }
                    }
                    (keys, position, content_count)
                }
            },
            VlvTarget::GreaterOrEqual(value) => {
                let seek = index.seek_key(value);
                let preceding = count_keys(txn, tree, KeyRange::before(&seek))?;
                let content_count =
                    preceding + count_keys(txn, tree, KeyRange::at_or_after(&seek))?;
                let before = KeyRange::before(&seek);
                let mut keys =
                    scan_keys(txn, tree, before, Direction::Reverse, request.before_count)?;
                keys.reverse();
                let rest = KeyRange::at_or_after(&seek);
                keys.extend(scan_keys(txn, tree, rest, Direction::Forward, after)?);
                let position = if content_count == 0 { 0 } else { preceding + 1 };
                (keys, position, content_count)
            },
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            let id = key
                .len()
                .checked_sub(ID_LEN)
                .and_then(|at| EntryId::from_key(&key[at..]))
                .ok_or_else(|| corruption(format!("VLV key in {} lacks an entry id", index.tree)))?;
            let entry = container
                .read_entry(txn, id)?
                .ok_or_else(|| {
                    corruption(format!("VLV index {} references missing {id}", index.name()))
                })?;
            entries.push(entry);
        }
        tracing::debug!(index = index.name(), content_count, target_position, "served VLV page");
        Ok(VlvResponse { entries, target_position, content_count })
    }
}

fn count_keys(txn: &dyn ReadTxn, tree: &Tree, range: KeyRange) -> Result<usize> {
    let mut count = 0;
    for pair in open_cursor(txn, tree, range, Direction::Forward) {
        pair.context(StorageSnafu)?;
        count += 1;
    }
    Ok(count)
}

/// At most `limit` keys of `range`, in `direction`.
fn scan_keys(
    txn: &dyn ReadTxn,
    tree: &Tree,
    range: KeyRange,
    direction: Direction,
    limit: usize,
) -> Result<Vec<Vec<u8>>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let pairs = txn.scan(tree, &range, direction, limit).context(StorageSnafu)?;
    Ok(pairs.into_iter().map(|(key, _)| key).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_substrate::MemorySubstrate;
    use dirstore_test_utils::fixtures;
    use dirstore_types::config::SortKey;

    use super::*;

    fn index(sort_keys: Vec<SortKey>) -> VlvIndex {
        let substrate = MemorySubstrate::new();
        let config = VlvIndexConfig { sort_keys, ..fixtures::people_by_surname() };
        let manager = VlvManager::open(&substrate, &[config], &RuleSet::default()).unwrap();
        manager.get("People-By-SN").unwrap().clone()
    }

    fn person(uid: &str, sn: Option<&str>) -> Entry {
        let e = Entry::new(fixtures::people_dn().child(dirstore_types::Rdn::new("uid", uid)))
            .with("objectClass", &["person"]);
        match sn {
            Some(sn) => e.with("sn", &[sn]),
            None => e,
        }
    }

    #[test]
    fn test_ascending_keys_sort_by_value_then_id() {
        let idx = index(vec![SortKey::ascending("sn")]);
        let a = idx.key_for(EntryId::new(9), &person("a", Some("Adams")));
        let b1 = idx.key_for(EntryId::new(1), &person("b", Some("baker")));
        let b2 = idx.key_for(EntryId::new(2), &person("c", Some("Baker")));
        let none = idx.key_for(EntryId::new(0), &person("d", None));
        assert!(a < b1 && b1 < b2 && b2 < none);
    }

    #[test]
    fn test_descending_keys_reverse_values_but_keep_missing_last() {
        let idx = index(vec![SortKey::descending("sn")]);
        let a = idx.key_for(EntryId::new(1), &person("a", Some("Adams")));
        let ab = idx.key_for(EntryId::new(1), &person("a", Some("Ab")));
        let z = idx.key_for(EntryId::new(1), &person("z", Some("Zed")));
        let none = idx.key_for(EntryId::new(1), &person("n", None));
        assert!(z < a && a < ab && ab < none);
    }

    #[test]
    fn test_prefix_values_sort_before_longer_values() {
        let idx = index(vec![SortKey::ascending("sn")]);
        let short = idx.key_for(EntryId::new(5), &person("a", Some("Ab")));
        let long = idx.key_for(EntryId::new(1), &person("b", Some("Abc")));
        assert!(short < long);
        assert!(idx.seek_key(b"ab") <= short);
        assert!(idx.seek_key(b"abc") > short);
    }

    #[test]
    fn test_descending_seek_lands_between_neighbours() {
        let idx = index(vec![SortKey::descending("sn")]);
        let abc = idx.key_for(EntryId::new(1), &person("a", Some("abc")));
        let ab = idx.key_for(EntryId::new(2), &person("b", Some("ab")));
        let aa = idx.key_for(EntryId::new(3), &person("c", Some("aa")));
        let seek = idx.seek_key(b"ab");
        assert!(abc < seek && seek <= ab && ab < aa);
    }

    #[test]
    fn test_long_values_are_cut_and_tie_on_entry_id() {
        let idx = index(vec![SortKey::ascending("sn")]);
        let long = "x".repeat(5000);
        let longer = format!("{long}y");
        let first = idx.key_for(EntryId::new(1), &person("a", Some(&longer)));
        let second = idx.key_for(EntryId::new(2), &person("b", Some(&long)));
        assert!(first.len() < MAX_INDEX_KEY_LEN + 16);
        assert!(first < second);
        assert!(idx.seek_key(long.as_bytes()) <= first);
    }

    #[test]
    fn test_scope_and_filter_decide_membership() {
        let idx = index(vec![SortKey::ascending("sn")]);
        let rules = RuleSet::default();
        assert!(idx.includes(&person("a", Some("x")), &rules));
        assert!(!idx.includes(&fixtures::org_unit("people"), &rules));
        assert!(!idx.includes(&fixtures::base_entry(), &rules));
    }
}
