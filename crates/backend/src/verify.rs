//! Consistency verification.
//!
//! Verification reads one snapshot and reports findings; it never repairs.
//! The default pass works from the entries: every `dn2id` mapping resolves,
//! every stored entry is reachable, counters match the hierarchy and every
//! key an entry should produce is present in its (trusted) index. A clean
//! pass additionally walks every index key and reports references to
//! entries that do not exist or no longer produce that key.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dirstore_substrate::{Direction, KeyRange, ReadTxn, open_cursor};
use dirstore_types::{EntryId, RuleSet};
use snafu::ResultExt;

use crate::{
    container::{EntryContainer, decode_id},
    entry_id_set::EntryIdSet,
    error::{CodecSnafu, Result, StorageSnafu},
    index::IndexManager,
    keys::{SEPARATOR, parent_key},
    trust::{TrustState, index_descriptor, vlv_descriptor},
    vlv::VlvManager,
};

/// Verification options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Also walk every index key looking for dangling references.
    pub clean: bool,
}

/// What kind of inconsistency was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InconsistencyKind {
    /// A `dn2id` mapping points to an id without a stored entry.
    DanglingDn2Id,
    /// A stored entry's DN does not match the `dn2id` key it is reached by.
    MismatchedDn,
    /// A stored entry no `dn2id` mapping reaches.
    OrphanEntry,
    /// An entry's index key is missing or does not list the entry.
    MissingIndexEntry,
    /// An index key lists an entry that does not exist or does not produce it.
    DanglingIndexReference,
    /// A stored id set is not strictly ascending.
    UnsortedIdSet,
    /// A direct child counter disagrees with the hierarchy.
    WrongChildrenCount,
    /// A descendant counter disagrees with the hierarchy.
    WrongSubtreeCount,
    /// The container entry count disagrees with `dn2id`.
    WrongEntryCount,
    /// An entry in a VLV index's scope has no VLV key.
    MissingVlvEntry,
    /// A VLV key belongs to no entry in the index's scope.
    DanglingVlvEntry,
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    /// The kind of finding.
    pub kind: InconsistencyKind,
    /// Human-readable detail.
    pub detail: String,
    /// The entry concerned, when known.
    pub id: Option<EntryId>,
    /// The tree concerned, when known.
    pub tree: Option<String>,
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

/// Walks one snapshot and collects findings.
pub(crate) struct Verifier<'a> {
    pub txn: &'a dyn ReadTxn,
    pub container: &'a EntryContainer,
    pub indexes: &'a IndexManager,
    pub vlv: &'a VlvManager,
    pub trust: &'a TrustState,
    pub rules: &'a RuleSet,
}

/// Expected index contents: tree name to key to ids.
type Expected = HashMap<String, BTreeMap<Vec<u8>, BTreeSet<EntryId>>>;

#[allow(clippy::result_large_err)]
impl Verifier<'_> {
    /// Runs every check.
    pub fn run(&self, options: VerifyOptions) -> Result<Vec<Inconsistency>> {
        let mut findings = Vec::new();
        let trees = self.container.trees();

        // dn2id -> id2entry, collecting the hierarchy.
        let mut by_key: BTreeMap<Vec<u8>, EntryId> = BTreeMap::new();
        let mut expected_index = Expected::new();
        let mut expected_vlv = Expected::new();
        for pair in open_cursor(self.txn, &trees.dn2id, KeyRange::all(), Direction::Forward) {
            let (key, value) = pair.context(StorageSnafu)?;
            let id = decode_id(&value)?;
            let Some(entry) = self.container.read_entry(self.txn, id)? else {
                findings.push(finding(
                    InconsistencyKind::DanglingDn2Id,
                    format!("dn2id key {} maps to missing {id}", show_key(&key)),
                    Some(id),
                    Some(trees.dn2id.name()),
                ));
                continue;
            };
            if self.container.key_for(entry.dn()).ok().as_deref() != Some(key.as_slice()) {
                findings.push(finding(
                    InconsistencyKind::MismatchedDn,
                    format!("{id} holds {} but is reached by key {}", entry.dn(), show_key(&key)),
                    Some(id),
                    Some(trees.dn2id.name()),
                ));
            }
            for change in self.indexes.changes(None, Some(&entry)) {
                if self.trust.is_trusted(&index_descriptor(change.tree.name())) {
                    expected_index
                        .entry(change.tree.name().to_string())
                        .or_default()
                        .entry(change.key)
                        .or_default()
                        .insert(id);
                }
            }
            for change in self.vlv.changes(id, None, Some(&entry), self.rules) {
                expected_vlv
                    .entry(change.tree.name().to_string())
                    .or_default()
                    .entry(change.key)
                    .or_default()
                    .insert(id);
            }
            by_key.insert(key, id);
        }

        self.check_orphans(&by_key, &mut findings)?;
        self.check_counters(&by_key, &mut findings)?;
        self.check_indexes(&expected_index, options, &mut findings)?;
        self.check_vlv(&expected_vlv, options, &mut findings)?;

        tracing::info!(findings = findings.len(), clean = options.clean, "verification finished");
        Ok(findings)
    }

    fn check_orphans(
        &self,
        by_key: &BTreeMap<Vec<u8>, EntryId>,
        findings: &mut Vec<Inconsistency>,
    ) -> Result<()> {
        let reachable: BTreeSet<EntryId> = by_key.values().copied().collect();
        let tree = &self.container.trees().id2entry;
        for pair in open_cursor(self.txn, tree, KeyRange::all(), Direction::Forward) {
            let (key, _) = pair.context(StorageSnafu)?;
            let id = decode_id(&key)?;
            if !reachable.contains(&id) {
                findings.push(finding(
                    InconsistencyKind::OrphanEntry,
                    format!("{id} is stored but has no DN mapping"),
                    Some(id),
                    Some(tree.name()),
                ));
            }
        }
        Ok(())
    }

    fn check_counters(
        &self,
        by_key: &BTreeMap<Vec<u8>, EntryId>,
        findings: &mut Vec<Inconsistency>,
    ) -> Result<()> {
        let mut children: HashMap<EntryId, u64> = HashMap::new();
        let mut subtree: HashMap<EntryId, u64> = HashMap::new();
        for key in by_key.keys() {
            let mut ancestor = parent_key(key);
            let mut direct = true;
            while let Some(parent) = ancestor {
                if let Some(parent_id) = by_key.get(parent) {
                    if direct {
                        *children.entry(*parent_id).or_default() += 1;
                    }
                    *subtree.entry(*parent_id).or_default() += 1;
                }
                direct = false;
                ancestor = parent_key(parent);
            }
        }

        let trees = self.container.trees();
        for id in by_key.values() {
            let want = children.get(id).copied().unwrap_or(0);
            let have = self.container.children_count(self.txn, *id)?;
            if want != have {
                findings.push(finding(
                    InconsistencyKind::WrongChildrenCount,
                    format!("{id} has {want} children but records {have}"),
                    Some(*id),
                    Some(trees.id2children.name()),
                ));
            }
            let want = subtree.get(id).copied().unwrap_or(0);
            let have = self.container.subtree_count(self.txn, *id)?;
            if want != have {
                findings.push(finding(
                    InconsistencyKind::WrongSubtreeCount,
                    format!("{id} has {want} descendants but records {have}"),
                    Some(*id),
                    Some(trees.id2subtree.name()),
                ));
            }
        }

        let recorded = self.container.entry_count(self.txn)?;
        if recorded != by_key.len() as u64 {
            findings.push(finding(
                InconsistencyKind::WrongEntryCount,
                format!("container holds {} entries but records {recorded}", by_key.len()),
                None,
                Some(trees.state.name()),
            ));
        }
        Ok(())
    }

    fn check_indexes(
        &self,
        expected: &Expected,
        options: VerifyOptions,
        findings: &mut Vec<Inconsistency>,
    ) -> Result<()> {
        for index in self.indexes.indexes() {
            for (_, tree) in index.trees() {
                if !self.trust.is_trusted(&index_descriptor(tree.name())) {
                    tracing::debug!(index = %tree, "skipping untrusted index");
                    continue;
                }
                let want = expected.get(tree.name());

                // Entry side: every expected key lists its entries.
                for (key, ids) in want.into_iter().flatten() {
                    let set = self.indexes.read_set(self.txn, tree, key)?;
                    for id in ids.iter().filter(|id| !set.may_contain(**id)) {
                        findings.push(finding(
                            InconsistencyKind::MissingIndexEntry,
                            format!("{tree} key {} does not list {id}", show_key(key)),
                            Some(*id),
                            Some(tree.name()),
                        ));
                    }
                }
                if !options.clean {
                    continue;
                }

                // Index side: every listed id exists and produces the key.
                for pair in open_cursor(self.txn, tree, KeyRange::all(), Direction::Forward) {
                    let (key, value) = pair.context(StorageSnafu)?;
                    let set = EntryIdSet::from_bytes(&value).context(CodecSnafu)?;
                    let Some(ids) = set.ids() else {
                        continue;
                    };
                    if ids.windows(2).any(|w| w[0] >= w[1]) {
                        findings.push(finding(
                            InconsistencyKind::UnsortedIdSet,
                            format!("{tree} key {} is not strictly ascending", show_key(&key)),
                            None,
                            Some(tree.name()),
                        ));
                    }
                    let listed = want.and_then(|w| w.get(&key));
                    for id in ids.iter().filter(|id| !listed.is_some_and(|l| l.contains(*id))) {
                        findings.push(finding(
                            InconsistencyKind::DanglingIndexReference,
                            format!("{tree} key {} lists {id}, which does not produce it", show_key(&key)),
                            Some(*id),
                            Some(tree.name()),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_vlv(
        &self,
        expected: &Expected,
        options: VerifyOptions,
        findings: &mut Vec<Inconsistency>,
    ) -> Result<()> {
        for index in self.vlv.indexes() {
            if !self.trust.is_trusted(&vlv_descriptor(index.name())) {
                tracing::debug!(index = index.name(), "skipping untrusted VLV index");
                continue;
            }
            let tree = index.tree();
            let want = expected.get(tree.name());
            let mut stored = BTreeSet::new();
            for pair in open_cursor(self.txn, tree, KeyRange::all(), Direction::Forward) {
                stored.insert(pair.context(StorageSnafu)?.0);
            }
            for (key, ids) in want.into_iter().flatten() {
                if !stored.contains(key) {
                    findings.push(finding(
                        InconsistencyKind::MissingVlvEntry,
                        format!("VLV index {} has no key for {ids:?}", index.name()),
                        ids.iter().next().copied(),
                        Some(tree.name()),
                    ));
                }
            }
            if !options.clean {
                continue;
            }
            for key in stored.iter().filter(|k| !want.is_some_and(|w| w.contains_key(*k))) {
                findings.push(finding(
                    InconsistencyKind::DanglingVlvEntry,
                    format!("VLV index {} holds unexpected key {}", index.name(), show_key(key)),
                    vlv_key_id(key),
                    Some(tree.name()),
                ));
            }
        }
        Ok(())
    }
}

fn finding(
    kind: InconsistencyKind,
    detail: String,
    id: Option<EntryId>,
    tree: Option<&str>,
) -> Inconsistency {
    Inconsistency { kind, detail, id, tree: tree.map(str::to_string) }
}

/// VLV keys end with the 8-byte entry id.
fn vlv_key_id(key: &[u8]) -> Option<EntryId> {
    key.len().checked_sub(8).and_then(|start| EntryId::from_key(&key[start..]))
}

fn show_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "<base>".to_string();
    }
    let printable = key.iter().all(|b| b.is_ascii_graphic() || *b == b' ' || *b == SEPARATOR);
    if printable {
        String::from_utf8_lossy(key).replace(char::from(SEPARATOR), ",")
    } else {
        hex::encode(key)
    }
}
