//! Index rebuild.
//!
//! A rebuild clears the selected index trees and re-derives them from every
//! stored entry inside one write transaction, so readers see either the old
//! or the complete new contents. Rebuilding everything also recomputes the
//! hierarchy counters. Rebuilt indexes become trusted once the transaction
//! commits.

use std::collections::{BTreeMap, HashMap};

use dirstore_substrate::{Direction, KeyRange, Substrate, SubstrateError, Tree, WriteTxn, open_cursor};
use dirstore_types::{EntryId, RuleSet};
use snafu::{IntoError, ResultExt};

use crate::{
    cancel::{self, Cancellation},
    container::{EntryContainer, decode_id, write_u64},
    error::{BackendError, Result, StorageSnafu},
    index::{IndexBuffer, IndexManager},
    keys::{self, id_key, parent_key},
    trust::{TrustState, index_descriptor, vlv_descriptor},
    vlv::VlvManager,
};

/// Which indexes to rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSelector {
    /// Every attribute index, every VLV index and the hierarchy counters.
    All,
    /// One attribute index (every kind) or one VLV index, by name.
    Named(String),
}

impl IndexSelector {
    /// Selects an index by attribute or VLV name; `"all"` selects everything.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("all") { Self::All } else { Self::Named(name.to_string()) }
    }
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Descriptor names of the rebuilt indexes.
    pub indexes: Vec<String>,
    /// Entries scanned.
    pub entries: u64,
    /// Index keys that became undefined while rebuilding.
    pub degraded_keys: usize,
}

/// The trees one rebuild rewrites.
#[derive(Debug, Default)]
struct Targets {
    index_trees: Vec<Tree>,
    vlv_trees: Vec<Tree>,
    descriptors: Vec<String>,
    counters: bool,
}

pub(crate) struct Rebuilder<'a> {
    pub substrate: &'a dyn Substrate,
    pub container: &'a EntryContainer,
    pub indexes: &'a IndexManager,
    pub vlv: &'a VlvManager,
    pub trust: &'a TrustState,
    pub rules: &'a RuleSet,
    pub cancel: Option<&'a Cancellation>,
}

#[allow(clippy::result_large_err)]
impl Rebuilder<'_> {
    /// Rebuilds the indexes chosen by `selector`.
    pub fn run(&self, selector: &IndexSelector) -> Result<RebuildReport> {
        let targets = self.targets(selector)?;
        let mut txn = self.substrate.begin_write().context(StorageSnafu)?;
        let report = match self.rebuild(txn.as_mut(), &targets) {
            Ok(report) => report,
            Err(e) => {
                txn.abort();
                return Err(e);
            },
        };
        match txn.commit() {
            Ok(()) => {},
            Err(SubstrateError::Conflict { tree }) => {
                return Err(BackendError::ConcurrentModification { trees: tree });
            },
            Err(e) => return Err(StorageSnafu.into_error(e)),
        }
        self.trust.publish_trusted(&targets.descriptors);
        tracing::info!(
            indexes = ?report.indexes,
            entries = report.entries,
            degraded = report.degraded_keys,
            "index rebuild finished"
        );
        Ok(report)
    }

    fn targets(&self, selector: &IndexSelector) -> Result<Targets> {
        let mut targets = Targets::default();
        let wanted = |name: &str| match selector {
            IndexSelector::All => true,
            IndexSelector::Named(wanted) => wanted.eq_ignore_ascii_case(name),
        };
        for index in self.indexes.indexes().filter(|i| wanted(&i.config().attribute)) {
            for (_, tree) in index.trees() {
                targets.descriptors.push(index_descriptor(tree.name()));
                targets.index_trees.push(tree.clone());
            }
        }
        for index in self.vlv.indexes().filter(|i| wanted(i.name())) {
            targets.descriptors.push(vlv_descriptor(index.name()));
            targets.vlv_trees.push(index.tree().clone());
        }
        targets.counters = *selector == IndexSelector::All;
        if let IndexSelector::Named(name) = selector {
            if targets.descriptors.is_empty() {
                return Err(BackendError::UnknownIndex { name: name.clone() });
            }
        }
        Ok(targets)
    }

    fn rebuild(&self, txn: &mut dyn WriteTxn, targets: &Targets) -> Result<RebuildReport> {
        for tree in targets.index_trees.iter().chain(&targets.vlv_trees) {
            txn.clear(tree).context(StorageSnafu)?;
        }

        let dn2id = &self.container.trees().dn2id;
        let mut entries = Vec::new();
        for pair in open_cursor(txn.as_read(), dn2id, KeyRange::all(), Direction::Forward) {
            let (key, value) = pair.context(StorageSnafu)?;
            entries.push((key, decode_id(&value)?));
        }

        let mut buffer = IndexBuffer::default();
        for (_, id) in &entries {
            cancel::check(self.cancel)?;
            let Some(entry) = self.container.read_entry(txn.as_read(), *id)? else {
                return Err(crate::error::corruption(format!("dn2id references missing {id}")));
            };
            let changes = self
                .indexes
                .changes(None, Some(&entry))
                .into_iter()
                .filter(|c| targets.index_trees.contains(&c.tree))
                .collect();
            buffer.add(*id, changes);
            let vlv_changes: Vec<_> = self
                .vlv
                .changes(*id, None, Some(&entry), self.rules)
                .into_iter()
                .filter(|c| targets.vlv_trees.contains(&c.tree))
                .collect();
            self.vlv.apply(txn, &vlv_changes)?;
        }
        let degraded_keys = buffer.flush(txn)?;

        if targets.counters {
            self.recount(txn, &entries)?;
        }
        self.trust.mark_trusted(txn, &targets.descriptors)?;
        Ok(RebuildReport {
            indexes: targets.descriptors.clone(),
            entries: entries.len() as u64,
            degraded_keys,
        })
    }

    /// Rewrites `id2children`, `id2subtree` and the entry count.
    fn recount(&self, txn: &mut dyn WriteTxn, entries: &[(Vec<u8>, EntryId)]) -> Result<()> {
        let trees = self.container.trees();
        let by_key: BTreeMap<&[u8], EntryId> = entries.iter().map(|(k, id)| (k.as_slice(), *id)).collect();
        let mut children: HashMap<EntryId, u64> = HashMap::new();
        let mut subtree: HashMap<EntryId, u64> = HashMap::new();
        for (key, _) in entries {
            let mut direct = true;
            let mut ancestor = parent_key(key);
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

        txn.clear(&trees.id2children).context(StorageSnafu)?;
        txn.clear(&trees.id2subtree).context(StorageSnafu)?;
        for (id, count) in children {
            write_u64(txn, &trees.id2children, &id_key(id), count)?;
        }
        for (id, count) in subtree {
            write_u64(txn, &trees.id2subtree, &id_key(id), count)?;
        }
        write_u64(txn, &trees.state, keys::state::ENTRY_COUNT, entries.len() as u64)
    }
}
