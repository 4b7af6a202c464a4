//! Index trust state.
//!
//! Each attribute index tree and VLV index has a descriptor in the `state`
//! tree holding its encoded definition and a trusted flag. At open, an index
//! whose descriptor is missing or whose definition changed is trusted only if
//! the container is empty; otherwise it must be rebuilt before the planner
//! will use it. Writes keep maintaining untrusted indexes so a rebuild starts
//! from their current contents.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use arc_swap::ArcSwap;
use dirstore_substrate::{Direction, KeyRange, Substrate, Tree, WriteTxn, open_cursor};
use dirstore_types::codec::{decode, encode};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{CodecSnafu, Result, StorageSnafu};

/// Stored descriptor of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredDescriptor {
    definition: Vec<u8>,
    trusted: bool,
}

/// Which configured indexes may serve lookups.
#[derive(Debug)]
pub struct TrustState {
    state_tree: Tree,
    /// Descriptor key to encoded definition.
    definitions: BTreeMap<String, Vec<u8>>,
    untrusted: ArcSwap<BTreeSet<String>>,
}

#[allow(clippy::result_large_err)]
impl TrustState {
    /// Compares configured definitions with stored descriptors and records
    /// the outcome.
    ///
    /// `definitions` maps descriptor keys (`index:<tree>`, `vlv:<name>`) to
    /// encoded definitions.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn reconcile(
        substrate: &dyn Substrate,
        state_tree: Tree,
        definitions: BTreeMap<String, Vec<u8>>,
        container_empty: bool,
    ) -> Result<Self> {
        let mut txn = substrate.begin_write().context(StorageSnafu)?;
        let mut untrusted = BTreeSet::new();
        let mut changed = false;

        for (name, definition) in &definitions {
            let stored = match txn.get(&state_tree, name.as_bytes()).context(StorageSnafu)? {
                Some(bytes) => Some(decode::<StoredDescriptor>(&bytes).context(CodecSnafu)?),
                None => None,
            };
            let descriptor = match stored {
                Some(d) if &d.definition == definition => d,
                Some(_) | None => {
                    let descriptor =
                        StoredDescriptor { definition: definition.clone(), trusted: container_empty };
                    let bytes = encode(&descriptor).context(CodecSnafu)?;
                    txn.put(&state_tree, name.as_bytes(), &bytes).context(StorageSnafu)?;
                    changed = true;
                    descriptor
                },
            };
            if !descriptor.trusted {
                tracing::warn!(index = %name, "index is not trusted until rebuilt");
                untrusted.insert(name.clone());
            }
        }

        // Descriptors of indexes no longer configured.
        let mut stale = Vec::new();
        for prefix in [crate::keys::state::INDEX_PREFIX, crate::keys::state::VLV_PREFIX] {
            let range = KeyRange::prefix(prefix.as_bytes());
            for pair in open_cursor(txn.as_read(), &state_tree, range, Direction::Forward) {
                let (key, _) = pair.context(StorageSnafu)?;
                let name = String::from_utf8_lossy(&key).into_owned();
                if !definitions.contains_key(&name) {
                    stale.push(key);
                }
            }
        }
        for key in &stale {
            txn.delete(&state_tree, key).context(StorageSnafu)?;
            changed = true;
        }

        if changed {
            txn.commit().context(StorageSnafu)?;
        } else {
            txn.abort();
        }
        Ok(Self { state_tree, definitions, untrusted: ArcSwap::from_pointee(untrusted) })
    }

    /// Whether the index with descriptor key `name` may serve lookups.
    pub fn is_trusted(&self, name: &str) -> bool {
        !self.untrusted.load().contains(name)
    }

    /// Descriptor keys of every untrusted index.
    pub fn untrusted(&self) -> Vec<String> {
        self.untrusted.load().iter().cloned().collect()
    }

    /// Writes trusted descriptors for `names` inside a rebuild transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub fn mark_trusted(&self, txn: &mut dyn WriteTxn, names: &[String]) -> Result<()> {
        for name in names {
            let Some(definition) = self.definitions.get(name) else {
                continue;
            };
            let descriptor = StoredDescriptor { definition: definition.clone(), trusted: true };
            let bytes = encode(&descriptor).context(CodecSnafu)?;
            txn.put(&self.state_tree, name.as_bytes(), &bytes).context(StorageSnafu)?;
        }
        Ok(())
    }

    /// Publishes trust for `names` after their rebuild committed.
    pub fn publish_trusted(&self, names: &[String]) {
        self.untrusted.rcu(|current| {
            let mut next = BTreeSet::clone(current);
            for name in names {
                next.remove(name);
            }
            Arc::new(next)
        });
        tracing::info!(indexes = ?names, "indexes trusted after rebuild");
    }
}

/// Descriptor key of an attribute index tree.
pub fn index_descriptor(tree_name: &str) -> String {
    format!("{}{tree_name}", crate::keys::state::INDEX_PREFIX)
}

/// Descriptor key of a VLV index.
pub fn vlv_descriptor(name: &str) -> String {
    format!("{}{}", crate::keys::state::VLV_PREFIX, name.to_ascii_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_substrate::MemorySubstrate;

    use super::*;

    fn defs(entries: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        entries.iter().map(|(k, v)| (index_descriptor(k), v.to_vec())).collect()
    }

    #[test]
    fn test_new_indexes_on_empty_container_are_trusted() {
        let substrate = MemorySubstrate::new();
        let state = substrate.open_tree("state").unwrap();
        let trust =
            TrustState::reconcile(&substrate, state, defs(&[("cn.equality", b"v1")]), true).unwrap();
        assert!(trust.is_trusted(&index_descriptor("cn.equality")));
    }

    #[test]
    fn test_changed_definition_on_populated_container_is_untrusted() {
        let substrate = MemorySubstrate::new();
        let state = substrate.open_tree("state").unwrap();
        TrustState::reconcile(&substrate, state.clone(), defs(&[("cn.equality", b"v1")]), true)
            .unwrap();

        let same =
            TrustState::reconcile(&substrate, state.clone(), defs(&[("cn.equality", b"v1")]), false)
                .unwrap();
        assert!(same.is_trusted(&index_descriptor("cn.equality")));

        let changed = TrustState::reconcile(
            &substrate,
            state.clone(),
            defs(&[("cn.equality", b"v2"), ("sn.equality", b"v1")]),
            false,
        )
        .unwrap();
        assert_eq!(
            changed.untrusted(),
            vec![index_descriptor("cn.equality"), index_descriptor("sn.equality")]
        );

        let mut txn = substrate.begin_write().unwrap();
        changed.mark_trusted(txn.as_mut(), &[index_descriptor("cn.equality")]).unwrap();
        txn.commit().unwrap();
        changed.publish_trusted(&[index_descriptor("cn.equality")]);
        assert!(changed.is_trusted(&index_descriptor("cn.equality")));

        // The trusted flag survives reopening.
        let reopened = TrustState::reconcile(
            &substrate,
            state,
            defs(&[("cn.equality", b"v2"), ("sn.equality", b"v1")]),
            false,
        )
        .unwrap();
        assert_eq!(reopened.untrusted(), vec![index_descriptor("sn.equality")]);
    }

    #[test]
    fn test_removed_indexes_lose_their_descriptor() {
        let substrate = MemorySubstrate::new();
        let state = substrate.open_tree("state").unwrap();
        TrustState::reconcile(&substrate, state.clone(), defs(&[("cn.equality", b"v1")]), true)
            .unwrap();
        TrustState::reconcile(&substrate, state.clone(), BTreeMap::new(), false).unwrap();
        let txn = substrate.begin_read().unwrap();
        assert!(txn.get(&state, index_descriptor("cn.equality").as_bytes()).unwrap().is_none());
    }
}
