//! The entry container: the trees that hold entries and their hierarchy.
//!
//! | Tree          | Key                    | Value                          |
//! |---------------|------------------------|--------------------------------|
//! | `dn2id`       | DN key (see [`keys`])  | 8-byte entry id                |
//! | `id2entry`    | 8-byte entry id        | encoded entry ([`EntryCodec`]) |
//! | `id2children` | 8-byte entry id        | u64 count of direct children   |
//! | `id2subtree`  | 8-byte entry id        | u64 count of all descendants   |
//! | `attr_tokens` | see [`crate::tokens`]  |                                |
//! | `state`       | named keys             | counters and index descriptors |
//!
//! Counters are absent when zero. Every mutation goes through a caller-owned
//! write transaction; the container never commits on its own.

use std::collections::HashMap;

use dirstore_substrate::{
    CursorState, Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn, open_cursor,
};
use dirstore_types::{Dn, Entry, EntryId, config::EntryEncodingConfig};
use parking_lot::Mutex;
use snafu::ResultExt;

use crate::{
    entry_codec::{EntryCodec, StoredEntry},
    error::{BackendError, Result, StorageSnafu, corruption},
    keys::{self, dn_key, id_key, subtree_range},
    tokens::{PendingTokens, TokenTable},
};

/// Ids reserved per durable ceiling bump.
const ID_BLOCK: u64 = 1024;

/// Tree names of the entry container.
pub mod tree_names {
    /// DN key to entry id.
    pub const DN2ID: &str = "dn2id";
    /// Entry id to encoded entry.
    pub const ID2ENTRY: &str = "id2entry";
    /// Entry id to direct child count.
    pub const ID2CHILDREN: &str = "id2children";
    /// Entry id to descendant count.
    pub const ID2SUBTREE: &str = "id2subtree";
    /// Attribute name tokens.
    pub const ATTR_TOKENS: &str = "attr_tokens";
    /// Counters and descriptors.
    pub const STATE: &str = "state";
}

/// Handles to the container trees.
#[derive(Debug, Clone)]
pub struct ContainerTrees {
    /// DN key to entry id.
    pub dn2id: Tree,
    /// Entry id to encoded entry.
    pub id2entry: Tree,
    /// Direct child counts.
    pub id2children: Tree,
    /// Descendant counts.
    pub id2subtree: Tree,
    /// Counters and descriptors.
    pub state: Tree,
}

impl ContainerTrees {
    /// Trees a write to the entry itself touches. A conflict on one of these
    /// means another writer changed the same entry.
    pub fn is_entry_tree(name: &str) -> bool {
        name == tree_names::DN2ID || name == tree_names::ID2ENTRY
    }
}

/// Ids handed out by one transaction, to be confirmed after commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdReservation {
    ceiling: Option<u64>,
}

#[derive(Debug)]
struct AllocState {
    next: u64,
    /// Ids below this are covered by a committed ceiling.
    durable: u64,
}

/// Monotonic entry id allocator.
///
/// The highest id that may be in use is bounded by `state/id_ceiling`, which
/// is raised a block at a time inside the allocating transaction. On open the
/// allocator restarts above both the ceiling and the highest stored id, so an
/// id is never handed out twice even if earlier transactions aborted.
#[derive(Debug)]
struct IdAllocator {
    state: Mutex<AllocState>,
}

impl IdAllocator {
    fn allocate(
        &self,
        txn: &mut dyn WriteTxn,
        state_tree: &Tree,
        reservation: &mut IdReservation,
    ) -> Result<EntryId> {
        let mut state = self.state.lock();
        let id = state.next;
        let covered = state.durable.max(reservation.ceiling.unwrap_or(0));
        if id >= covered {
            let stored = read_u64(txn.as_read(), state_tree, keys::state::ID_CEILING)?;
            let ceiling = stored.max(id + ID_BLOCK);
            txn.put(state_tree, keys::state::ID_CEILING, &ceiling.to_be_bytes())
                .context(StorageSnafu)?;
            reservation.ceiling = Some(ceiling);
        }
        state.next = id + 1;
        Ok(EntryId::new(id))
    }

    fn confirm(&self, reservation: IdReservation) {
        if let Some(ceiling) = reservation.ceiling {
            let mut state = self.state.lock();
            state.durable = state.durable.max(ceiling);
        }
    }
}

/// The entry container.
#[derive(Debug)]
pub struct EntryContainer {
    base: Dn,
    trees: ContainerTrees,
    codec: EntryCodec,
    tokens: TokenTable,
    ids: IdAllocator,
}

#[allow(clippy::result_large_err)]
impl EntryContainer {
    /// Opens (creating if needed) the container trees on `substrate`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree cannot be opened, the encoding is invalid,
    /// or stored counters are malformed.
    pub fn open(substrate: &dyn Substrate, base: Dn, encoding: &EntryEncodingConfig) -> Result<Self> {
        let open = |name: &str| substrate.open_tree(name).context(StorageSnafu);
        let trees = ContainerTrees {
            dn2id: open(tree_names::DN2ID)?,
            id2entry: open(tree_names::ID2ENTRY)?,
            id2children: open(tree_names::ID2CHILDREN)?,
            id2subtree: open(tree_names::ID2SUBTREE)?,
            state: open(tree_names::STATE)?,
        };
        let token_tree = open(tree_names::ATTR_TOKENS)?;

        let txn = substrate.begin_read().context(StorageSnafu)?;
        let tokens = TokenTable::load(token_tree, txn.as_ref())?;
        let ceiling = read_u64(txn.as_ref(), &trees.state, keys::state::ID_CEILING)?;
        let highest = txn
            .scan(&trees.id2entry, &KeyRange::all(), Direction::Reverse, 1)
            .context(StorageSnafu)?
            .first()
            .and_then(|(k, _)| EntryId::from_key(k))
            .map_or(0, EntryId::value);
        drop(txn);

        let next = ceiling.max(highest + 1).max(1);
        tracing::debug!(base = %base, next_id = next, "opened entry container");
        Ok(Self {
            base,
            trees,
            codec: EntryCodec::new(encoding)?,
            tokens,
            ids: IdAllocator { state: Mutex::new(AllocState { next, durable: next }) },
        })
    }

    /// Handles to the container trees.
    pub fn trees(&self) -> &ContainerTrees {
        &self.trees
    }

    /// The attribute token table.
    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    /// The DN key of `dn`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::OutsideBase`] when `dn` is not within the base.
    pub fn key_for(&self, dn: &Dn) -> Result<Vec<u8>> {
        dn_key(&self.base, dn).ok_or_else(|| BackendError::OutsideBase {
            dn: dn.to_string(),
            base: self.base.to_string(),
        })
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// The entry id stored under a DN key.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed ids.
    pub fn id_for_key(&self, txn: &dyn ReadTxn, key: &[u8]) -> Result<Option<EntryId>> {
        match txn.get(&self.trees.dn2id, key).context(StorageSnafu)? {
            Some(value) => Ok(Some(decode_id(&value)?)),
            None => Ok(None),
        }
    }

    /// The entry id of `dn`, or `None` if it does not exist or lies outside the base.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed ids.
    pub fn id_for(&self, txn: &dyn ReadTxn, dn: &Dn) -> Result<Option<EntryId>> {
        match dn_key(&self.base, dn) {
            Some(key) => self.id_for_key(txn, &key),
            None => Ok(None),
        }
    }

    /// Decodes the entry stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage, codec, encryption or corruption error.
    pub fn read_entry(&self, txn: &dyn ReadTxn, id: EntryId) -> Result<Option<Entry>> {
        let Some(bytes) = txn.get(&self.trees.id2entry, &id_key(id)).context(StorageSnafu)? else {
            return Ok(None);
        };
        self.decode_entry(txn, &bytes).map(Some)
    }

    /// Decodes an `id2entry` value.
    ///
    /// # Errors
    ///
    /// Returns a codec, encryption or corruption error.
    pub fn decode_entry(&self, txn: &dyn ReadTxn, bytes: &[u8]) -> Result<Entry> {
        let stored = self.codec.open(bytes)?;
        let dn = Dn::parse(&stored.dn)
            .map_err(|e| corruption(format!("stored DN {:?} does not parse: {e}", stored.dn)))?;
        let mut entry = Entry::new(dn);
        for (token, values) in stored.attributes {
            let name = self.tokens.name_for(txn, token)?;
            entry.replace(&name, values);
        }
        Ok(entry)
    }

    /// Looks up an entry and its id by DN.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error.
    pub fn entry_by_dn(&self, txn: &dyn ReadTxn, dn: &Dn) -> Result<Option<(EntryId, Entry)>> {
        let Some(id) = self.id_for(txn, dn)? else {
            return Ok(None);
        };
        match self.read_entry(txn, id)? {
            Some(entry) => Ok(Some((id, entry))),
            None => Err(corruption(format!("dn2id maps {dn} to missing {id}"))),
        }
    }

    /// Ids of every existing ancestor of `dn` within the base, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NoSuchParent`] if an ancestor is missing.
    pub fn ancestor_ids(&self, txn: &dyn ReadTxn, dn: &Dn) -> Result<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(dn.depth());
        let mut current = dn.parent();
        while let Some(parent) = current {
            if !parent.is_within(&self.base) {
                break;
            }
            match self.id_for(txn, &parent)? {
                Some(id) => ids.push(id),
                None => return Err(BackendError::NoSuchParent { dn: parent.to_string() }),
            }
            current = parent.parent();
        }
        Ok(ids)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Reserves a fresh entry id inside `txn`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ceiling cannot be raised.
    pub fn allocate_id(
        &self,
        txn: &mut dyn WriteTxn,
        reservation: &mut IdReservation,
    ) -> Result<EntryId> {
        self.ids.allocate(txn, &self.trees.state, reservation)
    }

    /// Records that the transaction holding `reservation` committed.
    pub fn confirm_ids(&self, reservation: IdReservation) {
        self.ids.confirm(reservation);
    }

    /// Encodes and stores `entry` under `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage or encoding error.
    pub fn write_entry(
        &self,
        txn: &mut dyn WriteTxn,
        pending: &mut PendingTokens,
        id: EntryId,
        entry: &Entry,
    ) -> Result<()> {
        let mut attributes = Vec::with_capacity(entry.attribute_count());
        for attribute in entry.attributes() {
            let token = self.tokens.token_for(txn, pending, attribute.name())?;
            attributes.push((token, attribute.values().to_vec()));
        }
        attributes.sort_by_key(|(token, _)| *token);
        let bytes = self.codec.seal(&StoredEntry { dn: entry.dn().to_string(), attributes })?;
        txn.put(&self.trees.id2entry, &id_key(id), &bytes).context(StorageSnafu)
    }

    /// Maps a DN key to `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn bind_dn(&self, txn: &mut dyn WriteTxn, key: &[u8], id: EntryId) -> Result<()> {
        txn.put(&self.trees.dn2id, key, &id_key(id)).context(StorageSnafu)
    }

    /// Removes a DN key mapping.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn unbind_dn(&self, txn: &mut dyn WriteTxn, key: &[u8]) -> Result<()> {
        txn.delete(&self.trees.dn2id, key).context(StorageSnafu).map(|_| ())
    }

    /// Removes the entry record and its hierarchy counters.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove_entry(&self, txn: &mut dyn WriteTxn, id: EntryId) -> Result<()> {
        let key = id_key(id);
        txn.delete(&self.trees.id2entry, &key).context(StorageSnafu)?;
        txn.delete(&self.trees.id2children, &key).context(StorageSnafu)?;
        txn.delete(&self.trees.id2subtree, &key).context(StorageSnafu)?;
        Ok(())
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Number of direct children of `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed counters.
    pub fn children_count(&self, txn: &dyn ReadTxn, id: EntryId) -> Result<u64> {
        read_u64(txn, &self.trees.id2children, &id_key(id))
    }

    /// Number of descendants of `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed counters.
    pub fn subtree_count(&self, txn: &dyn ReadTxn, id: EntryId) -> Result<u64> {
        read_u64(txn, &self.trees.id2subtree, &id_key(id))
    }

    /// Number of entries in the container.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed counters.
    pub fn entry_count(&self, txn: &dyn ReadTxn) -> Result<u64> {
        read_u64(txn, &self.trees.state, keys::state::ENTRY_COUNT)
    }

    /// Applies accumulated counter deltas.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or corruption if a counter would go negative.
    pub fn apply_counters(&self, txn: &mut dyn WriteTxn, deltas: &CounterDeltas) -> Result<()> {
        for (id, delta) in &deltas.children {
            adjust_u64(txn, &self.trees.id2children, &id_key(*id), *delta)?;
        }
        for (id, delta) in &deltas.subtree {
            adjust_u64(txn, &self.trees.id2subtree, &id_key(*id), *delta)?;
        }
        if deltas.entries != 0 {
            adjust_u64(txn, &self.trees.state, keys::state::ENTRY_COUNT, deltas.entries)?;
        }
        Ok(())
    }

    // ========================================================================
    // Hierarchy scans
    // ========================================================================

    /// A scan over the direct children of the entry keyed `parent`.
    pub fn child_scan(&self, parent: &[u8]) -> ChildScan {
        ChildScan {
            parent: parent.to_vec(),
            cursor: CursorState::new(&self.trees.dn2id, subtree_range(parent), Direction::Forward),
        }
    }

    /// A scan over every strict descendant of the entry keyed `key`, parents
    /// before children.
    pub fn subtree_scan(&self, key: &[u8], direction: Direction) -> SubtreeScan {
        SubtreeScan { cursor: CursorState::new(&self.trees.dn2id, subtree_range(key), direction) }
    }

    /// Collects `(key, id)` for every strict descendant of `key`.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed ids.
    pub fn descendants(
        &self,
        txn: &dyn ReadTxn,
        key: &[u8],
        direction: Direction,
    ) -> Result<Vec<(Vec<u8>, EntryId)>> {
        open_cursor(txn, &self.trees.dn2id, subtree_range(key), direction)
            .map(|pair| {
                let (k, v) = pair.context(StorageSnafu)?;
                Ok((k, decode_id(&v)?))
            })
            .collect()
    }
}

/// Counter changes accumulated by one operation.
///
/// Deltas for the same entry are summed, so a move within one ancestor chain
/// writes each shared ancestor once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CounterDeltas {
    /// Direct child count changes.
    pub children: HashMap<EntryId, i64>,
    /// Descendant count changes.
    pub subtree: HashMap<EntryId, i64>,
    /// Entry count change.
    pub entries: i64,
}

impl CounterDeltas {
    /// Records `count` entries appearing (positive) or leaving (negative)
    /// below `parent`, whose ancestors are `ancestors` nearest first.
    pub fn attach(&mut self, parent: Option<EntryId>, ancestors: &[EntryId], count: i64) {
        if let Some(parent) = parent {
            *self.children.entry(parent).or_default() += count.signum();
        }
        for ancestor in ancestors {
            *self.subtree.entry(*ancestor).or_default() += count;
        }
    }

    fn prune(&mut self) {
        self.children.retain(|_, d| *d != 0);
        self.subtree.retain(|_, d| *d != 0);
    }

    /// Removes zero deltas.
    #[must_use]
    pub fn pruned(mut self) -> Self {
        self.prune();
        self
    }
}

/// Scan over direct children that skips grandchildren subtrees.
#[derive(Debug, Clone)]
pub struct ChildScan {
    parent: Vec<u8>,
    cursor: CursorState,
}

impl ChildScan {
    /// The next child `(key, id)`.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed ids.
    pub fn next(
        &mut self,
        txn: &dyn ReadTxn,
        dn2id: &Tree,
    ) -> Result<Option<(Vec<u8>, EntryId)>> {
        while let Some((key, value)) = self.cursor.next_pair(txn).context(StorageSnafu)? {
            if keys::is_child_key(&self.parent, &key) {
                return Ok(Some((key, decode_id(&value)?)));
            }
            // A grandchild: jump past the subtree of the child it belongs to.
            if let Some(child) = keys::child_component(&self.parent, &key) {
                let mut resume = child.to_vec();
                resume.push(keys::SEPARATOR + 1);
                let end = subtree_range(&self.parent).end;
                self.cursor = CursorState::new(
                    dn2id,
                    KeyRange { start: std::ops::Bound::Included(resume), end },
                    Direction::Forward,
                );
            }
        }
        Ok(None)
    }
}

/// Scan over every strict descendant.
#[derive(Debug, Clone)]
pub struct SubtreeScan {
    cursor: CursorState,
}

impl SubtreeScan {
    /// The next descendant `(key, id)`.
    ///
    /// # Errors
    ///
    /// Returns a storage error or corruption for malformed ids.
    pub fn next(&mut self, txn: &dyn ReadTxn) -> Result<Option<(Vec<u8>, EntryId)>> {
        match self.cursor.next_pair(txn).context(StorageSnafu)? {
            Some((key, value)) => Ok(Some((key, decode_id(&value)?))),
            None => Ok(None),
        }
    }
}

/// Decodes a `dn2id` value.
pub(crate) fn decode_id(bytes: &[u8]) -> Result<EntryId> {
    EntryId::from_key(bytes).ok_or_else(|| corruption(format!("entry id of {} bytes", bytes.len())))
}

pub(crate) fn read_u64(txn: &dyn ReadTxn, tree: &Tree, key: &[u8]) -> Result<u64> {
    match txn.get(tree, key).context(StorageSnafu)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| corruption(format!("counter in {tree} of {} bytes", bytes.len())))?;
            Ok(u64::from_be_bytes(raw))
        },
        None => Ok(0),
    }
}

pub(crate) fn write_u64(txn: &mut dyn WriteTxn, tree: &Tree, key: &[u8], value: u64) -> Result<()> {
    if value == 0 {
        txn.delete(tree, key).context(StorageSnafu)?;
    } else {
        txn.put(tree, key, &value.to_be_bytes()).context(StorageSnafu)?;
    }
    Ok(())
}

fn adjust_u64(txn: &mut dyn WriteTxn, tree: &Tree, key: &[u8], delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let current = read_u64(txn.as_read(), tree, key)?;
    let updated = current.checked_add_signed(delta).ok_or_else(|| {
        corruption(format!("counter in {tree} would drop below zero ({current} {delta:+})"))
    })?;
    write_u64(txn, tree, key, updated)
}
