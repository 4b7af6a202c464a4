//! In-memory substrate engine.
//!
//! Every key holds a short chain of versions. A committed transaction appends
//! one version per written key, stamped with the new commit version, and only
//! then advances the published version; readers resolve each key to the newest
//! version at or below their snapshot, so a commit becomes visible all at once.
//!
//! Write transactions are optimistic: they buffer writes in an overlay and
//! record the keys they read. At commit the write sets of every transaction
//! committed since this one began are checked for overlap with this one's
//! reads and writes; any overlap fails the commit with [`SubstrateError::Conflict`].
//!
//! The tree directory is copy-on-write and published through [`ArcSwap`], so
//! opening a tree never blocks readers.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use dirstore_types::config::{EngineKind, SubstrateConfig, SubstrateLimits};
use parking_lot::{Mutex, RwLock};

use crate::{
    error::{ConflictSnafu, FullSnafu, Result, UnknownTreeSnafu, check_limits},
    substrate::{Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn},
};

type Value = Option<Arc<[u8]>>;

#[derive(Debug, Clone)]
struct Version {
    at: u64,
    /// `None` is a tombstone.
    value: Value,
}

#[derive(Debug, Default)]
struct TreeData {
    keys: BTreeMap<Vec<u8>, Vec<Version>>,
}

impl TreeData {
    fn visible(chain: &[Version], snapshot: u64) -> Option<&Arc<[u8]>> {
        chain.iter().rev().find(|v| v.at <= snapshot).and_then(|v| v.value.as_ref())
    }

    fn get(&self, key: &[u8], snapshot: u64) -> Option<Arc<[u8]>> {
        self.keys.get(key).and_then(|chain| Self::visible(chain, snapshot)).cloned()
    }

    /// Visible pairs of `range` at `snapshot`, in `direction` order.
    fn visible_range<'a>(
        &'a self,
        range: &'a KeyRange,
        direction: Direction,
        snapshot: u64,
    ) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Arc<[u8]>)> + 'a> {
        if range.is_empty() {
            return Box::new(std::iter::empty());
        }
        let bounds = (range.start.clone(), range.end.clone());
        let iter = self.keys.range::<Vec<u8>, _>(bounds);
        let visible = move |(k, chain): (&'a Vec<u8>, &'a Vec<Version>)| {
            Self::visible(chain, snapshot).map(|v| (k, v))
        };
        match direction {
            Direction::Forward => Box::new(iter.filter_map(visible)),
            Direction::Reverse => Box::new(iter.rev().filter_map(visible)),
        }
    }

    /// Drops versions no snapshot at or after `horizon` can observe.
    fn collect_garbage(&mut self, key: &[u8], horizon: u64) {
        let Some(chain) = self.keys.get_mut(key) else {
            return;
        };
        // Keep the newest version at or below the horizon and everything above it.
        if let Some(keep_from) = chain.iter().rposition(|v| v.at <= horizon) {
            chain.drain(..keep_from);
            if chain.first().is_some_and(|v| v.at <= horizon && v.value.is_none()) {
                chain.remove(0);
            }
        }
        if chain.is_empty() {
            self.keys.remove(key);
        }
    }

    fn live_bytes(&self, snapshot: u64) -> u64 {
        self.keys
            .iter()
            .filter_map(|(k, chain)| Self::visible(chain, snapshot).map(|v| (k.len() + v.len()) as u64))
            .sum()
    }
}

type Directory = HashMap<String, Arc<RwLock<TreeData>>>;

/// Keys a transaction touched in one tree.
#[derive(Debug, Clone)]
enum Touched {
    /// The whole tree (cleared).
    All,
    Keys(HashSet<Vec<u8>>),
}

impl Touched {
    fn overlaps(&self, other: &Touched) -> bool {
        match (self, other) {
            (Touched::Keys(a), Touched::Keys(b)) => {
                let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                small.iter().any(|k| large.contains(k))
            },
            (Touched::Keys(k), Touched::All) | (Touched::All, Touched::Keys(k)) => !k.is_empty(),
            (Touched::All, Touched::All) => true,
        }
    }
}

type TouchSet = HashMap<String, Touched>;

#[derive(Debug, Default)]
struct CommitLog {
    /// Write sets of recent commits, oldest first.
    entries: VecDeque<(u64, Arc<TouchSet>)>,
}

/// Copy-on-write, multi-version in-memory substrate.
pub struct MemorySubstrate {
    directory: ArcSwap<Directory>,
    directory_lock: Mutex<()>,
    commit_log: Mutex<CommitLog>,
    version: AtomicU64,
    /// Active snapshot versions with reference counts.
    snapshots: Mutex<BTreeMap<u64, usize>>,
    used_bytes: AtomicU64,
    capacity_bytes: Option<u64>,
    limits: SubstrateLimits,
}

impl MemorySubstrate {
    /// Creates an empty substrate with default limits and no capacity bound.
    pub fn new() -> Self {
        Self::with_config(&SubstrateConfig::default())
    }

    /// Creates an empty substrate using the limits and capacity of `config`.
    pub fn with_config(config: &SubstrateConfig) -> Self {
        Self {
            directory: ArcSwap::from_pointee(HashMap::new()),
            directory_lock: Mutex::new(()),
            commit_log: Mutex::new(CommitLog::default()),
            version: AtomicU64::new(0),
            snapshots: Mutex::new(BTreeMap::new()),
            used_bytes: AtomicU64::new(0),
            capacity_bytes: config.memory_capacity_bytes,
            limits: config.limits(),
        }
    }

    /// Creates an empty substrate that refuses commits growing it past `bytes`.
    pub fn with_capacity(bytes: u64) -> Self {
        let mut substrate = Self::new();
        substrate.capacity_bytes = Some(bytes);
        substrate
    }

    /// Live key and value bytes at the latest committed version.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    fn register_snapshot(&self) -> u64 {
        let mut snapshots = self.snapshots.lock();
        let version = self.version.load(Ordering::Acquire);
        *snapshots.entry(version).or_default() += 1;
        version
    }

    fn release_snapshot(&self, version: u64) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&version);
            }
        }
    }

    fn tree_data(&self, tree: &Tree) -> Result<Arc<RwLock<TreeData>>> {
        self.directory
            .load()
            .get(tree.name())
            .cloned()
            .ok_or_else(|| UnknownTreeSnafu { name: tree.name() }.build())
    }

    /// Drops commit-log entries no active transaction needs and prunes the
    /// version chains they wrote.
    fn prune(&self, log: &mut CommitLog) {
        let horizon = {
            let snapshots = self.snapshots.lock();
            snapshots.keys().next().copied().unwrap_or_else(|| self.version.load(Ordering::Acquire))
        };
        let directory = self.directory.load();
        while log.entries.front().is_some_and(|(v, _)| *v <= horizon) {
            let Some((_, touched)) = log.entries.pop_front() else {
                break;
            };
            for (name, keys) in touched.iter() {
                let Some(data) = directory.get(name) else {
                    continue;
                };
                let mut data = data.write();
                match keys {
                    Touched::Keys(keys) => {
                        for key in keys {
                            data.collect_garbage(key, horizon);
                        }
                    },
                    Touched::All => {
                        let all: Vec<Vec<u8>> = data.keys.keys().cloned().collect();
                        for key in all {
                            data.collect_garbage(&key, horizon);
                        }
                    },
                }
            }
        }
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate for MemorySubstrate {
    fn kind(&self) -> EngineKind {
        EngineKind::Memory
    }

    fn open_tree(&self, name: &str) -> Result<Tree> {
        if self.directory.load().contains_key(name) {
            return Ok(Tree::new(name));
        }
        let _guard = self.directory_lock.lock();
        let current = self.directory.load_full();
        if !current.contains_key(name) {
            let mut next = (*current).clone();
            next.insert(name.to_string(), Arc::new(RwLock::new(TreeData::default())));
            self.directory.store(Arc::new(next));
        }
        Ok(Tree::new(name))
    }

    fn tree_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.directory.load().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let snapshot = self.register_snapshot();
        Ok(Box::new(MemoryReadTxn { substrate: self, snapshot }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        let snapshot = self.register_snapshot();
        Ok(Box::new(MemoryWriteTxn {
            substrate: self,
            snapshot,
            overlay: HashMap::new(),
            cleared: HashSet::new(),
            reads: RefCell::new(HashMap::new()),
            finished: false,
        }))
    }
}

// ============================================================================
// Read transaction
// ============================================================================

struct MemoryReadTxn<'s> {
    substrate: &'s MemorySubstrate,
    snapshot: u64,
}

impl ReadTxn for MemoryReadTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let data = self.substrate.tree_data(tree)?;
        let data = data.read();
        Ok(data.get(key, self.snapshot).map(|v| v.to_vec()))
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.substrate.tree_data(tree)?;
        let data = data.read();
        Ok(data
            .visible_range(range, direction, self.snapshot)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect())
    }
}

impl Drop for MemoryReadTxn<'_> {
    fn drop(&mut self) {
        self.substrate.release_snapshot(self.snapshot);
    }
}

// ============================================================================
// Write transaction
// ============================================================================

struct MemoryWriteTxn<'s> {
    substrate: &'s MemorySubstrate,
    snapshot: u64,
    overlay: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    cleared: HashSet<String>,
    /// Keys read through `get`, for conflict detection.
    reads: RefCell<HashMap<String, HashSet<Vec<u8>>>>,
    finished: bool,
}

impl MemoryWriteTxn<'_> {
    fn touched(&self) -> TouchSet {
        let mut touched = TouchSet::new();
        for (name, writes) in &self.overlay {
            touched.insert(name.clone(), Touched::Keys(writes.keys().cloned().collect()));
        }
        for name in &self.cleared {
            touched.insert(name.clone(), Touched::All);
        }
        touched
    }

    fn conflicts(&self, log: &CommitLog, mine: &TouchSet) -> Vec<String> {
        let reads = self.reads.borrow();
        let mut conflicting: Vec<String> = Vec::new();
        for (version, theirs) in &log.entries {
            if *version <= self.snapshot {
                continue;
            }
            for (name, their_keys) in theirs.iter() {
                let wrote = mine.get(name).is_some_and(|k| k.overlaps(their_keys));
                let read = reads
                    .get(name)
                    .is_some_and(|keys| Touched::Keys(keys.clone()).overlaps(their_keys));
                if (wrote || read) && !conflicting.contains(name) {
                    conflicting.push(name.clone());
                }
            }
        }
        conflicting.sort();
        conflicting
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.substrate.release_snapshot(self.snapshot);
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let substrate = self.substrate;
        let mut log = substrate.commit_log.lock();
        let mine = self.touched();

        let conflicting = self.conflicts(&log, &mine);
        if !conflicting.is_empty() {
            tracing::debug!(trees = ?conflicting, snapshot = self.snapshot, "memory commit conflict");
            return ConflictSnafu { tree: conflicting.join(",") }.fail();
        }
        if mine.is_empty() {
            return Ok(());
        }

        let current = substrate.version.load(Ordering::Acquire);
        let directory = substrate.directory.load_full();
        let mut trees = Vec::with_capacity(mine.len());
        for name in mine.keys() {
            let data = directory
                .get(name)
                .cloned()
                .ok_or_else(|| UnknownTreeSnafu { name: name.as_str() }.build())?;
            trees.push((name.clone(), data));
        }

        // Size the commit against the latest state before publishing anything.
        let mut grow: i128 = 0;
        for (name, data) in &trees {
            let data = data.read();
            if self.cleared.contains(name) {
                grow -= i128::from(data.live_bytes(current));
            }
            if let Some(writes) = self.overlay.get(name) {
                for (key, value) in writes {
                    let old = if self.cleared.contains(name) {
                        None
                    } else {
                        data.get(key, current)
                    };
                    if let Some(old) = old {
                        grow -= (key.len() + old.len()) as i128;
                    }
                    if let Some(new) = value {
                        grow += (key.len() + new.len()) as i128;
                    }
                }
            }
        }
        let used = i128::from(substrate.used_bytes.load(Ordering::Acquire));
        let after = u64::try_from((used + grow).max(0)).unwrap_or(u64::MAX);
        if let Some(capacity) = substrate.capacity_bytes {
            if grow > 0 && after > capacity {
                return FullSnafu {
                    message: format!("commit needs {after} bytes, capacity is {capacity}"),
                }
                .fail();
            }
        }

        let next = current + 1;
        for (name, data) in &trees {
            let mut data = data.write();
            if self.cleared.contains(name) {
                for chain in data.keys.values_mut() {
                    if chain.last().is_some_and(|v| v.value.is_some()) {
                        chain.push(Version { at: next, value: None });
                    }
                }
            }
            if let Some(writes) = self.overlay.get_mut(name) {
                for (key, value) in std::mem::take(writes) {
                    let value: Value = value.map(Arc::from);
                    data.keys.entry(key).or_default().push(Version { at: next, value });
                }
            }
        }
        substrate.used_bytes.store(after, Ordering::Release);
        substrate.version.store(next, Ordering::Release);
        log.entries.push_back((next, Arc::new(mine)));

        // Release our own snapshot before pruning so it does not pin the horizon.
        self.finish();
        substrate.prune(&mut log);
        Ok(())
    }
}

impl ReadTxn for MemoryWriteTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let name = tree.name();
        if let Some(pending) = self.overlay.get(name).and_then(|w| w.get(key)) {
            return Ok(pending.clone());
        }
        self.reads.borrow_mut().entry(name.to_string()).or_default().insert(key.to_vec());
        if self.cleared.contains(name) {
            return Ok(None);
        }
        let data = self.substrate.tree_data(tree)?;
        let data = data.read();
        Ok(data.get(key, self.snapshot).map(|v| v.to_vec()))
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let empty = BTreeMap::new();
        let data = self.substrate.tree_data(tree)?;
        let data = data.read();
        let base: Box<dyn Iterator<Item = (&Vec<u8>, &Arc<[u8]>)> + '_> =
            if self.cleared.contains(tree.name()) {
                Box::new(std::iter::empty())
            } else {
                data.visible_range(range, direction, self.snapshot)
            };
        let writes = self.overlay.get(tree.name()).unwrap_or(&empty);
        let pending: Box<dyn Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> + '_> = if range.is_empty() {
            Box::new(std::iter::empty())
        } else {
            let bounds: (Bound<&[u8]>, Bound<&[u8]>) = range.as_slices();
            let iter = writes.range::<[u8], _>(bounds);
            match direction {
                Direction::Forward => Box::new(iter),
                Direction::Reverse => Box::new(iter.rev()),
            }
        };
        Ok(merge(base, pending, direction, limit))
    }
}

/// Merges committed pairs with pending writes; pending entries win and
/// pending tombstones hide committed pairs.
fn merge<'a>(
    base: impl Iterator<Item = (&'a Vec<u8>, &'a Arc<[u8]>)>,
    pending: impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)>,
    direction: Direction,
    limit: usize,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut base = base.peekable();
    let mut pending = pending.peekable();
    let mut out = Vec::new();
    let before = |a: &[u8], b: &[u8]| match direction {
        Direction::Forward => a < b,
        Direction::Reverse => a > b,
    };
    while out.len() < limit {
        match (base.peek(), pending.peek()) {
            (None, None) => break,
            (Some((bk, bv)), None) => {
                out.push(((*bk).clone(), bv.to_vec()));
                base.next();
            },
            (Some((bk, bv)), Some((pk, _))) if before(bk.as_slice(), pk.as_slice()) => {
                out.push(((*bk).clone(), bv.to_vec()));
                base.next();
            },
            (Some((bk, _)), Some((pk, _))) if bk == pk => {
                base.next();
            },
            (_, Some((pk, pv))) => {
                if let Some(v) = pv {
                    out.push(((*pk).clone(), v.clone()));
                }
                pending.next();
            },
        }
    }
    out
}

impl WriteTxn for MemoryWriteTxn<'_> {
    fn put(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> Result<()> {
        check_limits(&self.substrate.limits, key, value)?;
        self.substrate.tree_data(tree)?;
        self.overlay
            .entry(tree.name().to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, tree: &Tree, key: &[u8]) -> Result<bool> {
        let existed = self.get(tree, key)?.is_some();
        self.overlay.entry(tree.name().to_string()).or_default().insert(key.to_vec(), None);
        Ok(existed)
    }

    fn clear(&mut self, tree: &Tree) -> Result<()> {
        self.substrate.tree_data(tree)?;
        self.cleared.insert(tree.name().to_string());
        self.overlay.remove(tree.name());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let result = self.commit_inner();
        self.finish();
        result
    }

    fn abort(mut self: Box<Self>) {
        self.finish();
    }

    fn as_read(&self) -> &dyn ReadTxn {
        self
    }
}

impl Drop for MemoryWriteTxn<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::SubstrateError;

    fn setup() -> (MemorySubstrate, Tree) {
        let substrate = MemorySubstrate::new();
        let tree = substrate.open_tree("t").unwrap();
        (substrate, tree)
    }

    fn put_committed(substrate: &MemorySubstrate, tree: &Tree, key: &[u8], value: &[u8]) {
        let mut txn = substrate.begin_write().unwrap();
        txn.put(tree, key, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_write_write_conflict_detected() {
        let (substrate, tree) = setup();
        put_committed(&substrate, &tree, b"k", b"0");

        let mut a = substrate.begin_write().unwrap();
        let mut b = substrate.begin_write().unwrap();
        a.put(&tree, b"k", b"a").unwrap();
        b.put(&tree, b"k", b"b").unwrap();
        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert!(matches!(err, SubstrateError::Conflict { .. }), "{err}");

        let read = substrate.begin_read().unwrap();
        assert_eq!(read.get(&tree, b"k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_read_write_conflict_detected() {
        let (substrate, tree) = setup();
        put_committed(&substrate, &tree, b"k", b"0");

        let mut a = substrate.begin_write().unwrap();
        let mut b = substrate.begin_write().unwrap();
        assert!(b.get(&tree, b"k").unwrap().is_some());
        a.delete(&tree, b"k").unwrap();
        a.commit().unwrap();
        b.put(&tree, b"other", b"x").unwrap();
        assert!(matches!(b.commit(), Err(SubstrateError::Conflict { .. })));
    }

    #[test]
    fn test_disjoint_writers_both_commit() {
        let (substrate, tree) = setup();
        let mut a = substrate.begin_write().unwrap();
        let mut b = substrate.begin_write().unwrap();
        a.put(&tree, b"a", b"1").unwrap();
        b.put(&tree, b"b", b"2").unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
        let read = substrate.begin_read().unwrap();
        assert_eq!(read.scan(&tree, &KeyRange::all(), Direction::Forward, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_survives_later_commits_and_gc() {
        let (substrate, tree) = setup();
        put_committed(&substrate, &tree, b"k", b"old");
        let read = substrate.begin_read().unwrap();
        for i in 0..5 {
            put_committed(&substrate, &tree, b"k", format!("new{i}").as_bytes());
        }
        assert_eq!(read.get(&tree, b"k").unwrap(), Some(b"old".to_vec()));
        drop(read);
        put_committed(&substrate, &tree, b"k", b"last");
        let chain_len = substrate.tree_data(&tree).unwrap().read().keys.get(&b"k"[..]).unwrap().len();
        assert_eq!(chain_len, 1, "old versions should be collected once no snapshot needs them");
    }

    #[test]
    fn test_deleted_keys_are_collected() {
        let (substrate, tree) = setup();
        put_committed(&substrate, &tree, b"k", b"v");
        let mut txn = substrate.begin_write().unwrap();
        txn.delete(&tree, b"k").unwrap();
        txn.commit().unwrap();
        assert!(substrate.tree_data(&tree).unwrap().read().keys.is_empty());
        assert_eq!(substrate.used_bytes(), 0);
    }

    #[test]
    fn test_capacity_rejects_growth_atomically() {
        let substrate = MemorySubstrate::with_capacity(10);
        let tree = substrate.open_tree("t").unwrap();
        put_committed(&substrate, &tree, b"a", b"1234");
        let mut txn = substrate.begin_write().unwrap();
        txn.put(&tree, b"b", b"1234").unwrap();
        txn.put(&tree, b"c", b"1234").unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, SubstrateError::Full { .. }));
        let read = substrate.begin_read().unwrap();
        assert!(read.get(&tree, b"b").unwrap().is_none());
        assert_eq!(substrate.used_bytes(), 5);
    }

    #[test]
    fn test_overlay_merge_in_scans() {
        let (substrate, tree) = setup();
        for k in [b"a", b"c", b"e"] {
            put_committed(&substrate, &tree, k, b"base");
        }
        let mut txn = substrate.begin_write().unwrap();
        txn.put(&tree, b"b", b"new").unwrap();
        txn.put(&tree, b"c", b"changed").unwrap();
        txn.delete(&tree, b"e").unwrap();
        let rows = txn.scan(&tree, &KeyRange::all(), Direction::Forward, 10).unwrap();
        let expect: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"a".to_vec(), b"base".to_vec()),
            (b"b".to_vec(), b"new".to_vec()),
            (b"c".to_vec(), b"changed".to_vec()),
        ];
        assert_eq!(rows, expect);
        let rev = txn.scan(&tree, &KeyRange::all(), Direction::Reverse, 2).unwrap();
        assert_eq!(rev[0].0, b"c".to_vec());
        assert_eq!(rev[1].0, b"b".to_vec());
    }

    #[test]
    fn test_clear_hides_base_and_counts_conflicts() {
        let (substrate, tree) = setup();
        put_committed(&substrate, &tree, b"a", b"1");
        let mut other = substrate.begin_write().unwrap();
        other.put(&tree, b"z", b"1").unwrap();

        let mut txn = substrate.begin_write().unwrap();
        txn.clear(&tree).unwrap();
        txn.put(&tree, b"b", b"2").unwrap();
        assert_eq!(txn.scan(&tree, &KeyRange::all(), Direction::Forward, 10).unwrap().len(), 1);
        txn.commit().unwrap();

        assert!(matches!(other.commit(), Err(SubstrateError::Conflict { .. })));
        let read = substrate.begin_read().unwrap();
        let rows = read.scan(&tree, &KeyRange::all(), Direction::Forward, 10).unwrap();
        assert_eq!(rows, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn test_unknown_tree() {
        let substrate = MemorySubstrate::new();
        let other = MemorySubstrate::new();
        let tree = other.open_tree("elsewhere").unwrap();
        let read = substrate.begin_read().unwrap();
        assert!(matches!(read.get(&tree, b"k"), Err(SubstrateError::UnknownTree { .. })));
    }
}
