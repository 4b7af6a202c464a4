//! The substrate contract: named ordered trees inside transactions.

use std::{fmt, ops::Bound, path::Path, sync::Arc};

use dirstore_types::config::EngineKind;

use crate::error::Result;

/// Handle to a named tree.
///
/// Cheap to clone. Obtained from [`Substrate::open_tree`], which creates the
/// tree if it does not exist yet.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tree(Arc<str>);

impl Tree {
    pub(crate) fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The tree's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree({})", self.0)
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Reverse,
}

/// A range of keys in byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub start: Bound<Vec<u8>>,
    /// Upper bound.
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// Keys starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let end = match prefix_successor(prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        Self { start: Bound::Included(prefix.to_vec()), end }
    }

    /// Keys in `[start, end)`.
    pub fn half_open(start: &[u8], end: &[u8]) -> Self {
        Self { start: Bound::Included(start.to_vec()), end: Bound::Excluded(end.to_vec()) }
    }

    /// Keys `>= start`.
    pub fn at_or_after(start: &[u8]) -> Self {
        Self { start: Bound::Included(start.to_vec()), end: Bound::Unbounded }
    }

    /// Keys `<= end`.
    pub fn at_or_before(end: &[u8]) -> Self {
        Self { start: Bound::Unbounded, end: Bound::Included(end.to_vec()) }
    }

    /// Keys `< end`.
    pub fn before(end: &[u8]) -> Self {
        Self { start: Bound::Unbounded, end: Bound::Excluded(end.to_vec()) }
    }

    /// Whether `key` lies in the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Whether no key can lie in the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s) | Bound::Excluded(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
            _ => false,
        }
    }

    /// Narrows the range to continue after `key` in `direction`.
    pub(crate) fn resume_after(&self, key: &[u8], direction: Direction) -> Self {
        match direction {
            Direction::Forward => {
                Self { start: Bound::Excluded(key.to_vec()), end: self.end.clone() }
            },
            Direction::Reverse => {
                Self { start: self.start.clone(), end: Bound::Excluded(key.to_vec()) }
            },
        }
    }

    pub(crate) fn as_slices(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (as_slice_bound(&self.start), as_slice_bound(&self.end))
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The smallest key greater than every key starting with `prefix`, or `None`
/// if no such key exists (the prefix is empty or all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.pop() {
        if last < 0xFF {
            successor.push(last + 1);
            return Some(successor);
        }
    }
    None
}

/// Read access to a consistent snapshot.
pub trait ReadTxn {
    /// Reads one key.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to read.
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Reads up to `limit` key-value pairs in `range`, in key order for
    /// `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to read.
    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Whether a key is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to read.
    fn contains(&self, tree: &Tree, key: &[u8]) -> Result<bool> {
        Ok(self.get(tree, key)?.is_some())
    }
}

/// A write transaction. Reads observe the transaction's own writes.
///
/// Dropping a write transaction without committing aborts it.
pub trait WriteTxn: ReadTxn {
    /// Inserts or replaces a key.
    ///
    /// # Errors
    ///
    /// Returns `KeyTooLarge`/`ValueTooLarge` above the engine limits, or an
    /// engine error.
    fn put(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes a key, returning whether it was present.
    ///
    /// # Errors
    ///
    /// Returns an engine error.
    fn delete(&mut self, tree: &Tree, key: &[u8]) -> Result<bool>;

    /// Removes every key of a tree.
    ///
    /// # Errors
    ///
    /// Returns an engine error.
    fn clear(&mut self, tree: &Tree) -> Result<()>;

    /// Makes every write visible atomically.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a concurrent transaction committed an overlapping
    /// write first, `Full` if the engine ran out of space, or an engine error.
    /// On error nothing from this transaction is visible.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every write.
    fn abort(self: Box<Self>);

    /// This transaction as a read view.
    fn as_read(&self) -> &dyn ReadTxn;
}

/// An ordered, transactional key-value tree provider.
pub trait Substrate: Send + Sync {
    /// The engine behind this substrate.
    fn kind(&self) -> EngineKind;

    /// Opens (creating if needed) a named tree.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the tree cannot be created.
    fn open_tree(&self, name: &str) -> Result<Tree>;

    /// Names of every existing tree, sorted.
    ///
    /// # Errors
    ///
    /// Returns an engine error.
    fn tree_names(&self) -> Result<Vec<String>>;

    /// Starts a read-only snapshot transaction.
    ///
    /// # Errors
    ///
    /// Returns an engine error.
    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>>;

    /// Starts a write transaction.
    ///
    /// # Errors
    ///
    /// Returns an engine error.
    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>>;

    /// Writes a consistent snapshot of every tree to `path`.
    ///
    /// The default writes a compressed tree dump readable by
    /// [`crate::dump::restore_from_file`].
    ///
    /// # Errors
    ///
    /// Returns an I/O or engine error.
    fn backup_to(&self, path: &Path) -> Result<()> {
        crate::dump::dump_to_file(self, path).map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_prefix_range_contains() {
        let range = KeyRange::prefix(b"ou=people\x00");
        assert!(range.contains(b"ou=people\x00uid=a"));
        assert!(!range.contains(b"ou=people"));
        assert!(!range.contains(b"ou=people\x01"));
        assert!(KeyRange::prefix(b"").contains(b"anything"));
    }

    #[test]
    fn test_range_is_empty() {
        assert!(KeyRange::half_open(b"b", b"b").is_empty());
        assert!(!KeyRange::half_open(b"a", b"b").is_empty());
        assert!(!KeyRange::all().is_empty());
        let r = KeyRange { start: Bound::Included(b"c".to_vec()), end: Bound::Included(b"c".to_vec()) };
        assert!(!r.is_empty());
    }

    #[test]
    fn test_resume_after() {
        let range = KeyRange::half_open(b"a", b"z");
        let next = range.resume_after(b"m", Direction::Forward);
        assert!(!next.contains(b"m"));
        assert!(next.contains(b"n"));
        let prev = range.resume_after(b"m", Direction::Reverse);
        assert!(prev.contains(b"l"));
        assert!(!prev.contains(b"m"));
    }
}
