//! Ordered cursors over a tree, built on batched [`ReadTxn::scan`] calls.

use std::collections::VecDeque;

use crate::{
    error::Result,
    substrate::{Direction, KeyRange, ReadTxn, Tree},
};

const DEFAULT_BATCH: usize = 256;

/// Position of a scan that does not borrow its transaction.
///
/// Holders that own their transaction (e.g. a lazy search result) keep a
/// `CursorState` next to it and pass the transaction in on every step.
#[derive(Debug, Clone)]
pub struct CursorState {
    tree: Tree,
    range: KeyRange,
    direction: Direction,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    batch_size: usize,
    exhausted: bool,
}

impl CursorState {
    /// A cursor positioned before the first key of `range` in `direction`.
    pub fn new(tree: &Tree, range: KeyRange, direction: Direction) -> Self {
        let exhausted = range.is_empty();
        Self {
            tree: tree.clone(),
            range,
            direction,
            batch: VecDeque::new(),
            batch_size: DEFAULT_BATCH,
            exhausted,
        }
    }

    /// Sets how many pairs each underlying scan fetches.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Advances and returns the next pair.
    ///
    /// # Errors
    ///
    /// Returns an engine error from the underlying scan.
    pub fn next_pair(&mut self, txn: &dyn ReadTxn) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.batch.is_empty() && !self.exhausted {
            let rows = txn.scan(&self.tree, &self.range, self.direction, self.batch_size)?;
            if rows.len() < self.batch_size {
                self.exhausted = true;
            }
            if let Some((last, _)) = rows.last() {
                self.range = self.range.resume_after(last, self.direction);
            }
            self.batch.extend(rows);
        }
        Ok(self.batch.pop_front())
    }
}

/// An iterator over a tree range within a borrowed transaction.
pub struct Cursor<'t> {
    txn: &'t dyn ReadTxn,
    state: CursorState,
    failed: bool,
}

/// Opens a cursor over `range` of `tree`.
pub fn open_cursor<'t>(
    txn: &'t dyn ReadTxn,
    tree: &Tree,
    range: KeyRange,
    direction: Direction,
) -> Cursor<'t> {
    Cursor { txn, state: CursorState::new(tree, range, direction), failed: false }
}

impl Cursor<'_> {
    /// Sets how many pairs each underlying scan fetches.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.state = self.state.with_batch_size(batch_size);
        self
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.state.next_pair(self.txn) {
            Ok(pair) => pair.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            },
        }
    }
}
