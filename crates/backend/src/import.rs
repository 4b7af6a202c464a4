//! Bulk loading.
//!
//! Entries arrive parents first and are written in batches, one substrate
//! write transaction per batch. Index additions of a batch are buffered and
//! merged into the stored id sets once per key when the batch commits.
//! Entries that cannot be added are reported and skipped without aborting
//! their batch. Pre-commit hooks do not run during a bulk load.

use chrono::Utc;
use dirstore_substrate::{Substrate, WriteTxn};
use dirstore_types::{Entry, ErrorCode, RuleSet};
use snafu::ResultExt;

use crate::{
    cancel::Cancellation,
    container::{CounterDeltas, EntryContainer, IdReservation},
    error::{BackendError, Result, StorageSnafu},
    index::{IndexBuffer, IndexManager},
    operational,
    pipeline::add_rdn_values,
    tokens::PendingTokens,
    vlv::VlvManager,
};

/// An entry the loader skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// The entry's DN.
    pub dn: String,
    /// Why it was skipped.
    pub reason: String,
    /// Machine-readable cause.
    pub code: ErrorCode,
}

/// Outcome of a bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries committed.
    pub imported: u64,
    /// Entries skipped, in input order.
    pub rejected: Vec<Rejected>,
    /// Batches committed.
    pub batches: u64,
    /// Whether a cancellation stopped the load. Batches committed before the
    /// request stay; the batch in progress was discarded.
    pub cancelled: bool,
}

/// State of the batch in progress.
struct Batch<'t> {
    txn: Box<dyn WriteTxn + 't>,
    tokens: PendingTokens,
    ids: IdReservation,
    counters: CounterDeltas,
    buffer: IndexBuffer,
    entries: u64,
}

/// Writes entries in batches.
pub(crate) struct BulkLoader<'a> {
    pub substrate: &'a dyn Substrate,
    pub container: &'a EntryContainer,
    pub indexes: &'a IndexManager,
    pub vlv: &'a VlvManager,
    pub rules: &'a RuleSet,
    pub batch_size: usize,
    pub cancel: Option<&'a Cancellation>,
}

#[allow(clippy::result_large_err)]
impl BulkLoader<'_> {
    /// Loads every entry of `entries`.
    ///
    /// Input errors (an undecodable record in an import stream) abort the
    /// load after the batches committed so far.
    pub fn load<I>(&self, entries: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = Result<Entry>>,
    {
        let mut report = ImportReport::default();
        let mut batch = self.begin()?;

        for entry in entries {
            if self.cancel.is_some_and(Cancellation::is_cancelled) {
                tracing::info!(imported = report.imported, "bulk load cancelled");
                batch.txn.abort();
                report.cancelled = true;
                return Ok(report);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    batch.txn.abort();
                    return Err(e);
                },
            };
            match self.load_one(&mut batch, entry) {
                Ok(()) => {},
                Err(Rejection { dn, error }) if is_rejectable(&error) => {
                    tracing::debug!(dn = %dn, error = %error, "bulk load rejected entry");
                    report.rejected.push(Rejected { dn, reason: error.to_string(), code: error.code() });
                },
                Err(Rejection { error, .. }) => {
                    batch.txn.abort();
                    return Err(error);
                },
            }
            if batch.entries as usize >= self.batch_size {
                report.imported += self.commit(batch)?;
                report.batches += 1;
                batch = self.begin()?;
            }
        }

        if batch.entries > 0 {
            report.imported += self.commit(batch)?;
            report.batches += 1;
        } else {
            batch.txn.abort();
        }
        tracing::info!(
            imported = report.imported,
            rejected = report.rejected.len(),
            batches = report.batches,
            "bulk load finished"
        );
        Ok(report)
    }

    fn begin(&self) -> Result<Batch<'_>> {
        Ok(Batch {
            txn: self.substrate.begin_write().context(StorageSnafu)?,
            tokens: PendingTokens::default(),
            ids: IdReservation::default(),
            counters: CounterDeltas::default(),
            buffer: IndexBuffer::default(),
            entries: 0,
        })
    }

    fn load_one(&self, batch: &mut Batch<'_>, mut entry: Entry) -> Result<(), Rejection> {
        let dn = entry.dn().to_string();
        let reject = |error: BackendError| Rejection { dn: dn.clone(), error };

        let key = self.container.key_for(entry.dn()).map_err(reject)?;
        if self.container.id_for_key(batch.txn.as_read(), &key).map_err(reject)?.is_some() {
            return Err(reject(BackendError::EntryAlreadyExists { dn: dn.clone() }));
        }
        let ancestors = self.container.ancestor_ids(batch.txn.as_read(), entry.dn()).map_err(reject)?;

        if let Some(rdn) = entry.dn().rdn().cloned() {
            add_rdn_values(&mut entry, &rdn, self.rules);
        }
        operational::stamp_new(&mut entry, Utc::now());

        let id = self.container.allocate_id(batch.txn.as_mut(), &mut batch.ids).map_err(reject)?;
        self.container.bind_dn(batch.txn.as_mut(), &key, id).map_err(reject)?;
        self.container
            .write_entry(batch.txn.as_mut(), &mut batch.tokens, id, &entry)
            .map_err(reject)?;
        batch.buffer.add(id, self.indexes.changes(None, Some(&entry)));
        self.vlv
            .apply(batch.txn.as_mut(), &self.vlv.changes(id, None, Some(&entry), self.rules))
            .map_err(reject)?;

        batch.counters.attach(ancestors.first().copied(), &ancestors, 1);
        batch.counters.entries += 1;
        batch.entries += 1;
        Ok(())
    }

    fn commit(&self, batch: Batch<'_>) -> Result<u64> {
        let Batch { mut txn, tokens, ids, counters, mut buffer, entries } = batch;
        let staged = buffer.len();
        let prepared = buffer
            .flush(txn.as_mut())
            .and_then(|degraded| {
                self.container.apply_counters(txn.as_mut(), &counters.pruned())?;
                Ok(degraded)
            });
        let degraded = match prepared {
            Ok(degraded) => degraded,
            Err(e) => {
                txn.abort();
                return Err(e);
            },
        };
        txn.commit().context(StorageSnafu)?;
        self.container.confirm_ids(ids);
        if !tokens.is_empty() {
            let read = self.substrate.begin_read().context(StorageSnafu)?;
            self.container.tokens().publish(tokens, read.as_ref());
        }
        tracing::info!(entries, index_keys = staged, degraded, "bulk load batch committed");
        Ok(entries)
    }
}

/// A failure while loading one entry.
struct Rejection {
    dn: String,
    error: BackendError,
}

/// Whether `error` only concerns the entry at hand. These are all raised
/// before the entry touches the transaction.
fn is_rejectable(error: &BackendError) -> bool {
    matches!(
        error,
        BackendError::EntryAlreadyExists { .. }
            | BackendError::NoSuchParent { .. }
            | BackendError::OutsideBase { .. }
    )
}
