//! Embedded B-tree engine backed by redb.
//!
//! Each tree is a redb table of raw byte keys and values. redb gives
//! serializable isolation with a single writer: `begin_write` blocks while
//! another write transaction is open, so commits never conflict. Readers work
//! on MVCC snapshots and never block the writer.

use std::{collections::HashSet, ops::Bound};

use dirstore_types::config::{EngineKind, SubstrateConfig, SubstrateLimits};
use parking_lot::RwLock;
use redb::{
    AccessGuard, Database, ReadableTable, StorageError, TableDefinition, TableError, TableHandle,
};
use snafu::{IntoError, ResultExt};

use crate::{
    error::{
        EmbeddedCommitSnafu, EmbeddedOpenSnafu, EmbeddedStorageSnafu, EmbeddedTableSnafu,
        EmbeddedTransactionSnafu, IoSnafu, Result, SubstrateError, UnavailableSnafu, UnknownTreeSnafu,
        check_limits,
    },
    substrate::{Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn},
};

type Bytes = &'static [u8];

fn definition(name: &str) -> TableDefinition<'_, Bytes, Bytes> {
    TableDefinition::new(name)
}

fn table_error(name: &str, err: TableError) -> SubstrateError {
    match err {
        TableError::TableDoesNotExist(_) => UnknownTreeSnafu { name }.build(),
        other => EmbeddedTableSnafu.into_error(other),
    }
}

/// redb-backed substrate.
pub struct EmbeddedSubstrate {
    db: Database,
    known: RwLock<HashSet<String>>,
    limits: SubstrateLimits,
}

impl EmbeddedSubstrate {
    /// Opens the database at `config.path`, or an in-memory database when no
    /// path is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or is not a redb database.
    pub fn open(config: &SubstrateConfig) -> Result<Self> {
        let db = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).context(IoSnafu)?;
                }
                Database::create(path).context(EmbeddedOpenSnafu)?
            },
            None => Database::builder()
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .context(EmbeddedOpenSnafu)?,
        };
        let substrate = Self { db, known: RwLock::new(HashSet::new()), limits: config.limits() };
        let names = substrate.tree_names()?;
        substrate.known.write().extend(names);
        Ok(substrate)
    }

    /// Opens an in-memory redb database with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if redb fails to initialize.
    pub fn in_memory() -> Result<Self> {
        Self::open(&SubstrateConfig { engine: EngineKind::Embedded, ..SubstrateConfig::default() })
    }

    fn ensure_known(&self, tree: &Tree) -> Result<()> {
        if self.known.read().contains(tree.name()) {
            Ok(())
        } else {
            UnknownTreeSnafu { name: tree.name() }.fail()
        }
    }
}

impl Substrate for EmbeddedSubstrate {
    fn kind(&self) -> EngineKind {
        EngineKind::Embedded
    }

    fn open_tree(&self, name: &str) -> Result<Tree> {
        if self.known.read().contains(name) {
            return Ok(Tree::new(name));
        }
        let txn = self.db.begin_write().context(EmbeddedTransactionSnafu)?;
        txn.open_table(definition(name)).context(EmbeddedTableSnafu)?;
        txn.commit().context(EmbeddedCommitSnafu)?;
        self.known.write().insert(name.to_string());
        tracing::debug!(tree = name, "created embedded tree");
        Ok(Tree::new(name))
    }

    fn tree_names(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read().context(EmbeddedTransactionSnafu)?;
        let mut names: Vec<String> = txn
            .list_tables()
            .context(EmbeddedStorageSnafu)?
            .map(|handle| handle.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let txn = self.db.begin_read().context(EmbeddedTransactionSnafu)?;
        Ok(Box::new(EmbeddedReadTxn { substrate: self, txn }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        let txn = self.db.begin_write().context(EmbeddedTransactionSnafu)?;
        Ok(Box::new(EmbeddedWriteTxn { substrate: self, txn: Some(txn) }))
    }
}

fn collect_rows<'a, I>(rows: I, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    I: Iterator<
        Item = std::result::Result<(AccessGuard<'a, Bytes>, AccessGuard<'a, Bytes>), StorageError>,
    >,
{
    let mut out = Vec::new();
    for row in rows.take(limit) {
        let (key, value) = row.context(EmbeddedStorageSnafu)?;
        out.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(out)
}

fn scan_table<T: ReadableTable<Bytes, Bytes>>(
    table: &T,
    range: &KeyRange,
    direction: Direction,
    limit: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if range.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let bounds: (Bound<&[u8]>, Bound<&[u8]>) = range.as_slices();
    let rows = table.range::<&[u8]>(bounds).context(EmbeddedStorageSnafu)?;
    match direction {
        Direction::Forward => collect_rows(rows, limit),
        Direction::Reverse => collect_rows(rows.rev(), limit),
    }
}

fn get_row<T: ReadableTable<Bytes, Bytes>>(table: &T, key: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(table.get(key).context(EmbeddedStorageSnafu)?.map(|guard| guard.value().to_vec()))
}

// ============================================================================
// Transactions
// ============================================================================

struct EmbeddedReadTxn<'s> {
    substrate: &'s EmbeddedSubstrate,
    txn: redb::ReadTransaction,
}

impl ReadTxn for EmbeddedReadTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.substrate.ensure_known(tree)?;
        let table =
            self.txn.open_table(definition(tree.name())).map_err(|e| table_error(tree.name(), e))?;
        get_row(&table, key)
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.substrate.ensure_known(tree)?;
        let table =
            self.txn.open_table(definition(tree.name())).map_err(|e| table_error(tree.name(), e))?;
        scan_table(&table, range, direction, limit)
    }
}

struct EmbeddedWriteTxn<'s> {
    substrate: &'s EmbeddedSubstrate,
    /// Taken on commit or abort.
    txn: Option<redb::WriteTransaction>,
}

impl EmbeddedWriteTxn<'_> {
    fn txn(&self, tree: &Tree) -> Result<&redb::WriteTransaction> {
        self.substrate.ensure_known(tree)?;
        self.txn
            .as_ref()
            .ok_or_else(|| UnavailableSnafu { message: "write transaction already finished" }.build())
    }
}

impl ReadTxn for EmbeddedWriteTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.txn(tree)?.open_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        get_row(&table, key)
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.txn(tree)?.open_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        scan_table(&table, range, direction, limit)
    }
}

impl WriteTxn for EmbeddedWriteTxn<'_> {
    fn put(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> Result<()> {
        check_limits(&self.substrate.limits, key, value)?;
        let mut table =
            self.txn(tree)?.open_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        table.insert(key, value).context(EmbeddedStorageSnafu)?;
        Ok(())
    }

    fn delete(&mut self, tree: &Tree, key: &[u8]) -> Result<bool> {
        let mut table =
            self.txn(tree)?.open_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        let existed = table.remove(key).context(EmbeddedStorageSnafu)?.is_some();
        Ok(existed)
    }

    fn clear(&mut self, tree: &Tree) -> Result<()> {
        let txn = self.txn(tree)?;
        txn.delete_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        txn.open_table(definition(tree.name())).context(EmbeddedTableSnafu)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.commit().context(EmbeddedCommitSnafu),
            None => Ok(()),
        }
    }

    fn abort(mut self: Box<Self>) {
        if let Some(txn) = self.txn.take() {
            if let Err(error) = txn.abort() {
                tracing::warn!(%error, "embedded abort failed");
            }
        }
    }

    fn as_read(&self) -> &dyn ReadTxn {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use dirstore_test_utils::TestDir;

    use super::*;

    #[test]
    fn test_reopen_preserves_trees_and_data() {
        let dir = TestDir::new();
        let config = SubstrateConfig::builder()
            .engine(EngineKind::Embedded)
            .path(dir.join("store.redb"))
            .build()
            .unwrap();
        {
            let substrate = EmbeddedSubstrate::open(&config).unwrap();
            let tree = substrate.open_tree("dn2id").unwrap();
            let mut txn = substrate.begin_write().unwrap();
            txn.put(&tree, b"k", b"v").unwrap();
            txn.commit().unwrap();
        }
        let substrate = EmbeddedSubstrate::open(&config).unwrap();
        assert_eq!(substrate.tree_names().unwrap(), vec!["dn2id".to_string()]);
        let tree = substrate.open_tree("dn2id").unwrap();
        let txn = substrate.begin_read().unwrap();
        assert_eq!(txn.get(&tree, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_unopened_tree_is_unknown() {
        let substrate = EmbeddedSubstrate::in_memory().unwrap();
        let other = EmbeddedSubstrate::in_memory().unwrap();
        let tree = other.open_tree("missing").unwrap();
        let txn = substrate.begin_read().unwrap();
        assert!(matches!(txn.get(&tree, b"k"), Err(SubstrateError::UnknownTree { .. })));
    }

    #[test]
    fn test_clear_recreates_empty_tree() {
        let substrate = EmbeddedSubstrate::in_memory().unwrap();
        let tree = substrate.open_tree("t").unwrap();
        let mut txn = substrate.begin_write().unwrap();
        txn.put(&tree, b"a", b"1").unwrap();
        txn.clear(&tree).unwrap();
        txn.put(&tree, b"b", b"2").unwrap();
        txn.commit().unwrap();
        let txn = substrate.begin_read().unwrap();
        let rows = txn.scan(&tree, &KeyRange::all(), Direction::Forward, 10).unwrap();
        assert_eq!(rows, vec![(b"b".to_vec(), b"2".to_vec())]);
    }
}
