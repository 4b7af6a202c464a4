//! Relational engine backed by SQLite.
//!
//! Each tree is a `WITHOUT ROWID` table `(k BLOB PRIMARY KEY, v BLOB NOT NULL)`;
//! SQLite compares blobs with `memcmp`, so SQL ordering is byte ordering.
//! A single writer connection runs `BEGIN IMMEDIATE` transactions, and a
//! small pool of reader connections serves snapshot reads under WAL.

use std::{collections::HashSet, ops::Bound, path::Path};

use dirstore_types::config::{EngineKind, SubstrateConfig, SubstrateLimits};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, types::Value};
use snafu::{OptionExt, ResultExt};

use crate::{
    error::{
        InvalidConfigSnafu, IoSnafu, RelationalSnafu, Result, UnavailableSnafu, UnknownTreeSnafu,
        check_limits,
    },
    substrate::{Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn},
};

const TABLE_PREFIX: &str = "tree:";

fn table_name(tree: &str) -> String {
    format!("\"{TABLE_PREFIX}{}\"", tree.replace('"', "\"\""))
}

/// SQLite-backed substrate.
pub struct RelationalSubstrate {
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    known: RwLock<HashSet<String>>,
    config: SubstrateConfig,
}

impl RelationalSubstrate {
    /// Opens or creates the SQLite database at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured or SQLite cannot open the file.
    pub fn open(config: &SubstrateConfig) -> Result<Self> {
        config.validate().context(InvalidConfigSnafu)?;
        let path = config
            .path
            .as_deref()
            .context(UnavailableSnafu { message: "relational engine requires a path" })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(IoSnafu)?;
        }
        let writer = Self::connect(path, config, true)?;
        writer.pragma_update(None, "journal_mode", "WAL").context(RelationalSnafu)?;
        writer.pragma_update(None, "synchronous", "NORMAL").context(RelationalSnafu)?;

        let substrate = Self {
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            known: RwLock::new(HashSet::new()),
            config: config.clone(),
        };
        let names = substrate.tree_names()?;
        substrate.known.write().extend(names);
        tracing::debug!(path = %path.display(), "opened relational substrate");
        Ok(substrate)
    }

    fn connect(path: &Path, config: &SubstrateConfig, create: bool) -> Result<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(path, flags).context(RelationalSnafu)?;
        conn.busy_timeout(config.busy_timeout).context(RelationalSnafu)?;
        Ok(conn)
    }

    fn limits(&self) -> SubstrateLimits {
        self.config.limits()
    }

    fn ensure_known(&self, tree: &Tree) -> Result<()> {
        if self.known.read().contains(tree.name()) {
            Ok(())
        } else {
            UnknownTreeSnafu { name: tree.name() }.fail()
        }
    }

    fn checkout_reader(&self) -> Result<Connection> {
        if let Some(conn) = self.readers.lock().pop() {
            return Ok(conn);
        }
        let path = self
            .config
            .path
            .as_deref()
            .context(UnavailableSnafu { message: "relational engine requires a path" })?;
        Self::connect(path, &self.config, false)
    }

    fn return_reader(&self, conn: Connection) {
        let mut readers = self.readers.lock();
        if readers.len() < self.config.reader_pool_size {
            readers.push(conn);
        }
    }

    /// Copies the live database into a standalone SQLite file at `path`
    /// using SQLite's online backup.
    ///
    /// The copy can be opened directly with [`RelationalSubstrate::open`].
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be written.
    pub fn snapshot_database(&self, path: &Path) -> Result<()> {
        let source = self.checkout_reader()?;
        let mut dest = Connection::open(path).context(RelationalSnafu)?;
        {
            let backup = rusqlite::backup::Backup::new(&source, &mut dest).context(RelationalSnafu)?;
            backup
                .run_to_completion(256, std::time::Duration::from_millis(5), None)
                .context(RelationalSnafu)?;
        }
        self.return_reader(source);
        Ok(())
    }
}

impl Substrate for RelationalSubstrate {
    fn kind(&self) -> EngineKind {
        EngineKind::Relational
    }

    fn open_tree(&self, name: &str) -> Result<Tree> {
        if self.known.read().contains(name) {
            return Ok(Tree::new(name));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (k BLOB PRIMARY KEY, v BLOB NOT NULL) WITHOUT ROWID",
            table_name(name)
        );
        self.writer.lock().execute_batch(&sql).context(RelationalSnafu)?;
        self.known.write().insert(name.to_string());
        tracing::debug!(tree = name, "created relational tree");
        Ok(Tree::new(name))
    }

    fn tree_names(&self) -> Result<Vec<String>> {
        let conn = self.checkout_reader()?;
        let names = table_names(&conn)?;
        self.return_reader(conn);
        Ok(names)
    }

    fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
        let conn = self.checkout_reader()?;
        conn.execute_batch("BEGIN DEFERRED").context(RelationalSnafu)?;
        // A deferred transaction takes its snapshot at the first read.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .context(RelationalSnafu)?;
        Ok(Box::new(RelationalReadTxn { substrate: self, conn: Some(conn) }))
    }

    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        let conn = self.writer.lock();
        conn.execute_batch("BEGIN IMMEDIATE").context(RelationalSnafu)?;
        Ok(Box::new(RelationalWriteTxn { substrate: self, conn, finished: false }))
    }
}

// ============================================================================
// SQL helpers
// ============================================================================

fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .context(RelationalSnafu)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).context(RelationalSnafu)?;
    let mut names = Vec::new();
    for name in rows {
        let name = name.context(RelationalSnafu)?;
        if let Some(tree) = name.strip_prefix(TABLE_PREFIX) {
            names.push(tree.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn get_row(conn: &Connection, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let sql = format!("SELECT v FROM {} WHERE k = ?1", table_name(tree.name()));
    let mut stmt = conn.prepare_cached(&sql).context(RelationalSnafu)?;
    stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
        .optional()
        .context(RelationalSnafu)
}

fn scan_rows(
    conn: &Connection,
    tree: &Tree,
    range: &KeyRange,
    direction: Direction,
    limit: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if range.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for (bound, inclusive, exclusive) in [(&range.start, ">=", ">"), (&range.end, "<=", "<")] {
        match bound {
            Bound::Included(key) => {
                clauses.push(format!("k {inclusive} ?"));
                values.push(Value::Blob(key.clone()));
            },
            Bound::Excluded(key) => {
                clauses.push(format!("k {exclusive} ?"));
                values.push(Value::Blob(key.clone()));
            },
            Bound::Unbounded => {},
        }
    }
    let filter =
        if clauses.is_empty() { String::new() } else { format!(" WHERE {}", clauses.join(" AND ")) };
    let order = match direction {
        Direction::Forward => "ASC",
        Direction::Reverse => "DESC",
    };
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    let sql =
        format!("SELECT k, v FROM {}{filter} ORDER BY k {order} LIMIT ?", table_name(tree.name()));
    let mut stmt = conn.prepare_cached(&sql).context(RelationalSnafu)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .context(RelationalSnafu)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().context(RelationalSnafu)
}

// ============================================================================
// Transactions
// ============================================================================

struct RelationalReadTxn<'s> {
    substrate: &'s RelationalSubstrate,
    conn: Option<Connection>,
}

impl RelationalReadTxn<'_> {
    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().context(UnavailableSnafu { message: "read transaction closed" })
    }
}

impl ReadTxn for RelationalReadTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.substrate.ensure_known(tree)?;
        get_row(self.conn()?, tree, key)
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.substrate.ensure_known(tree)?;
        scan_rows(self.conn()?, tree, range, direction, limit)
    }
}

impl Drop for RelationalReadTxn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.execute_batch("COMMIT") {
                Ok(()) => self.substrate.return_reader(conn),
                Err(error) => tracing::warn!(%error, "discarding relational reader"),
            }
        }
    }
}

struct RelationalWriteTxn<'s> {
    substrate: &'s RelationalSubstrate,
    conn: MutexGuard<'s, Connection>,
    finished: bool,
}

impl RelationalWriteTxn<'_> {
    fn rollback(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Err(error) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(%error, "relational rollback failed");
            }
        }
    }
}

impl ReadTxn for RelationalWriteTxn<'_> {
    fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.substrate.ensure_known(tree)?;
        get_row(&self.conn, tree, key)
    }

    fn scan(
        &self,
        tree: &Tree,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.substrate.ensure_known(tree)?;
        scan_rows(&self.conn, tree, range, direction, limit)
    }
}

impl WriteTxn for RelationalWriteTxn<'_> {
    fn put(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> Result<()> {
        check_limits(&self.substrate.limits(), key, value)?;
        self.substrate.ensure_known(tree)?;
        let sql = format!("INSERT OR REPLACE INTO {} (k, v) VALUES (?1, ?2)", table_name(tree.name()));
        let mut stmt = self.conn.prepare_cached(&sql).context(RelationalSnafu)?;
        stmt.execute(params![key, value]).context(RelationalSnafu)?;
        Ok(())
    }

    fn delete(&mut self, tree: &Tree, key: &[u8]) -> Result<bool> {
        self.substrate.ensure_known(tree)?;
        let sql = format!("DELETE FROM {} WHERE k = ?1", table_name(tree.name()));
        let mut stmt = self.conn.prepare_cached(&sql).context(RelationalSnafu)?;
        let removed = stmt.execute(params![key]).context(RelationalSnafu)?;
        Ok(removed > 0)
    }

    fn clear(&mut self, tree: &Tree) -> Result<()> {
        self.substrate.ensure_known(tree)?;
        let sql = format!("DELETE FROM {}", table_name(tree.name()));
        self.conn.execute(&sql, []).context(RelationalSnafu)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        if let Err(error) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT can leave the transaction open.
            self.finished = false;
            self.rollback();
            return Err(error).context(RelationalSnafu);
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.rollback();
    }

    fn as_read(&self) -> &dyn ReadTxn {
        self
    }
}

impl Drop for RelationalWriteTxn<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}
