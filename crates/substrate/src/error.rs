//! Substrate error types.

use dirstore_types::{ErrorCode, codec::CodecError, config::ConfigError};
use snafu::{Location, Snafu};

/// Result type alias for substrate operations.
pub type Result<T, E = SubstrateError> = std::result::Result<T, E>;

/// Errors raised by substrate engines.
///
/// Engine-specific sources are kept, and [`SubstrateError::code`] folds every
/// variant into the store's error taxonomy.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubstrateError {
    /// I/O or connectivity failure; the transaction is lost.
    #[snafu(display("storage unavailable: {message}"))]
    Unavailable {
        /// What failed.
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The engine ran out of space.
    #[snafu(display("storage full: {message}"))]
    Full {
        /// What ran out.
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// Key exceeds the configured format limit.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Value exceeds the configured format limit.
    #[snafu(display("Value too large: {size} bytes (max {max})"))]
    ValueTooLarge {
        /// Actual size of the value in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A concurrent transaction committed a conflicting write first.
    #[snafu(display("transaction conflict on tree {tree}"))]
    Conflict {
        /// Tree where the conflict was detected.
        tree: String,
    },

    /// The tree was never opened on this substrate.
    #[snafu(display("unknown tree {name}"))]
    UnknownTree {
        /// Tree name.
        name: String,
    },

    /// Persisted data has an invalid structure.
    #[snafu(display("corrupted substrate data: {reason}"))]
    Corrupted {
        /// What is wrong.
        reason: String,
    },

    /// Substrate configuration was rejected.
    #[snafu(display("invalid substrate configuration: {source}"))]
    InvalidConfig {
        /// The validation failure.
        source: ConfigError,
    },

    /// redb could not open the database file.
    #[snafu(display("failed to open embedded database: {source}"))]
    EmbeddedOpen {
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
        #[snafu(implicit)]
        location: Location,
    },

    /// redb could not begin a transaction.
    #[snafu(display("failed to begin embedded transaction: {source}"))]
    EmbeddedTransaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },

    /// redb could not open or list a table.
    #[snafu(display("failed to open embedded table: {source}"))]
    EmbeddedTable {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
        #[snafu(implicit)]
        location: Location,
    },

    /// redb failed to read or write a table.
    #[snafu(display("embedded storage error: {source}"))]
    EmbeddedStorage {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
        #[snafu(implicit)]
        location: Location,
    },

    /// redb failed to commit.
    #[snafu(display("failed to commit embedded transaction: {source}"))]
    EmbeddedCommit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
        #[snafu(implicit)]
        location: Location,
    },

    /// SQLite reported an error.
    #[snafu(display("relational storage error: {source}"))]
    Relational {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// Filesystem I/O failed (dumps, backups).
    #[snafu(display("I/O error: {source}"))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// A dump frame could not be encoded or decoded.
    #[snafu(display("dump codec error: {source}"))]
    Codec {
        source: CodecError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl SubstrateError {
    /// Maps this error onto the store-wide error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. }
            | Self::EmbeddedOpen { .. }
            | Self::EmbeddedTransaction { .. }
            | Self::EmbeddedTable { .. }
            | Self::EmbeddedCommit { .. }
            | Self::Io { .. } => ErrorCode::StorageUnavailable,
            Self::EmbeddedStorage { source, .. } => match source.as_ref() {
                redb::StorageError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                    ErrorCode::StorageFull
                },
                redb::StorageError::ValueTooLarge(_) => ErrorCode::ValueTooLarge,
                redb::StorageError::Corrupted(_) => ErrorCode::Corruption,
                _ => ErrorCode::StorageUnavailable,
            },
            Self::Full { .. } => ErrorCode::StorageFull,
            Self::KeyTooLarge { .. } => ErrorCode::KeyTooLarge,
            Self::ValueTooLarge { .. } => ErrorCode::ValueTooLarge,
            Self::Conflict { .. } => ErrorCode::ConcurrentModification,
            Self::UnknownTree { .. } => ErrorCode::Internal,
            Self::Corrupted { .. } => ErrorCode::Corruption,
            Self::InvalidConfig { .. } => ErrorCode::Config,
            Self::Relational { source, .. } => relational_code(source),
            Self::Codec { .. } => ErrorCode::Serialization,
        }
    }

    /// Whether retrying the whole operation in a new transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

fn relational_code(err: &rusqlite::Error) -> ErrorCode {
    use rusqlite::ErrorCode as Sqlite;
    match err.sqlite_error_code() {
        Some(Sqlite::DatabaseBusy | Sqlite::DatabaseLocked) => ErrorCode::ConcurrentModification,
        Some(Sqlite::DiskFull) => ErrorCode::StorageFull,
        Some(Sqlite::TooBig) => ErrorCode::ValueTooLarge,
        Some(Sqlite::DatabaseCorrupt | Sqlite::NotADatabase) => ErrorCode::Corruption,
        _ => ErrorCode::StorageUnavailable,
    }
}

/// Rejects keys and values above the configured limits.
pub(crate) fn check_limits(
    limits: &dirstore_types::config::SubstrateLimits,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    if key.len() > limits.max_key_size {
        return KeyTooLargeSnafu { size: key.len(), max: limits.max_key_size }.fail();
    }
    if value.len() > limits.max_value_size {
        return ValueTooLargeSnafu { size: value.len(), max: limits.max_value_size }.fail();
    }
    Ok(())
}
