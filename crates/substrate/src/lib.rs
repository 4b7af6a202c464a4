//! Ordered transactional key-value substrate for the dirstore entry store.
//!
//! The entry container and its indexes are laid out as named trees of byte
//! keys and byte values. This crate defines that contract ([`Substrate`],
//! [`ReadTxn`], [`WriteTxn`]) and three engines satisfying it:
//!
//! - [`MemorySubstrate`]: multi-version trees with optimistic conflict detection
//! - [`EmbeddedSubstrate`]: an embedded B-tree file (redb)
//! - [`RelationalSubstrate`]: one SQLite table per tree
//!
//! All three give the same guarantees: writes are invisible to other
//! transactions until commit, commit is all-or-nothing, abort leaves no
//! trace, and a read transaction observes one consistent snapshot.
//!
//! # Example
//!
//! ```
//! use dirstore_substrate::{Direction, KeyRange, MemorySubstrate, Substrate};
//!
//! let substrate = MemorySubstrate::new();
//! let tree = substrate.open_tree("dn2id")?;
//!
//! let mut txn = substrate.begin_write()?;
//! txn.put(&tree, b"ou=people", b"1")?;
//! txn.commit()?;
//!
//! let txn = substrate.begin_read()?;
//! let rows = txn.scan(&tree, &KeyRange::all(), Direction::Forward, 10)?;
//! assert_eq!(rows.len(), 1);
//! # Ok::<(), dirstore_substrate::SubstrateError>(())
//! ```

mod cursor;
pub mod dump;
mod embedded;
mod error;
mod memory;
mod relational;
mod substrate;

use std::sync::Arc;

use snafu::ResultExt;

pub use cursor::{Cursor, CursorState, open_cursor};
pub use dirstore_types::config::{EngineKind, SubstrateConfig, SubstrateLimits};
pub use embedded::EmbeddedSubstrate;
pub use error::{Result, SubstrateError};
pub use memory::MemorySubstrate;
pub use relational::RelationalSubstrate;
pub use substrate::{Direction, KeyRange, ReadTxn, Substrate, Tree, WriteTxn};

/// Opens the engine selected by `config`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the engine cannot open
/// its database.
pub fn open_substrate(config: &SubstrateConfig) -> Result<Arc<dyn Substrate>> {
    config.validate().context(error::InvalidConfigSnafu)?;
    let substrate: Arc<dyn Substrate> = match config.engine {
        EngineKind::Memory => Arc::new(MemorySubstrate::with_config(config)),
        EngineKind::Embedded => Arc::new(EmbeddedSubstrate::open(config)?),
        EngineKind::Relational => Arc::new(RelationalSubstrate::open(config)?),
    };
    tracing::info!(engine = ?config.engine, path = ?config.path, "opened substrate");
    Ok(substrate)
}
