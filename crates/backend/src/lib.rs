//! Pluggable entry store for a directory server.
//!
//! A [`Backend`] keeps one naming context of directory entries on an ordered
//! transactional [`Substrate`](dirstore_substrate::Substrate): the entry
//! container (`dn2id`, `id2entry` and the hierarchy counters), attribute
//! indexes mapping normalized keys to sorted entry id sets, and VLV indexes
//! keeping entries in a configured sort order. Every write runs through one
//! pipeline that updates the entry and all derived structures in a single
//! substrate transaction; searches plan a candidate set from the indexes and
//! stream matching entries lazily from one snapshot.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use dirstore_backend::Backend;
//! use dirstore_substrate::MemorySubstrate;
//! use dirstore_types::{
//!     Dn, Entry, Filter, Scope, SearchRequest,
//!     config::{BackendConfig, IndexConfig, IndexKind},
//! };
//!
//! let base = Dn::parse("dc=example,dc=com")?;
//! let config = BackendConfig::builder()
//!     .base_dn(base.clone())
//!     .indexes(vec![
//!         IndexConfig::builder()
//!             .attribute("uid".to_string())
//!             .kinds(vec![IndexKind::Equality])
//!             .build()?,
//!     ])
//!     .build()?;
//! let backend = Backend::open(config, Arc::new(MemorySubstrate::new()))?;
//!
//! backend.add(Entry::new(base.clone()).with("objectClass", &["domain"]), None)?;
//! backend.add(
//!     Entry::new(Dn::parse("uid=alice,dc=example,dc=com")?).with("objectClass", &["person"]),
//!     None,
//! )?;
//!
//! let request = SearchRequest::builder()
//!     .base(base)
//!     .scope(Scope::Subtree)
//!     .filter(Filter::parse("(uid=ALICE)")?)
//!     .build();
//! let found: Vec<Entry> = backend.search(&request)?.collect::<Result<_, _>>()?;
//! assert_eq!(found.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]

mod backend;
mod cancel;
mod container;
mod entry_codec;
mod entry_id_set;
mod error;
mod export;
mod hooks;
mod import;
mod index;
mod indexer;
mod keys;
mod operational;
mod pipeline;
mod plan;
mod rebuild;
mod search;
mod tokens;
mod trust;
mod verify;
mod vlv;

pub use backend::{Backend, restore_substrate};
pub use cancel::Cancellation;
pub use entry_id_set::EntryIdSet;
pub use error::{BackendError, Result};
pub use export::{
    EXPORT_MAGIC, EXPORT_VERSION, ExportFrame, ExportHeader, ExportReader, ExportRecord,
    ExportStream, write_export,
};
pub use hooks::{FnHook, HookContext, HookRejection, PreCommitHook, WriteKind};
pub use import::{ImportReport, Rejected};
pub use operational::{
    CREATE_TIMESTAMP, ENTRY_UUID, HAS_SUBORDINATES, MODIFY_TIMESTAMP, NUM_SUBORDINATES,
};
pub use pipeline::{WriteOutcome, WriteRequest};
pub use plan::{NodeReport, Resolution, SearchPlan, Strategy};
pub use rebuild::{IndexSelector, RebuildReport};
pub use search::SearchResults;
pub use verify::{Inconsistency, InconsistencyKind, VerifyOptions};
pub use vlv::{VlvRequest, VlvResponse, VlvTarget};
