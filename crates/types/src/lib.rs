//! Core types, errors, and configuration for the dirstore entry store.
//!
//! This crate provides the foundational vocabulary shared by every layer:
//! - Distinguished names and their normalized forms
//! - Entries, attributes, and modifications
//! - Matching rules used for index key derivation and filter evaluation
//! - The search filter AST with an RFC 4515 string parser
//! - Backend, index, and substrate configuration
//! - Machine-readable error codes using snafu

pub mod codec;
pub mod config;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod matching;
pub mod search;
pub mod types;

// Re-export commonly used types at crate root
pub use dn::{Ava, Dn, DnError, Rdn};
pub use entry::{Attribute, Entry, Modification, ModificationKind};
pub use error::{ErrorClass, ErrorCode};
pub use filter::{Filter, FilterError};
pub use matching::{MatchingRule, RuleSet};
pub use search::{Scope, SearchRequest, SearchStatus};
pub use types::EntryId;
