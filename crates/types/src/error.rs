//! Machine-readable error codes for the entry store.
//!
//! Every failure surfaced by the store maps to an [`ErrorCode`] with a unique
//! numeric identifier, an [`ErrorClass`] from the store's error taxonomy, a
//! retryability classification, and a suggested recovery action.

use core::fmt;

/// The taxonomy an error belongs to.
///
/// The class tells a caller how to react without inspecting the specific code:
/// input errors need a corrected request, resource and concurrency errors may
/// be retried, consistency errors need an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The request is invalid against the current directory contents.
    Input,
    /// The substrate could not complete the transaction.
    Resource,
    /// Another writer touched the same data first.
    Concurrency,
    /// Stored data violates a structural invariant.
    Consistency,
    /// Serialization, configuration, or other internal failure.
    Internal,
}

/// Machine-readable error codes.
///
/// Codes are organized into ranges:
///
/// | Range       | Class       | Examples                                      |
/// |-------------|-------------|-----------------------------------------------|
/// | 1000–1099   | Input       | Duplicate DN, missing parent, non-leaf delete |
/// | 2000–2099   | Resource    | Storage unavailable, storage full             |
/// | 3000–3099   | Concurrency | Concurrent modification                       |
/// | 4000–4099   | Consistency | Index references a missing entry, corruption  |
/// | 5000–5099   | Internal    | Serialization, configuration, I/O             |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // --- Input errors (1000–1099) ---
    /// An entry with this DN already exists.
    EntryAlreadyExists = 1000,
    /// The target entry does not exist.
    NoSuchEntry = 1001,
    /// The parent of the entry being added or moved does not exist.
    NoSuchParent = 1002,
    /// A non-leaf entry cannot be deleted without cascade.
    NotAllowedOnNonLeaf = 1003,
    /// A modification added a value that is already present.
    AttributeOrValueExists = 1004,
    /// A modification removed a value or attribute that is absent.
    NoSuchAttribute = 1005,
    /// A modification would remove a value of the entry's RDN.
    NotAllowedOnRdn = 1006,
    /// A DN could not be parsed.
    InvalidDn = 1007,
    /// A filter could not be parsed.
    InvalidFilter = 1008,
    /// The DN lies outside the container's base DN.
    OutsideBase = 1009,
    /// A pre-commit hook rejected the operation.
    HookRejected = 1010,
    /// The request is malformed (e.g. rename into own subtree).
    InvalidRequest = 1011,
    /// The operation was cancelled cooperatively.
    Cancelled = 1012,
    /// The named index is not configured.
    UnknownIndex = 1013,
    /// The index exists but must be rebuilt before it can serve requests.
    IndexUntrusted = 1014,

    // --- Resource errors (2000–2099) ---
    /// The substrate failed with an I/O or connectivity error.
    StorageUnavailable = 2000,
    /// The substrate ran out of space.
    StorageFull = 2001,
    /// A key exceeded the substrate's format limit.
    KeyTooLarge = 2002,
    /// A value exceeded the substrate's format limit.
    ValueTooLarge = 2003,

    // --- Concurrency errors (3000–3099) ---
    /// Another transaction modified the same data first.
    ConcurrentModification = 3000,

    // --- Consistency errors (4000–4099) ---
    /// An index references an entry that does not exist.
    IndexConsistency = 4000,
    /// Stored data could not be decoded.
    Corruption = 4001,

    // --- Internal errors (5000–5099) ---
    /// Serialization or deserialization failed.
    Serialization = 5000,
    /// Configuration is invalid.
    Config = 5001,
    /// Filesystem I/O outside the substrate failed.
    Io = 5002,
    /// Entry encryption or decryption failed.
    Encryption = 5003,
    /// Unexpected internal state.
    Internal = 5004,
}

impl ErrorCode {
    /// Returns the numeric code value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Converts a numeric code to an `ErrorCode`, returning `None` for unknown values.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_u16() == code)
    }

    /// Every defined code, in numeric order.
    pub const ALL: &'static [ErrorCode] = &[
        Self::EntryAlreadyExists,
        Self::NoSuchEntry,
        Self::NoSuchParent,
        Self::NotAllowedOnNonLeaf,
        Self::AttributeOrValueExists,
        Self::NoSuchAttribute,
        Self::NotAllowedOnRdn,
        Self::InvalidDn,
        Self::InvalidFilter,
        Self::OutsideBase,
        Self::HookRejected,
        Self::InvalidRequest,
        Self::Cancelled,
        Self::UnknownIndex,
        Self::IndexUntrusted,
        Self::StorageUnavailable,
        Self::StorageFull,
        Self::KeyTooLarge,
        Self::ValueTooLarge,
        Self::ConcurrentModification,
        Self::IndexConsistency,
        Self::Corruption,
        Self::Serialization,
        Self::Config,
        Self::Io,
        Self::Encryption,
        Self::Internal,
    ];

    /// The taxonomy class of this code.
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self.as_u16() {
            1000..=1999 => ErrorClass::Input,
            2000..=2999 => ErrorClass::Resource,
            3000..=3999 => ErrorClass::Concurrency,
            4000..=4999 => ErrorClass::Consistency,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether this error is retryable.
    ///
    /// Retryable errors may succeed when the whole operation is reissued in a
    /// fresh transaction. Non-retryable errors require corrective action first.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::StorageUnavailable | Self::ConcurrentModification)
    }

    /// Suggested recovery action for this error code.
    #[must_use]
    pub const fn suggested_action(self) -> &'static str {
        match self {
            Self::EntryAlreadyExists => "Choose a different DN or modify the existing entry.",
            Self::NoSuchEntry => "Verify the DN; the entry may have been deleted or renamed.",
            Self::NoSuchParent => "Add the parent entry first.",
            Self::NotAllowedOnNonLeaf => {
                "Delete the children first or request a cascading subtree delete."
            },
            Self::AttributeOrValueExists => "Remove the duplicate value from the modification.",
            Self::NoSuchAttribute => "Re-read the entry; the value to delete is not present.",
            Self::NotAllowedOnRdn => "Rename the entry before removing its naming value.",
            Self::InvalidDn => "Fix the DN syntax (RFC 4514).",
            Self::InvalidFilter => "Fix the filter syntax (RFC 4515).",
            Self::OutsideBase => "Send the request to the backend holding that naming context.",
            Self::HookRejected => "Inspect the rejection reason reported by the hook.",
            Self::InvalidRequest => "Correct the request parameters.",
            Self::Cancelled => "Reissue the operation if it is still wanted.",
            Self::UnknownIndex => "Check the index name against the backend configuration.",
            Self::IndexUntrusted => "Rebuild the index, then reissue the request.",
            Self::StorageUnavailable => "Retry the operation in a new transaction with backoff.",
            Self::StorageFull => "Free disk space or raise the storage quota, then retry.",
            Self::KeyTooLarge => "Shorten the DN or indexed value.",
            Self::ValueTooLarge => "Reduce the entry size or enable compression.",
            Self::ConcurrentModification => "Re-read the entry and retry the operation.",
            Self::IndexConsistency => "Run an index rebuild for the affected index.",
            Self::Corruption => "Restore from backup or re-import from an export.",
            Self::Serialization => "Report a bug; stored records could not be (de)serialized.",
            Self::Config => "Fix the backend configuration and reopen.",
            Self::Io => "Check file paths and permissions.",
            Self::Encryption => "Verify the configured entry encryption key.",
            Self::Internal => "Report a bug with the operation that triggered it.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<u16> = ErrorCode::ALL.iter().map(|c| c.as_u16()).collect();
        assert_eq!(codes.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn test_from_u16_roundtrip_for_every_code() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(*code));
        }
        assert_eq!(ErrorCode::from_u16(9999), None);
    }

    #[test]
    fn test_class_follows_ranges() {
        assert_eq!(ErrorCode::EntryAlreadyExists.class(), ErrorClass::Input);
        assert_eq!(ErrorCode::StorageFull.class(), ErrorClass::Resource);
        assert_eq!(ErrorCode::ConcurrentModification.class(), ErrorClass::Concurrency);
        assert_eq!(ErrorCode::IndexConsistency.class(), ErrorClass::Consistency);
        assert_eq!(ErrorCode::Serialization.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_only_transient_failures_are_retryable() {
        assert!(ErrorCode::ConcurrentModification.is_retryable());
        assert!(ErrorCode::StorageUnavailable.is_retryable());
        assert!(!ErrorCode::EntryAlreadyExists.is_retryable());
        assert!(!ErrorCode::IndexConsistency.is_retryable());
    }

    #[test]
    fn test_every_code_has_action() {
        for code in ErrorCode::ALL {
            assert!(!code.suggested_action().is_empty(), "{code:?} lacks an action");
        }
    }
}
