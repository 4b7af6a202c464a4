//! Backend error types.

use dirstore_substrate::SubstrateError;
use dirstore_types::{ErrorCode, codec::CodecError, config::ConfigError};
use snafu::{Location, Snafu};

/// Result type alias for backend operations.
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Errors returned by backend operations.
///
/// Every variant maps onto the store-wide taxonomy via [`BackendError::code`].
/// An operation that returns any of these has left the container exactly as
/// it was before the call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    /// An entry with this DN already exists.
    #[snafu(display("entry {dn} already exists"))]
    EntryAlreadyExists {
        /// The conflicting DN.
        dn: String,
    },

    /// The target entry does not exist.
    #[snafu(display("no such entry {dn}"))]
    NoSuchEntry {
        /// The missing DN.
        dn: String,
    },

    /// The parent of an added or moved entry does not exist.
    #[snafu(display("parent {dn} does not exist"))]
    NoSuchParent {
        /// The missing parent DN.
        dn: String,
    },

    /// A non-leaf entry was deleted without cascade.
    #[snafu(display("entry {dn} has {children} subordinate entries"))]
    NotAllowedOnNonLeaf {
        /// The non-leaf DN.
        dn: String,
        /// Number of direct children.
        children: u64,
    },

    /// A modification added a value that is already present.
    #[snafu(display("attribute {attribute} of {dn} already holds the value"))]
    AttributeOrValueExists {
        /// The attribute.
        attribute: String,
        /// The entry.
        dn: String,
    },

    /// A modification removed a value or attribute that is absent.
    #[snafu(display("attribute {attribute} of {dn} does not hold the value"))]
    NoSuchAttribute {
        /// The attribute.
        attribute: String,
        /// The entry.
        dn: String,
    },

    /// A modification would remove a naming value of the entry.
    #[snafu(display("cannot remove RDN value of {attribute} from {dn}"))]
    NotAllowedOnRdn {
        /// The naming attribute.
        attribute: String,
        /// The entry.
        dn: String,
    },

    /// The DN lies outside the backend's naming context.
    #[snafu(display("{dn} is outside the backend base {base}"))]
    OutsideBase {
        /// The rejected DN.
        dn: String,
        /// The backend base DN.
        base: String,
    },

    /// A pre-commit hook rejected the operation.
    #[snafu(display("rejected by hook {hook}: {reason}"))]
    HookRejected {
        /// Name of the rejecting hook.
        hook: String,
        /// The hook's reason.
        reason: String,
    },

    /// The request is malformed.
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest {
        /// What is wrong.
        reason: String,
    },

    /// The operation observed a cancellation request.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The named index is not configured.
    #[snafu(display("unknown index {name}"))]
    UnknownIndex {
        /// The requested name.
        name: String,
    },

    /// The index must be rebuilt before it can answer requests.
    #[snafu(display("index {name} is not trusted; rebuild it first"))]
    IndexUntrusted {
        /// The index name.
        name: String,
    },

    /// A concurrent writer committed a conflicting change first.
    #[snafu(display("concurrent modification of {trees}"))]
    ConcurrentModification {
        /// Trees where the conflict was detected.
        trees: String,
    },

    /// The substrate failed.
    #[snafu(display("storage error: {source}"))]
    Storage {
        source: SubstrateError,
        #[snafu(implicit)]
        location: Location,
    },

    /// An internal record could not be encoded or decoded.
    #[snafu(display("codec error: {source}"))]
    Codec {
        source: CodecError,
        #[snafu(implicit)]
        location: Location,
    },

    /// Stored data violates the container layout.
    #[snafu(display("corrupted container data: {reason}"))]
    Corruption {
        /// What is wrong.
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// Entry encryption or decryption failed.
    #[snafu(display("entry encryption failed: {reason}"))]
    Encryption {
        /// What failed.
        reason: String,
    },

    /// The backend configuration was rejected.
    #[snafu(display("invalid backend configuration: {source}"))]
    Config {
        /// The validation failure.
        source: ConfigError,
    },

    /// Filesystem I/O failed (exports, imports).
    #[snafu(display("I/O error: {source}"))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl BackendError {
    /// Maps this error onto the store-wide error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EntryAlreadyExists { .. } => ErrorCode::EntryAlreadyExists,
            Self::NoSuchEntry { .. } => ErrorCode::NoSuchEntry,
            Self::NoSuchParent { .. } => ErrorCode::NoSuchParent,
            Self::NotAllowedOnNonLeaf { .. } => ErrorCode::NotAllowedOnNonLeaf,
            Self::AttributeOrValueExists { .. } => ErrorCode::AttributeOrValueExists,
            Self::NoSuchAttribute { .. } => ErrorCode::NoSuchAttribute,
            Self::NotAllowedOnRdn { .. } => ErrorCode::NotAllowedOnRdn,
            Self::OutsideBase { .. } => ErrorCode::OutsideBase,
            Self::HookRejected { .. } => ErrorCode::HookRejected,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::UnknownIndex { .. } => ErrorCode::UnknownIndex,
            Self::IndexUntrusted { .. } => ErrorCode::IndexUntrusted,
            Self::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            Self::Storage { source, .. } => source.code(),
            Self::Codec { .. } => ErrorCode::Serialization,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Encryption { .. } => ErrorCode::Encryption,
            Self::Config { .. } => ErrorCode::Config,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Whether reissuing the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

pub(crate) fn invalid_request(reason: impl Into<String>) -> BackendError {
    BackendError::InvalidRequest { reason: reason.into() }
}

pub(crate) fn corruption(reason: impl Into<String>) -> BackendError {
    CorruptionSnafu { reason: reason.into() }.build()
}
