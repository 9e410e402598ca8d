//! Rich diagnostic error types for the neurograph store.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. Recoverable data
//! conditions (cache misses, index misses, skipped records) are logged by the
//! subsystems and never surface here; what does surface is either an I/O failure
//! or a programming error on the caller's side.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the neurograph store.
#[derive(Debug, Error, Diagnostic)]
pub enum NeuroError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Entity errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EntityError {
    #[error("invalid entity {id}: {reason}")]
    #[diagnostic(
        code(neuro::entity::invalid),
        help(
            "The entity is not usable where an identity is required. \
             Commit new entities with `Graph::add` before locking or linking them, \
             and never add the same handle twice."
        )
    )]
    InvalidEntity { id: String, reason: String },

    #[error("no entity with id {id}")]
    #[diagnostic(
        code(neuro::entity::not_found),
        help(
            "The id resolves to nothing, neither resident nor in the attached storage. \
             Check that the right graph file is loaded."
        )
    )]
    NotFound { id: u64 },

    #[error("entity {id} has been deleted")]
    #[diagnostic(
        code(neuro::entity::deleted),
        help("The entity was destroyed. Drop the handle and re-query the graph.")
    )]
    Deleted { id: u64 },

    #[error("entity {id} is a {actual}, expected {expected}")]
    #[diagnostic(
        code(neuro::entity::kind_mismatch),
        help("The operation only applies to entities of kind {expected}.")
    )]
    KindMismatch {
        id: u64,
        expected: String,
        actual: String,
    },

    #[error("id allocator exhausted")]
    #[diagnostic(
        code(neuro::entity::exhausted),
        help(
            "The id space is exhausted. This requires close to 2^64 allocations \
             and usually means an allocation loop."
        )
    )]
    AllocatorExhausted,
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error("entity {id} is not part of the held lock set")]
    #[diagnostic(
        code(neuro::lock::not_held),
        help(
            "Guarded mutators only touch entities the lock set was acquired for. \
             Include every entity the operation touches in `request_locks`."
        )
    )]
    NotHeld { id: u64 },

    #[error("thread already holds {held} lock set(s) on this graph")]
    #[diagnostic(
        code(neuro::lock::nested),
        help(
            "Lock sets are not re-entrant. Release the current set (or the view \
             holding it) before requesting another, or request everything at once."
        )
    )]
    Nested { held: usize },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(neuro::store::io),
        help(
            "A filesystem operation failed. Check that the path exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(neuro::store::serde),
        help("Failed to encode an entity record. This indicates a bug; please report it.")
    )]
    Serialization { message: String },

    #[error("invalid graph file {path}: {message}")]
    #[diagnostic(
        code(neuro::store::header),
        help("The file is not a neurograph file, or was written by an incompatible version.")
    )]
    InvalidHeader { path: String, message: String },

    #[error("malformed record for entity {id}: {message}")]
    #[diagnostic(
        code(neuro::store::malformed),
        help("The record could not be decoded. It is skipped; the rest of the graph stays usable.")
    )]
    Malformed { id: u64, message: String },

    #[error("record {id} references missing entity {missing}")]
    #[diagnostic(
        code(neuro::store::referential),
        help(
            "The stored data is partial or corrupt. The record is skipped; \
             re-import the source data to repair it."
        )
    )]
    ReferentialViolation { id: u64, missing: u64 },

    #[error("operation cancelled")]
    #[diagnostic(
        code(neuro::store::cancelled),
        help("The cancellation flag was raised. The previous file, if any, is untouched.")
    )]
    Cancelled,
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        StoreError::Io { source }
    }
}

// ---------------------------------------------------------------------------
// Index errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("scalar kind {kind} is not registered with the index")]
    #[diagnostic(
        code(neuro::index::unsupported),
        help(
            "Add the kind to `index.kinds` in the graph configuration, \
             or fall back to scanning the out-links."
        )
    )]
    UnsupportedQuery { kind: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(neuro::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(neuro::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(neuro::config::invalid), help("Check the GraphConfig fields. {message}"))]
    Invalid { message: String },
}

/// Convenience alias for functions returning neurograph results.
pub type NeuroResult<T> = std::result::Result<T, NeuroError>;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
