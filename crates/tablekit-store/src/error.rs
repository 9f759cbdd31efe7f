use tablekit_migrate::{Key, KeyKind, MigrationError};

/// Errors reported by a storage engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A store was opened at a version older than the one on disk.
    #[error("store is at v{existing}, cannot open at v{requested}")]
    VersionConflict { requested: u32, existing: u32 },
    /// Store versions start at 1.
    #[error("invalid store version {0}")]
    InvalidVersion(u32),
    /// `create_table` on a name that already exists.
    #[error("table `{0}` already exists")]
    TableExists(String),
    /// The table is not part of the store.
    #[error("table `{0}` not found")]
    TableNotFound(String),
    /// `create_index` on a column that is already indexed.
    #[error("index `{table}.{column}` already exists")]
    IndexExists { table: String, column: String },
    /// The column has no index.
    #[error("index `{table}.{column}` not found")]
    IndexNotFound { table: String, column: String },
    /// A duplicate primary key or a unique index violation.
    #[error("constraint violation in `{table}`: {detail}")]
    ConstraintViolation { table: String, detail: String },
    /// A key of the wrong kind for the table's key policy.
    #[error("table `{table}` uses {expected} keys, got a {found} key")]
    KeyKindMismatch {
        table: String,
        expected: KeyKind,
        found: KeyKind,
    },
    /// A caller-keyed table was written without a key.
    #[error("table `{table}` requires a caller-supplied key")]
    MissingKey { table: String },
    /// The table is not in the transaction's scope.
    #[error("table `{table}` is not in the transaction scope")]
    OutOfScope { table: String },
    /// A write inside a read-only transaction.
    #[error("write to `{table}` in a read-only transaction")]
    ReadOnly { table: String },
    /// The handle was closed.
    #[error("store handle is closed")]
    Closed,
    /// An internal lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
    /// Failure reported by the backend.
    #[error("backend error: {0}")]
    Backend(String),
    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn codec(e: impl std::fmt::Display) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Errors returned by [`Database`](crate::Database) and observables.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Opening or upgrading the store failed.
    #[error("structural error: {0}")]
    Structural(#[source] EngineError),
    /// A record-level operation failed.
    #[error("transport error: {0}")]
    Transport(#[from] EngineError),
    /// `update` on a key that does not exist.
    #[error("update conflict: no record {key} in `{table}`")]
    UpdateConflict { table: String, key: Key },
    /// The upgrade migration failed and the policy is to abort.
    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),
    /// The table is not part of the current schema.
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    /// The column is not indexed in the current schema.
    #[error("unknown index `{table}.{index}`")]
    UnknownIndex { table: String, index: String },
    /// A key of the wrong kind for the table.
    #[error("table `{table}` uses {expected} keys, got a {found} key")]
    KeyKindMismatch {
        table: String,
        expected: KeyKind,
        found: KeyKind,
    },
    /// A value could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    /// A stored value could not be deserialized into the requested type.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    /// Observables need a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}
