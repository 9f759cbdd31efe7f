use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablekit_migrate::{Key, KeyKind, Record};

use crate::error::EngineError;

/// How a table assigns primary keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPolicy {
    /// Engine-assigned increasing integers. A caller may still supply a
    /// numeric key; the sequence then continues past it.
    AutoIncrement,
    /// Caller-supplied string keys.
    CallerKey,
}

impl KeyPolicy {
    /// The policy for a key kind.
    pub fn for_kind(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Number => Self::AutoIncrement,
            KeyKind::Text => Self::CallerKey,
        }
    }

    /// The key kind this policy produces.
    pub fn key_kind(self) -> KeyKind {
        match self {
            Self::AutoIncrement => KeyKind::Number,
            Self::CallerKey => KeyKind::Text,
        }
    }
}

/// A secondary index over one top-level field of the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed field name.
    pub column: String,
    /// Whether two records may share an indexed value.
    pub unique: bool,
}

/// Persisted structure of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Primary key policy.
    pub key_policy: KeyPolicy,
    /// Secondary indexes.
    pub indexes: Vec<IndexSpec>,
}

impl TableLayout {
    /// A layout with no indexes.
    pub fn new(key_policy: KeyPolicy) -> Self {
        Self {
            key_policy,
            indexes: Vec::new(),
        }
    }

    /// The index on `column`, if any.
    pub fn index(&self, column: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.column == column)
    }

    /// Postcard bytes for engine metadata.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        postcard::to_allocvec(self).map_err(EngineError::codec)
    }

    /// Decode metadata written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        postcard::from_bytes(bytes).map_err(EngineError::codec)
    }

    /// Resolve the key a write will use.
    ///
    /// `last_auto` is the highest numeric key the table has seen; an
    /// auto-increment write without a key gets the one after it.
    pub fn resolve_key(
        &self,
        table: &str,
        key: Option<&Key>,
        last_auto: u64,
    ) -> Result<Key, EngineError> {
        match (self.key_policy, key) {
            (KeyPolicy::AutoIncrement, None) => last_auto
                .checked_add(1)
                .map(Key::Number)
                .ok_or_else(|| EngineError::ConstraintViolation {
                    table: table.to_string(),
                    detail: "auto-increment key generator exhausted".to_string(),
                }),
            (KeyPolicy::CallerKey, None) => Err(EngineError::MissingKey {
                table: table.to_string(),
            }),
            (policy, Some(key)) if key.kind() == policy.key_kind() => Ok(key.clone()),
            (policy, Some(key)) => Err(EngineError::KeyKindMismatch {
                table: table.to_string(),
                expected: policy.key_kind(),
                found: key.kind(),
            }),
        }
    }
}

/// The value a record contributes to an index on `column`.
///
/// Missing and `null` fields are not indexed.
pub fn index_value<'a>(value: &'a Value, column: &str) -> Option<&'a Value> {
    value.get(column).filter(|v| !v.is_null())
}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes, committed atomically.
    ReadWrite,
}

/// A store known to an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Store name.
    pub name: String,
    /// Stored schema version.
    pub version: u32,
}

/// A finite, forward-only, rewindable sequence of records.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    records: Vec<Record>,
    pos: usize,
}

impl Cursor {
    /// A cursor over `records`, in order.
    pub fn new(records: Vec<Record>) -> Self {
        Self { records, pos: 0 }
    }

    /// Move back to the first record.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// The record the cursor points at, without advancing.
    pub fn peek(&self) -> Option<&Record> {
        self.records.get(self.pos)
    }

    /// Records not yet visited.
    pub fn remaining(&self) -> usize {
        self.records.len().saturating_sub(self.pos)
    }

    /// Every record, regardless of position.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl Iterator for Cursor {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let record = self.records.get(self.pos)?.clone();
        self.pos += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

/// Structural changes allowed while a store's version is being raised.
pub trait SchemaEditor {
    /// Tables currently in the store.
    fn table_names(&self) -> Result<Vec<String>, EngineError>;

    /// Create an empty table.
    fn create_table(&mut self, name: &str, key_policy: KeyPolicy) -> Result<(), EngineError>;

    /// Add a secondary index to an existing table.
    fn create_index(&mut self, table: &str, column: &str, unique: bool) -> Result<(), EngineError>;

    /// Remove a table with its records and indexes.
    fn drop_table(&mut self, name: &str) -> Result<(), EngineError>;
}

/// Callback run by [`StorageEngine::open_store`] when the version is raised.
///
/// Receives the editor and the previous version (0 for a new store).
pub type SetupFn<'a> = dyn FnMut(&mut dyn SchemaEditor, u32) -> Result<(), EngineError> + 'a;

/// Operations available inside [`StoreHandle::transaction`].
///
/// Every call names its table, which must be in the transaction's scope.
pub trait Transaction {
    /// The mode the transaction was opened with.
    fn mode(&self) -> TxMode;

    /// Value stored under `key`.
    fn get(&mut self, table: &str, key: &Key) -> Result<Option<Value>, EngineError>;

    /// Every record, in key order.
    fn get_all(&mut self, table: &str) -> Result<Vec<Record>, EngineError>;

    /// Insert or replace. Returns the key used.
    fn put(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError>;

    /// Insert; fails with a constraint violation when the key exists.
    fn add(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError>;

    /// Remove a record. Absent keys are not an error.
    fn delete(&mut self, table: &str, key: &Key) -> Result<(), EngineError>;

    /// Remove every record. The auto-increment sequence is kept.
    fn clear(&mut self, table: &str) -> Result<(), EngineError>;

    /// Number of records.
    fn count(&mut self, table: &str) -> Result<u64, EngineError>;

    /// Open a cursor over the whole table or, with `(column, value)`, over
    /// the records whose indexed field equals `value`. Key order either way.
    fn open_cursor(
        &mut self,
        table: &str,
        query: Option<(&str, &Value)>,
    ) -> Result<Cursor, EngineError>;
}

/// An open, versioned store.
pub trait StoreHandle: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Version the store was opened at.
    fn version(&self) -> u32;

    /// Tables in the store, sorted.
    fn table_names(&self) -> Result<Vec<String>, EngineError>;

    /// Layout of one table.
    fn layout(&self, table: &str) -> Result<Option<TableLayout>, EngineError>;

    /// Run `f` in a transaction scoped to `tables`.
    ///
    /// A read-write transaction commits when `f` returns `Ok` and rolls back
    /// otherwise.
    fn transaction<R, Er>(
        &self,
        tables: &[&str],
        mode: TxMode,
        f: impl FnOnce(&mut dyn Transaction) -> Result<R, Er>,
    ) -> Result<R, Er>
    where
        Er: From<EngineError>;

    /// Release the handle. Later transactions fail with
    /// [`EngineError::Closed`]; closing twice is a no-op.
    fn close(&self);
}

/// A transactional, versioned key-value engine holding named stores.
pub trait StorageEngine: Send + Sync + 'static {
    /// Handle type for an open store.
    type Handle: StoreHandle + 'static;

    /// Every existing store with its version.
    fn list_stores(&self) -> Result<Vec<StoreInfo>, EngineError>;

    /// Open `name`, creating it when absent.
    ///
    /// `version` defaults to the existing version (1 for a new store). A
    /// version below the existing one fails with
    /// [`EngineError::VersionConflict`]. A higher one runs `setup` once and
    /// records the new version atomically with its changes.
    fn open_store(
        &self,
        name: &str,
        version: Option<u32>,
        setup: &mut SetupFn<'_>,
    ) -> Result<Self::Handle, EngineError>;

    /// Delete a store. Absent stores are not an error.
    fn drop_store(&self, name: &str) -> Result<(), EngineError>;
}

/// Decide the version `open_store` should open at.
///
/// Returns `(target, needs_setup)`.
pub(crate) fn plan_open(existing: Option<u32>, requested: Option<u32>) -> Result<(u32, bool), EngineError> {
    let current = existing.unwrap_or(0);
    let target = requested.unwrap_or(current.max(1));
    if target == 0 {
        return Err(EngineError::InvalidVersion(0));
    }
    if target < current {
        return Err(EngineError::VersionConflict {
            requested: target,
            existing: current,
        });
    }
    Ok((target, target > current))
}

/// Scope and mode checks shared by engine transactions.
#[derive(Debug, Clone)]
pub(crate) struct TxScope {
    tables: Vec<String>,
    mode: TxMode,
}

impl TxScope {
    pub(crate) fn new(tables: &[&str], mode: TxMode) -> Self {
        Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            mode,
        }
    }

    pub(crate) fn mode(&self) -> TxMode {
        self.mode
    }

    pub(crate) fn tables(&self) -> &[String] {
        &self.tables
    }

    pub(crate) fn read(&self, table: &str) -> Result<(), EngineError> {
        if self.tables.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(EngineError::OutOfScope {
                table: table.to_string(),
            })
        }
    }

    pub(crate) fn write(&self, table: &str) -> Result<(), EngineError> {
        self.read(table)?;
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(EngineError::ReadOnly {
                table: table.to_string(),
            }),
        }
    }
}
