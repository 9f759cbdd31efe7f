//! Typed table access over an open store.
//!
//! [`Database`] opens a store at a [`SchemaModel`]'s version (upgrading it
//! when older), then exposes typed CRUD and index lookups for the model's
//! tables. Values are stored as JSON documents; any `Serialize` type can be
//! written and any `DeserializeOwned` type read back.
//!
//! Every successful mutation calls the registered mutation listeners with the
//! table name, synchronously, after the transaction has committed.
//!
//! # Example
//!
//! ```
//! use tablekit_migrate::{Column, SchemaModel, TableDefinition};
//! use tablekit_store::{Database, MemoryEngine};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Item { name: String }
//!
//! let model = SchemaModel::create([
//!     ("items", TableDefinition::keyed([("name", Column::unique())])),
//! ]);
//! let db = Database::open(&MemoryEngine::new(), "shop", model).unwrap();
//!
//! let key = db.add("items", &Item { name: "Ramen".into() }).unwrap();
//! let item: Option<Item> = db.get("items", key).unwrap();
//! assert_eq!(item.unwrap().name, "Ramen");
//!
//! let by_name: Option<Item> = db.get_by("items", "name", &"Ramen").unwrap();
//! assert!(by_name.is_some());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tablekit_migrate::{Key, Record, SchemaModel, TableDefinition, TabularState};
use tracing::debug;

use crate::error::{DbError, EngineError};
use crate::listeners::{Registry, Subscription};
use crate::traits::{StorageEngine, StoreHandle, Transaction, TxMode};
use crate::upgrade::{self, MigrationFailurePolicy, OpenOutcome};

/// Callback receiving the name of a mutated table.
pub(crate) type MutationListener = dyn Fn(&str) + Send + Sync;

/// Configuration for [`Database`].
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// What to do when the upgrade migration fails.
    pub on_migration_failure: MigrationFailurePolicy,
}

/// Builder for opening a [`Database`] with custom configuration.
pub struct DatabaseBuilder<'a, E: StorageEngine> {
    engine: &'a E,
    name: String,
    model: SchemaModel,
    config: DatabaseConfig,
}

impl<'a, E: StorageEngine> DatabaseBuilder<'a, E> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the migration failure policy.
    pub fn on_migration_failure(mut self, policy: MigrationFailurePolicy) -> Self {
        self.config.on_migration_failure = policy;
        self
    }

    /// Open the store, running the upgrade protocol to completion.
    pub fn open(self) -> Result<Database<E>, DbError> {
        let (handle, outcome) = upgrade::open_with_model(
            self.engine,
            &self.name,
            &self.model,
            self.config.on_migration_failure,
        )?;
        Ok(Database {
            inner: Arc::new(Inner {
                name: self.name,
                model: self.model,
                handle,
                listeners: Registry::new(),
                outcome,
                config: self.config,
            }),
        })
    }
}

struct Inner<E: StorageEngine> {
    name: String,
    model: SchemaModel,
    handle: E::Handle,
    listeners: Arc<Registry<MutationListener>>,
    outcome: OpenOutcome,
    config: DatabaseConfig,
}

impl<E: StorageEngine> Drop for Inner<E> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// A store opened at a schema model's version.
///
/// Cheap to clone; clones share the connection and the listener registry.
/// The store is closed when the last clone is dropped.
pub struct Database<E: StorageEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: StorageEngine> Clone for Database<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: StorageEngine> fmt::Debug for Database<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.model.version())
            .field("outcome", &self.inner.outcome)
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl<E: StorageEngine> Database<E> {
    /// Open `name` at `model.version()` with the default configuration.
    pub fn open(engine: &E, name: &str, model: SchemaModel) -> Result<Self, DbError> {
        Self::builder(engine, name, model).open()
    }

    /// Create a builder for advanced configuration.
    pub fn builder<'a>(engine: &'a E, name: &str, model: SchemaModel) -> DatabaseBuilder<'a, E> {
        DatabaseBuilder {
            engine,
            name: name.to_string(),
            model,
            config: DatabaseConfig::default(),
        }
    }

    /// Delete a store and everything in it.
    pub fn drop_store(engine: &E, name: &str) -> Result<(), DbError> {
        engine.drop_store(name).map_err(DbError::Structural)
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schema version, equal to the model version.
    pub fn version(&self) -> u32 {
        self.inner.handle.version()
    }

    /// The schema model the store was opened with.
    pub fn model(&self) -> &SchemaModel {
        &self.inner.model
    }

    /// How the store was found on open.
    pub fn outcome(&self) -> &OpenOutcome {
        &self.inner.outcome
    }

    /// The configuration used on open.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// The underlying engine handle.
    pub fn handle(&self) -> &E::Handle {
        &self.inner.handle
    }

    /// Close the store for every clone. Later calls fail with
    /// [`EngineError::Closed`].
    pub fn close(&self) {
        self.inner.handle.close();
    }

    // ── Mutation notifications ──────────────────────────────────────

    /// Register a listener called with the table name after every
    /// successful mutation.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.listeners.register(Arc::new(listener))
    }

    fn notify(&self, table: &str) {
        let listeners = self.inner.listeners.snapshot();
        debug!(store = %self.inner.name, table, listeners = listeners.len(), "table mutated");
        for listener in listeners {
            listener(table);
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert or replace a record. `key` may be omitted for auto-increment
    /// tables. Returns the key used.
    pub fn put<T: Serialize>(&self, table: &str, key: Option<Key>, value: &T) -> Result<Key, DbError> {
        if let Some(key) = &key {
            self.check_key(table, key)?;
        } else {
            self.definition(table)?;
        }
        let value = encode(value)?;
        self.write(table, |tx| Ok(tx.put(table, key.as_ref(), value)?))
    }

    /// Insert a record with an auto-increment key.
    pub fn add<T: Serialize>(&self, table: &str, value: &T) -> Result<Key, DbError> {
        self.definition(table)?;
        let value = encode(value)?;
        self.write(table, |tx| Ok(tx.add(table, None, value)?))
    }

    /// Insert a record under `key`; fails if the key is taken.
    pub fn add_keyed<T: Serialize>(&self, table: &str, key: impl Into<Key>, value: &T) -> Result<Key, DbError> {
        let key = key.into();
        self.check_key(table, &key)?;
        let value = encode(value)?;
        self.write(table, |tx| Ok(tx.add(table, Some(&key), value)?))
    }

    /// Replace an existing record.
    ///
    /// Fails with [`DbError::UpdateConflict`] when `key` is absent; nothing
    /// is written and no listener is called.
    pub fn update<T: Serialize>(&self, table: &str, key: impl Into<Key>, value: &T) -> Result<(), DbError> {
        let key = key.into();
        self.check_key(table, &key)?;
        let value = encode(value)?;
        self.write(table, |tx| {
            if tx.get(table, &key)?.is_none() {
                return Err(DbError::UpdateConflict {
                    table: table.to_string(),
                    key: key.clone(),
                });
            }
            tx.put(table, Some(&key), value)?;
            Ok(())
        })
    }

    /// Remove a record. Absent keys are not an error.
    pub fn delete(&self, table: &str, key: impl Into<Key>) -> Result<(), DbError> {
        let key = key.into();
        self.check_key(table, &key)?;
        self.write(table, |tx| Ok(tx.delete(table, &key)?))
    }

    /// Remove every record of a table.
    pub fn clear(&self, table: &str) -> Result<(), DbError> {
        self.definition(table)?;
        self.write(table, |tx| Ok(tx.clear(table)?))
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// The value under `key`, if any.
    pub fn get<T: DeserializeOwned>(&self, table: &str, key: impl Into<Key>) -> Result<Option<T>, DbError> {
        let key = key.into();
        self.check_key(table, &key)?;
        self.read(table, |tx| Ok(tx.get(table, &key)?))?
            .map(decode::<T>)
            .transpose()
    }

    /// Every value, in key order.
    pub fn get_all<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, DbError> {
        Ok(self
            .get_all_with_keys(table)?
            .into_iter()
            .map(|r| r.value)
            .collect())
    }

    /// Every record with its key, in key order.
    pub fn get_all_with_keys<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<Record<T>>, DbError> {
        self.definition(table)?;
        let records = self.read(table, |tx| Ok(tx.get_all(table)?))?;
        records.into_iter().map(decode_record).collect()
    }

    /// The first value (in key order) whose indexed `index` field equals `value`.
    pub fn get_by<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        table: &str,
        index: &str,
        value: &Q,
    ) -> Result<Option<T>, DbError> {
        let wanted = self.index_query(table, index, value)?;
        let first = self.read(table, |tx| Ok(tx.open_cursor(table, Some((index, &wanted)))?.next()))?;
        first.map(|r| decode(r.value)).transpose()
    }

    /// Every value whose indexed `index` field equals `value`, in key order.
    pub fn get_all_by<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        table: &str,
        index: &str,
        value: &Q,
    ) -> Result<Vec<T>, DbError> {
        let wanted = self.index_query(table, index, value)?;
        let cursor = self.read(table, |tx| Ok(tx.open_cursor(table, Some((index, &wanted)))?))?;
        cursor.map(|r| decode(r.value)).collect()
    }

    /// Whether a record exists under `key`.
    pub fn has(&self, table: &str, key: impl Into<Key>) -> Result<bool, DbError> {
        let key = key.into();
        self.check_key(table, &key)?;
        self.read(table, |tx| Ok(tx.get(table, &key)?.is_some()))
    }

    /// Number of records.
    pub fn count(&self, table: &str) -> Result<u64, DbError> {
        self.definition(table)?;
        self.read(table, |tx| Ok(tx.count(table)?))
    }

    /// Every record of every table.
    pub fn snapshot(&self) -> Result<TabularState, DbError> {
        Ok(upgrade::read_all(&self.inner.handle)?)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn definition(&self, table: &str) -> Result<&TableDefinition, DbError> {
        self.inner
            .model
            .table(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))
    }

    fn check_key(&self, table: &str, key: &Key) -> Result<(), DbError> {
        let expected = self.definition(table)?.key_kind();
        if key.kind() != expected {
            return Err(DbError::KeyKindMismatch {
                table: table.to_string(),
                expected,
                found: key.kind(),
            });
        }
        Ok(())
    }

    fn index_query<Q: Serialize + ?Sized>(&self, table: &str, index: &str, value: &Q) -> Result<Value, DbError> {
        if !self.definition(table)?.has_index(index) {
            return Err(DbError::UnknownIndex {
                table: table.to_string(),
                index: index.to_string(),
            });
        }
        encode(value)
    }

    fn read<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut dyn Transaction) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        self.inner.handle.transaction(&[table], TxMode::ReadOnly, f)
    }

    fn write<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut dyn Transaction) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        let result = self.inner.handle.transaction(&[table], TxMode::ReadWrite, f)?;
        self.notify(table);
        Ok(result)
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value, DbError> {
    serde_json::to_value(value).map_err(DbError::Encode)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, DbError> {
    serde_json::from_value(value).map_err(DbError::Decode)
}

fn decode_record<T: DeserializeOwned>(record: Record) -> Result<Record<T>, DbError> {
    Ok(Record {
        key: record.key,
        value: decode(record.value)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use serde::Deserialize;
    use std::sync::Mutex;
    use tablekit_migrate::{Column, KeyKind};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        category: String,
    }

    fn item(name: &str, category: &str) -> Item {
        Item {
            name: name.into(),
            category: category.into(),
        }
    }

    fn model() -> SchemaModel {
        SchemaModel::create([
            (
                "items",
                TableDefinition::keyed([("name", Column::unique()), ("category", Column::indexed())]),
            ),
            ("settings", TableDefinition::caller_keyed()),
        ])
    }

    fn open() -> Database<MemoryEngine> {
        Database::open(&MemoryEngine::new(), "shop", model()).unwrap()
    }

    fn record_events(db: &Database<MemoryEngine>) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = db.subscribe(move |table| sink.lock().unwrap().push(table.to_string()));
        (events, sub)
    }

    #[test]
    fn add_assigns_increasing_keys() {
        let db = open();
        assert_eq!(db.add("items", &item("Ramen", "cooking")).unwrap(), Key::Number(1));
        assert_eq!(db.add("items", &item("Udon", "cooking")).unwrap(), Key::Number(2));
        assert_eq!(db.count("items").unwrap(), 2);
        assert_eq!(db.outcome(), &OpenOutcome::Created);
    }

    #[test]
    fn put_upserts() {
        let db = open();
        let key = db.put("items", None, &item("Ramen", "cooking")).unwrap();
        db.put("items", Some(key.clone()), &item("Ramen", "noodles")).unwrap();
        let got: Item = db.get("items", key).unwrap().unwrap();
        assert_eq!(got.category, "noodles");
        assert_eq!(db.count("items").unwrap(), 1);
    }

    #[test]
    fn caller_keyed_tables() {
        let db = open();
        db.add_keyed("settings", "theme", &"dark").unwrap();
        assert!(db.has("settings", "theme").unwrap());
        assert!(!db.has("settings", "font").unwrap());

        let err = db.add_keyed("settings", "theme", &"light").unwrap_err();
        assert!(matches!(err, DbError::Transport(EngineError::ConstraintViolation { .. })));

        let err = db.add("settings", &"light").unwrap_err();
        assert!(matches!(err, DbError::Transport(EngineError::MissingKey { .. })));
    }

    #[test]
    fn update_conflict_leaves_table_unchanged() {
        let db = open();
        db.add("items", &item("Ramen", "cooking")).unwrap();
        let (events, _sub) = record_events(&db);

        let err = db.update("items", 99u64, &item("Soba", "cooking")).unwrap_err();
        assert!(matches!(err, DbError::UpdateConflict { ref key, .. } if *key == Key::Number(99)));
        assert_eq!(db.get_all::<Item>("items").unwrap(), vec![item("Ramen", "cooking")]);
        assert!(events.lock().unwrap().is_empty());

        db.update("items", 1u64, &item("Ramen", "noodles")).unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["items"]);
    }

    #[test]
    fn index_lookups() {
        let db = open();
        db.add("items", &item("Ramen", "cooking")).unwrap();
        db.add("items", &item("Soap", "cleaning")).unwrap();
        db.add("items", &item("Udon", "cooking")).unwrap();

        let soap: Option<Item> = db.get_by("items", "name", "Soap").unwrap();
        assert_eq!(soap, Some(item("Soap", "cleaning")));
        let none: Option<Item> = db.get_by("items", "name", "Tofu").unwrap();
        assert!(none.is_none());

        let cooking: Vec<Item> = db.get_all_by("items", "category", "cooking").unwrap();
        let names: Vec<&str> = cooking.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Ramen", "Udon"]);

        let err = db.get_by::<Item, _>("items", "price", &3).unwrap_err();
        assert!(matches!(err, DbError::UnknownIndex { .. }));
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let db = open();
        db.add("items", &item("Ramen", "cooking")).unwrap();
        let err = db.add("items", &item("Ramen", "other")).unwrap_err();
        assert!(matches!(err, DbError::Transport(EngineError::ConstraintViolation { .. })));
        assert_eq!(db.count("items").unwrap(), 1);
    }

    #[test]
    fn validation_errors() {
        let db = open();
        assert!(matches!(db.count("missing"), Err(DbError::UnknownTable(_))));
        let err = db.get::<Item>("items", "one").unwrap_err();
        assert!(matches!(
            err,
            DbError::KeyKindMismatch {
                expected: KeyKind::Number,
                found: KeyKind::Text,
                ..
            }
        ));
        db.add_keyed("settings", "n", &42).unwrap();
        assert!(matches!(db.get::<String>("settings", "n"), Err(DbError::Decode(_))));
    }

    #[test]
    fn every_mutation_notifies() {
        let db = open();
        let (events, sub) = record_events(&db);

        let key = db.add("items", &item("Ramen", "cooking")).unwrap();
        db.put("settings", Some("theme".into()), &"dark").unwrap();
        db.delete("items", key).unwrap();
        db.clear("settings").unwrap();
        let _ = db.get_all::<Item>("items").unwrap();

        assert_eq!(*events.lock().unwrap(), vec!["items", "settings", "items", "settings"]);

        sub.unsubscribe();
        db.add("items", &item("Udon", "cooking")).unwrap();
        assert_eq!(events.lock().unwrap().len(), 4);
    }

    #[test]
    fn records_keep_their_keys() {
        let db = open();
        db.add("items", &item("Ramen", "cooking")).unwrap();
        db.add("items", &item("Udon", "cooking")).unwrap();
        db.delete("items", 1u64).unwrap();

        let records: Vec<Record<Item>> = db.get_all_with_keys("items").unwrap();
        assert_eq!(records, vec![Record::new(2u64, item("Udon", "cooking"))]);

        let snapshot = db.snapshot().unwrap();
        assert_eq!(snapshot.record_count(), 1);
        assert!(snapshot.contains("settings"));
    }

    #[test]
    fn closed_database_reports_transport_errors() {
        let db = open();
        let clone = db.clone();
        db.close();
        assert!(matches!(clone.count("items"), Err(DbError::Transport(EngineError::Closed))));
    }
}
