use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tablekit_migrate::{Key, Record};

use crate::error::EngineError;
use crate::traits::{
    index_value, plan_open, Cursor, IndexSpec, KeyPolicy, SchemaEditor, SetupFn, StorageEngine,
    StoreHandle, StoreInfo, TableLayout, Transaction, TxMode, TxScope,
};

/// In-memory storage engine.
///
/// All stores live in `BTreeMap`s and nothing touches disk. Clones share the
/// same stores, so a store written through one clone is visible through
/// every other. Ideal for testing and prototyping.
///
/// # Example
///
/// ```
/// use tablekit_store::{KeyPolicy, MemoryEngine, StorageEngine, StoreHandle, TxMode};
/// use serde_json::json;
///
/// let engine = MemoryEngine::new();
/// let store = engine
///     .open_store("app", Some(1), &mut |editor, _old| {
///         editor.create_table("notes", KeyPolicy::AutoIncrement)
///     })
///     .unwrap();
///
/// let key = store
///     .transaction(&["notes"], TxMode::ReadWrite, |tx| {
///         tx.add("notes", None, json!("hello"))
///     })
///     .unwrap();
/// assert_eq!(key, 1u64.into());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    stores: Arc<Mutex<BTreeMap<String, Arc<Mutex<MemStore>>>>>,
}

#[derive(Debug, Default)]
struct MemStore {
    /// 0 until the first successful setup.
    version: u32,
    tables: BTreeMap<String, MemTable>,
    dropped: bool,
}

#[derive(Debug, Clone)]
struct MemTable {
    layout: TableLayout,
    rows: BTreeMap<Key, Value>,
    /// Highest numeric key ever written.
    seq: u64,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    m.lock().map_err(|_| EngineError::LockPoisoned)
}

impl MemoryEngine {
    /// Create an engine with no stores.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    type Handle = MemoryHandle;

    fn list_stores(&self) -> Result<Vec<StoreInfo>, EngineError> {
        let stores = lock(&self.stores)?;
        let mut out = Vec::with_capacity(stores.len());
        for (name, store) in stores.iter() {
            let version = lock(store)?.version;
            if version > 0 {
                out.push(StoreInfo {
                    name: name.clone(),
                    version,
                });
            }
        }
        Ok(out)
    }

    fn open_store(
        &self,
        name: &str,
        version: Option<u32>,
        setup: &mut SetupFn<'_>,
    ) -> Result<MemoryHandle, EngineError> {
        let store = Arc::clone(lock(&self.stores)?.entry(name.to_string()).or_default());
        let target = {
            let mut guard = lock(&store)?;
            let existing = (guard.version > 0).then_some(guard.version);
            let (target, needs_setup) = plan_open(existing, version)?;
            if needs_setup {
                let mut tables = guard.tables.clone();
                setup(&mut MemEditor { tables: &mut tables }, guard.version)?;
                guard.tables = tables;
                guard.version = target;
            }
            target
        };
        Ok(MemoryHandle {
            name: name.to_string(),
            store,
            version: target,
            closed: AtomicBool::new(false),
        })
    }

    fn drop_store(&self, name: &str) -> Result<(), EngineError> {
        if let Some(store) = lock(&self.stores)?.remove(name) {
            lock(&store)?.dropped = true;
        }
        Ok(())
    }
}

// ── Schema editing ──────────────────────────────────────────────────

struct MemEditor<'a> {
    tables: &'a mut BTreeMap<String, MemTable>,
}

impl SchemaEditor for MemEditor<'_> {
    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn create_table(&mut self, name: &str, key_policy: KeyPolicy) -> Result<(), EngineError> {
        if self.tables.contains_key(name) {
            return Err(EngineError::TableExists(name.to_string()));
        }
        self.tables.insert(
            name.to_string(),
            MemTable {
                layout: TableLayout::new(key_policy),
                rows: BTreeMap::new(),
                seq: 0,
            },
        );
        Ok(())
    }

    fn create_index(&mut self, table: &str, column: &str, unique: bool) -> Result<(), EngineError> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        if t.layout.index(column).is_some() {
            return Err(EngineError::IndexExists {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        if unique {
            let mut seen = Vec::new();
            for v in t.rows.values().filter_map(|v| index_value(v, column)) {
                if seen.contains(&v) {
                    return Err(unique_violation(table, column, v));
                }
                seen.push(v);
            }
        }
        t.layout.indexes.push(IndexSpec {
            column: column.to_string(),
            unique,
        });
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> Result<(), EngineError> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }
}

fn unique_violation(table: &str, column: &str, value: &Value) -> EngineError {
    EngineError::ConstraintViolation {
        table: table.to_string(),
        detail: format!("unique index `{column}` already holds {value}"),
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// An open in-memory store.
#[derive(Debug)]
pub struct MemoryHandle {
    name: String,
    store: Arc<Mutex<MemStore>>,
    version: u32,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn guard(&self) -> Result<MutexGuard<'_, MemStore>, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        let guard = lock(&self.store)?;
        if guard.dropped {
            return Err(EngineError::Closed);
        }
        Ok(guard)
    }
}

impl StoreHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.guard()?.tables.keys().cloned().collect())
    }

    fn layout(&self, table: &str) -> Result<Option<TableLayout>, EngineError> {
        Ok(self.guard()?.tables.get(table).map(|t| t.layout.clone()))
    }

    fn transaction<R, Er>(
        &self,
        tables: &[&str],
        mode: TxMode,
        f: impl FnOnce(&mut dyn Transaction) -> Result<R, Er>,
    ) -> Result<R, Er>
    where
        Er: From<EngineError>,
    {
        let mut guard = self.guard()?;
        if let Some(missing) = tables.iter().find(|t| !guard.tables.contains_key(**t)) {
            return Err(EngineError::TableNotFound(missing.to_string()).into());
        }

        let mut tx = MemTx {
            scope: TxScope::new(tables, mode),
            base: &guard.tables,
            written: BTreeMap::new(),
        };
        let out = f(&mut tx)?;
        let MemTx { written, .. } = tx;
        if mode == TxMode::ReadWrite {
            guard.tables.extend(written);
        }
        Ok(out)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ── Transactions ────────────────────────────────────────────────────

/// Copy-on-write view over the scoped tables. Written tables replace the
/// originals on commit.
struct MemTx<'a> {
    scope: TxScope,
    base: &'a BTreeMap<String, MemTable>,
    written: BTreeMap<String, MemTable>,
}

impl MemTx<'_> {
    fn table(&self, name: &str) -> Result<&MemTable, EngineError> {
        self.scope.read(name)?;
        self.written
            .get(name)
            .or_else(|| self.base.get(name))
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, EngineError> {
        self.scope.write(name)?;
        if !self.written.contains_key(name) {
            let original = self
                .base
                .get(name)
                .ok_or_else(|| EngineError::TableNotFound(name.to_string()))?;
            self.written.insert(name.to_string(), original.clone());
        }
        self.written
            .get_mut(name)
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    fn write(
        &mut self,
        table: &str,
        key: Option<&Key>,
        value: Value,
        overwrite: bool,
    ) -> Result<Key, EngineError> {
        let t = self.table_mut(table)?;
        let key = t.layout.resolve_key(table, key, t.seq)?;
        if !overwrite && t.rows.contains_key(&key) {
            return Err(EngineError::ConstraintViolation {
                table: table.to_string(),
                detail: format!("key {key} already exists"),
            });
        }
        for index in t.layout.indexes.iter().filter(|i| i.unique) {
            let Some(v) = index_value(&value, &index.column) else {
                continue;
            };
            let taken = t
                .rows
                .iter()
                .any(|(k, other)| *k != key && index_value(other, &index.column) == Some(v));
            if taken {
                return Err(unique_violation(table, &index.column, v));
            }
        }
        if let Key::Number(n) = key {
            t.seq = t.seq.max(n);
        }
        t.rows.insert(key.clone(), value);
        Ok(key)
    }
}

impl Transaction for MemTx<'_> {
    fn mode(&self) -> TxMode {
        self.scope.mode()
    }

    fn get(&mut self, table: &str, key: &Key) -> Result<Option<Value>, EngineError> {
        Ok(self.table(table)?.rows.get(key).cloned())
    }

    fn get_all(&mut self, table: &str) -> Result<Vec<Record>, EngineError> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect())
    }

    fn put(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, true)
    }

    fn add(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, false)
    }

    fn delete(&mut self, table: &str, key: &Key) -> Result<(), EngineError> {
        self.table_mut(table)?.rows.remove(key);
        Ok(())
    }

    fn clear(&mut self, table: &str) -> Result<(), EngineError> {
        self.table_mut(table)?.rows.clear();
        Ok(())
    }

    fn count(&mut self, table: &str) -> Result<u64, EngineError> {
        Ok(self.table(table)?.rows.len() as u64)
    }

    fn open_cursor(
        &mut self,
        table: &str,
        query: Option<(&str, &Value)>,
    ) -> Result<Cursor, EngineError> {
        let t = self.table(table)?;
        let records = match query {
            None => t
                .rows
                .iter()
                .map(|(k, v)| Record::new(k.clone(), v.clone()))
                .collect(),
            Some((column, wanted)) => {
                if t.layout.index(column).is_none() {
                    return Err(EngineError::IndexNotFound {
                        table: table.to_string(),
                        column: column.to_string(),
                    });
                }
                t.rows
                    .iter()
                    .filter(|(_, v)| index_value(v, column) == Some(wanted))
                    .map(|(k, v)| Record::new(k.clone(), v.clone()))
                    .collect()
            }
        };
        Ok(Cursor::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_notes(engine: &MemoryEngine) -> MemoryHandle {
        engine
            .open_store("app", Some(1), &mut |editor, _| {
                editor.create_table("notes", KeyPolicy::AutoIncrement)?;
                editor.create_index("notes", "title", true)
            })
            .unwrap()
    }

    #[test]
    fn clones_share_stores() {
        let engine = MemoryEngine::new();
        let handle = open_notes(&engine);
        handle
            .transaction(&["notes"], TxMode::ReadWrite, |tx| tx.add("notes", None, json!({"title": "a"})))
            .unwrap();

        let other = engine.clone();
        let infos = other.list_stores().unwrap();
        assert_eq!(infos, vec![StoreInfo { name: "app".into(), version: 1 }]);
        let again = other.open_store("app", None, &mut |_, _| Ok(())).unwrap();
        let n = again
            .transaction(&["notes"], TxMode::ReadOnly, |tx| tx.count("notes"))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let engine = MemoryEngine::new();
        let handle = open_notes(&engine);
        let result: Result<(), EngineError> = handle.transaction(&["notes"], TxMode::ReadWrite, |tx| {
            tx.add("notes", None, json!({"title": "a"}))?;
            // duplicate title
            tx.add("notes", None, json!({"title": "a"}))?;
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::ConstraintViolation { .. })));
        let n = handle
            .transaction(&["notes"], TxMode::ReadOnly, |tx| tx.count("notes"))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn failed_setup_does_not_create_store() {
        let engine = MemoryEngine::new();
        let result = engine.open_store("app", Some(1), &mut |editor, _| {
            editor.create_index("missing", "col", false)
        });
        assert!(matches!(result, Err(EngineError::TableNotFound(_))));
        assert!(engine.list_stores().unwrap().is_empty());
    }

    #[test]
    fn exhausted_key_sequence_is_an_error() {
        let engine = MemoryEngine::new();
        let handle = open_notes(&engine);
        handle
            .transaction(&["notes"], TxMode::ReadWrite, |tx| {
                tx.put("notes", Some(&Key::Number(u64::MAX)), json!({"title": "last"}))
            })
            .unwrap();

        let result = handle.transaction(&["notes"], TxMode::ReadWrite, |tx| {
            tx.add("notes", None, json!({"title": "one more"}))
        });
        assert!(matches!(result, Err(EngineError::ConstraintViolation { .. })));

        // the store is still usable
        let n = handle
            .transaction(&["notes"], TxMode::ReadOnly, |tx| tx.count("notes"))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn dropped_store_closes_handles() {
        let engine = MemoryEngine::new();
        let handle = open_notes(&engine);
        engine.drop_store("app").unwrap();
        assert!(matches!(handle.table_names(), Err(EngineError::Closed)));
        assert!(engine.list_stores().unwrap().is_empty());
    }
}
