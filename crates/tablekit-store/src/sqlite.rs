//! SQLite storage engine using rusqlite.
//!
//! Each store is one `<name>.sqlite3` file inside the engine's directory.
//! Uses WAL mode by default for concurrent read/write performance. Store
//! tables are real SQL tables and secondary indexes are expression indexes
//! over the JSON value column.
//!
//! # Example
//!
//! ```no_run
//! use tablekit_store::{KeyPolicy, SqliteEngine, StorageEngine};
//!
//! let engine = SqliteEngine::open("./data").unwrap();
//! let store = engine
//!     .open_store("app", Some(1), &mut |editor, _old| {
//!         editor.create_table("notes", KeyPolicy::AutoIncrement)
//!     })
//!     .unwrap();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tablekit_migrate::{Key, Record};
use tracing::debug;

use crate::error::EngineError;
use crate::traits::{
    plan_open, Cursor, IndexSpec, KeyPolicy, SchemaEditor, SetupFn, StorageEngine, StoreHandle,
    StoreInfo, TableLayout, Transaction, TxMode, TxScope,
};

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
    /// SQLite page size. Defaults to 4096.
    pub page_size: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            page_size: 4096,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-Ahead Logging; readers do not block the writer.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

const LAYOUT_TABLE: &str = "__tablekit_tables";

fn err(e: rusqlite::Error) -> EngineError {
    EngineError::Backend(e.to_string())
}

/// Map constraint failures to [`EngineError::ConstraintViolation`].
fn write_err(table: &str) -> impl Fn(rusqlite::Error) -> EngineError + '_ {
    move |e| match e {
        rusqlite::Error::SqliteFailure(inner, msg)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            EngineError::ConstraintViolation {
                table: table.to_string(),
                detail: msg.unwrap_or_else(|| inner.to_string()),
            }
        }
        other => err(other),
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn data_table(table: &str) -> String {
    quote(&format!("t_{table}"))
}

fn index_ident(table: &str, column: &str) -> String {
    quote(&format!("i_{table}_{column}"))
}

/// The indexed expression: the field's minified JSON text, so `true`, `1`
/// and `1.0` stay distinct. JSON `null` indexes as SQL `NULL`.
fn index_expr(column: &str) -> String {
    let path = format!("$.\"{column}\"");
    format!("nullif(value -> '{}', 'null')", path.replace('\'', "''"))
}

/// The lookup side of [`index_expr`], applied to a bound JSON parameter.
const INDEX_PARAM: &str = "nullif(?1 -> '$', 'null')";

fn key_param(key: &Key) -> Result<SqlValue, EngineError> {
    match key {
        Key::Number(n) => i64::try_from(*n)
            .map(SqlValue::Integer)
            .map_err(|_| EngineError::Codec(format!("key {n} exceeds the SQLite integer range"))),
        Key::Text(s) => Ok(SqlValue::Text(s.clone())),
    }
}

fn read_key(row: &Row<'_>, policy: KeyPolicy) -> rusqlite::Result<Key> {
    match policy {
        KeyPolicy::AutoIncrement => Ok(Key::Number(row.get::<_, i64>(0)? as u64)),
        KeyPolicy::CallerKey => Ok(Key::Text(row.get(0)?)),
    }
}

fn decode_value(text: &str) -> Result<Value, EngineError> {
    serde_json::from_str(text).map_err(EngineError::codec)
}

fn encode_value(value: &Value) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(EngineError::codec)
}

// ── Layout metadata ─────────────────────────────────────────────────

fn load_layouts(conn: &Connection) -> Result<BTreeMap<String, TableLayout>, EngineError> {
    let mut stmt = conn
        .prepare_cached(&format!("SELECT name, layout FROM {LAYOUT_TABLE} ORDER BY name"))
        .map_err(err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
        .map_err(err)?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (name, bytes) = row.map_err(err)?;
        out.insert(name, TableLayout::from_bytes(&bytes)?);
    }
    Ok(out)
}

fn load_layout(conn: &Connection, table: &str) -> Result<Option<TableLayout>, EngineError> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT layout FROM {LAYOUT_TABLE} WHERE name = ?1"),
            params![table],
            |row| row.get(0),
        )
        .optional()
        .map_err(err)?;
    bytes.map(|b| TableLayout::from_bytes(&b)).transpose()
}

fn save_layout(conn: &Connection, table: &str, layout: &TableLayout) -> Result<(), EngineError> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {LAYOUT_TABLE} (name, layout) VALUES (?1, ?2)"),
        params![table, layout.to_bytes()?],
    )
    .map_err(err)?;
    Ok(())
}

// ── Engine ──────────────────────────────────────────────────────────

/// SQLite storage engine.
///
/// Every handle owns its own `rusqlite::Connection` behind a `Mutex`.
/// Handles of one store share a dropped flag, set by
/// [`StorageEngine::drop_store`].
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    dir: PathBuf,
    config: SqliteConfig,
    live: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl SqliteEngine {
    /// Open (or create) an engine rooted at `dir` with default config.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, EngineError> {
        Self::open_with_config(dir, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        dir: P,
        config: SqliteConfig,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            config,
            live: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.sqlite3"))
    }

    fn live(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<AtomicBool>>>, EngineError> {
        self.live.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn connect(&self, path: &Path) -> Result<Connection, EngineError> {
        let conn = Connection::open(path).map_err(err)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA page_size = {};
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS {LAYOUT_TABLE} (
                 name    TEXT PRIMARY KEY NOT NULL,
                 layout  BLOB NOT NULL
             );",
            self.config.journal_mode.as_str(),
            self.config.busy_timeout_ms,
            self.config.page_size,
        ))
        .map_err(err)?;
        Ok(conn)
    }
}

fn user_version(conn: &Connection) -> Result<u32, EngineError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(err)
}

impl StorageEngine for SqliteEngine {
    type Handle = SqliteHandle;

    fn list_stores(&self) -> Result<Vec<StoreInfo>, EngineError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sqlite3") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let version = user_version(&self.connect(&path)?)?;
            if version > 0 {
                out.push(StoreInfo {
                    name: name.to_string(),
                    version,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open_store(
        &self,
        name: &str,
        version: Option<u32>,
        setup: &mut SetupFn<'_>,
    ) -> Result<SqliteHandle, EngineError> {
        let mut conn = self.connect(&self.path(name))?;
        let current = user_version(&conn)?;
        let (target, needs_setup) = plan_open((current > 0).then_some(current), version)?;
        if needs_setup {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(err)?;
            setup(&mut SqliteEditor { conn: &tx }, current)?;
            tx.execute_batch(&format!("PRAGMA user_version = {target}"))
                .map_err(err)?;
            tx.commit().map_err(err)?;
        }
        debug!(store = name, version = target, "sqlite store open");
        let dropped = Arc::clone(self.live()?.entry(name.to_string()).or_default());
        Ok(SqliteHandle {
            name: name.to_string(),
            conn: Mutex::new(Some(conn)),
            version: target,
            dropped,
        })
    }

    fn drop_store(&self, name: &str) -> Result<(), EngineError> {
        if let Some(dropped) = self.live()?.remove(name) {
            dropped.store(true, Ordering::Release);
        }
        let path = self.path(name);
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ── Schema editing ──────────────────────────────────────────────────

struct SqliteEditor<'a> {
    conn: &'a Connection,
}

impl SchemaEditor for SqliteEditor<'_> {
    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(load_layouts(self.conn)?.into_keys().collect())
    }

    fn create_table(&mut self, name: &str, key_policy: KeyPolicy) -> Result<(), EngineError> {
        if load_layout(self.conn, name)?.is_some() {
            return Err(EngineError::TableExists(name.to_string()));
        }
        let key_column = match key_policy {
            KeyPolicy::AutoIncrement => "key INTEGER PRIMARY KEY AUTOINCREMENT",
            KeyPolicy::CallerKey => "key TEXT PRIMARY KEY NOT NULL",
        };
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE {} ({key_column}, value TEXT NOT NULL);",
                data_table(name)
            ))
            .map_err(err)?;
        save_layout(self.conn, name, &TableLayout::new(key_policy))
    }

    fn create_index(&mut self, table: &str, column: &str, unique: bool) -> Result<(), EngineError> {
        let mut layout = load_layout(self.conn, table)?
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        if layout.index(column).is_some() {
            return Err(EngineError::IndexExists {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        if column.contains('"') {
            return Err(EngineError::Backend(format!(
                "column name {column:?} cannot be indexed"
            )));
        }
        self.conn
            .execute_batch(&format!(
                "CREATE {}INDEX {} ON {} ({});",
                if unique { "UNIQUE " } else { "" },
                index_ident(table, column),
                data_table(table),
                index_expr(column),
            ))
            .map_err(write_err(table))?;
        layout.indexes.push(IndexSpec {
            column: column.to_string(),
            unique,
        });
        save_layout(self.conn, table, &layout)
    }

    fn drop_table(&mut self, name: &str) -> Result<(), EngineError> {
        if load_layout(self.conn, name)?.is_none() {
            return Err(EngineError::TableNotFound(name.to_string()));
        }
        self.conn
            .execute_batch(&format!("DROP TABLE {};", data_table(name)))
            .map_err(err)?;
        self.conn
            .execute(
                &format!("DELETE FROM {LAYOUT_TABLE} WHERE name = ?1"),
                params![name],
            )
            .map_err(err)?;
        Ok(())
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// An open SQLite store.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex` for safe shared access.
/// Closing drops the connection, as does dropping the store.
pub struct SqliteHandle {
    name: String,
    conn: Mutex<Option<Connection>>,
    version: u32,
    dropped: Arc<AtomicBool>,
}

impl SqliteHandle {
    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, EngineError> {
        let mut guard = self.conn.lock().map_err(|_| EngineError::LockPoisoned)?;
        if self.dropped.load(Ordering::Acquire) {
            guard.take();
        }
        Ok(guard)
    }

    /// Get the current journal mode.
    pub fn journal_mode(&self) -> Result<String, EngineError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(EngineError::Closed)?;
        conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .map_err(err)
    }
}

impl StoreHandle for SqliteHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(EngineError::Closed)?;
        Ok(load_layouts(conn)?.into_keys().collect())
    }

    fn layout(&self, table: &str) -> Result<Option<TableLayout>, EngineError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(EngineError::Closed)?;
        load_layout(conn, table)
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
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(EngineError::Closed)?;

        let mut all = load_layouts(conn)?;
        let mut layouts = BTreeMap::new();
        for table in tables {
            let layout = all
                .remove(*table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            layouts.insert(table.to_string(), layout);
        }

        let behavior = match mode {
            TxMode::ReadOnly => TransactionBehavior::Deferred,
            TxMode::ReadWrite => TransactionBehavior::Immediate,
        };
        let tx = conn.transaction_with_behavior(behavior).map_err(err)?;
        let mut stx = SqliteTx {
            scope: TxScope::new(tables, mode),
            tx,
            layouts,
        };
        let out = f(&mut stx)?;
        if mode == TxMode::ReadWrite {
            stx.tx.commit().map_err(err)?;
        }
        Ok(out)
    }

    fn close(&self) {
        if let Ok(mut guard) = self.lock() {
            guard.take();
        }
    }
}

// ── Transactions ────────────────────────────────────────────────────

struct SqliteTx<'c> {
    scope: TxScope,
    tx: rusqlite::Transaction<'c>,
    layouts: BTreeMap<String, TableLayout>,
}

impl SqliteTx<'_> {
    fn layout(&self, table: &str) -> Result<&TableLayout, EngineError> {
        self.scope.read(table)?;
        self.layouts
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))
    }

    fn select(
        &self,
        table: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<Vec<Record>, EngineError> {
        let policy = self.layout(table)?.key_policy;
        let (sql, param) = match filter {
            None => (
                format!("SELECT key, value FROM {} ORDER BY key", data_table(table)),
                None,
            ),
            Some((column, wanted)) => (
                format!(
                    "SELECT key, value FROM {} WHERE {} = {} ORDER BY key",
                    data_table(table),
                    index_expr(column),
                    INDEX_PARAM,
                ),
                Some(encode_value(wanted)?),
            ),
        };
        let mut stmt = self.tx.prepare_cached(&sql).map_err(err)?;
        let map = |row: &Row<'_>| -> rusqlite::Result<(Key, String)> {
            Ok((read_key(row, policy)?, row.get(1)?))
        };
        let rows = match &param {
            None => stmt.query_map([], map),
            Some(p) => stmt.query_map(params![p], map),
        }
        .map_err(err)?;

        let mut out = Vec::new();
        for row in rows {
            let (key, text) = row.map_err(err)?;
            out.push(Record::new(key, decode_value(&text)?));
        }
        Ok(out)
    }

    fn write(
        &mut self,
        table: &str,
        key: Option<&Key>,
        value: Value,
        overwrite: bool,
    ) -> Result<Key, EngineError> {
        self.scope.write(table)?;
        let layout = self.layout(table)?;
        // validates the key kind; the auto key itself comes from SQLite
        layout.resolve_key(table, key, 0)?;
        let text = encode_value(&value)?;
        let t = data_table(table);

        match key {
            None => {
                self.tx
                    .prepare_cached(&format!("INSERT INTO {t} (value) VALUES (?1)"))
                    .and_then(|mut stmt| stmt.execute(params![text]))
                    .map_err(write_err(table))?;
                Ok(Key::Number(self.tx.last_insert_rowid() as u64))
            }
            Some(key) => {
                let sql = if overwrite {
                    format!(
                        "INSERT INTO {t} (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                    )
                } else {
                    format!("INSERT INTO {t} (key, value) VALUES (?1, ?2)")
                };
                let param = key_param(key)?;
                self.tx
                    .prepare_cached(&sql)
                    .and_then(|mut stmt| stmt.execute(params![param, text]))
                    .map_err(write_err(table))?;
                Ok(key.clone())
            }
        }
    }
}

impl Transaction for SqliteTx<'_> {
    fn mode(&self) -> TxMode {
        self.scope.mode()
    }

    fn get(&mut self, table: &str, key: &Key) -> Result<Option<Value>, EngineError> {
        self.layout(table)?;
        let text: Option<String> = self
            .tx
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", data_table(table)),
                params![key_param(key)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(err)?;
        text.map(|t| decode_value(&t)).transpose()
    }

    fn get_all(&mut self, table: &str) -> Result<Vec<Record>, EngineError> {
        self.select(table, None)
    }

    fn put(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, true)
    }

    fn add(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, false)
    }

    fn delete(&mut self, table: &str, key: &Key) -> Result<(), EngineError> {
        self.scope.write(table)?;
        self.layout(table)?;
        self.tx
            .execute(
                &format!("DELETE FROM {} WHERE key = ?1", data_table(table)),
                params![key_param(key)?],
            )
            .map_err(err)?;
        Ok(())
    }

    fn clear(&mut self, table: &str) -> Result<(), EngineError> {
        self.scope.write(table)?;
        self.layout(table)?;
        self.tx
            .execute(&format!("DELETE FROM {}", data_table(table)), [])
            .map_err(err)?;
        Ok(())
    }

    fn count(&mut self, table: &str) -> Result<u64, EngineError> {
        self.layout(table)?;
        let n: i64 = self
            .tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", data_table(table)),
                [],
                |row| row.get(0),
            )
            .map_err(err)?;
        Ok(n as u64)
    }

    fn open_cursor(
        &mut self,
        table: &str,
        query: Option<(&str, &Value)>,
    ) -> Result<Cursor, EngineError> {
        if let Some((column, _)) = query {
            if self.layout(table)?.index(column).is_none() {
                return Err(EngineError::IndexNotFound {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(Cursor::new(self.select(table, query)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_tags(engine: &SqliteEngine) -> SqliteHandle {
        engine
            .open_store("app", Some(1), &mut |editor, _| {
                editor.create_table("tags", KeyPolicy::CallerKey)?;
                editor.create_index("tags", "color", false)
            })
            .unwrap()
    }

    #[test]
    fn caller_keys_and_index_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        let store = open_tags(&engine);

        store
            .transaction(&["tags"], TxMode::ReadWrite, |tx| {
                tx.put("tags", Some(&Key::from("b")), json!({"color": "red"}))?;
                tx.put("tags", Some(&Key::from("a")), json!({"color": "red"}))?;
                tx.put("tags", Some(&Key::from("c")), json!({"color": "blue"}))
            })
            .unwrap();

        let red: Vec<Key> = store
            .transaction(&["tags"], TxMode::ReadOnly, |tx| {
                tx.open_cursor("tags", Some(("color", &json!("red"))))
            })
            .unwrap()
            .map(|r| r.key)
            .collect();
        assert_eq!(red, vec![Key::from("a"), Key::from("b")]);
    }

    #[test]
    fn add_rejects_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        let store = open_tags(&engine);
        let result = store.transaction(&["tags"], TxMode::ReadWrite, |tx| {
            tx.add("tags", Some(&Key::from("a")), json!({}))?;
            tx.add("tags", Some(&Key::from("a")), json!({}))
        });
        assert!(matches!(result, Err(EngineError::ConstraintViolation { .. })));
    }

    #[test]
    fn version_lives_in_user_version() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        let store = open_tags(&engine);
        store.close();
        assert!(matches!(store.table_names(), Err(EngineError::Closed)));

        let conn = Connection::open(dir.path().join("app.sqlite3")).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 1);
        assert_eq!(
            engine.list_stores().unwrap(),
            vec![StoreInfo { name: "app".into(), version: 1 }]
        );
    }

    #[test]
    fn wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        let store = open_tags(&engine);
        assert_eq!(store.journal_mode().unwrap(), "wal");
    }

    #[test]
    fn drop_store_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        open_tags(&engine).close();
        engine.drop_store("app").unwrap();
        assert!(!dir.path().join("app.sqlite3").exists());
        assert!(engine.list_stores().unwrap().is_empty());
    }

    #[test]
    fn dropped_store_closes_handles() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path()).unwrap();
        let handle = open_tags(&engine);
        engine.drop_store("app").unwrap();
        assert!(matches!(handle.table_names(), Err(EngineError::Closed)));
        assert!(matches!(handle.journal_mode(), Err(EngineError::Closed)));

        let fresh = open_tags(&engine);
        assert_eq!(fresh.table_names().unwrap().len(), 1);
        assert!(matches!(handle.table_names(), Err(EngineError::Closed)));
    }
}
