//! Pure-Rust storage engine using [`redb`](https://docs.rs/redb).
//!
//! No C dependencies. Each store is one `<name>.redb` file inside the
//! engine's directory (or an in-memory database for tests).
//!
//! Enable with `features = ["redb"]`.
//!
//! ```no_run
//! use tablekit_store::{RedbEngine, StorageEngine};
//!
//! let engine = RedbEngine::open("/tmp/tablekit").unwrap();
//! let stores = engine.list_stores().unwrap();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    TableDefinition, TableError, WriteTransaction,
};
use serde_json::Value;
use tablekit_migrate::{Key, Record};
use tracing::debug;

use crate::error::EngineError;
use crate::traits::{
    index_value, plan_open, Cursor, IndexSpec, KeyPolicy, SchemaEditor, SetupFn, StorageEngine,
    StoreHandle, StoreInfo, TableLayout, Transaction, TxMode, TxScope,
};

type Bytes = &'static [u8];

// ── Table definitions ───────────────────────────────────────────────

/// `version`, `layout:<table>` and `seq:<table>` entries.
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("__tablekit_meta");

const VERSION_KEY: &str = "version";
const LAYOUT_PREFIX: &str = "layout:";

fn layout_key(table: &str) -> String {
    format!("{LAYOUT_PREFIX}{table}")
}

fn seq_key(table: &str) -> String {
    format!("seq:{table}")
}

fn data_name(table: &str) -> String {
    format!("data:{table}")
}

fn index_name(table: &str, column: &str) -> String {
    format!("index:{table}:{column}")
}

fn err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Backend(e.to_string())
}

// ── Encoding ────────────────────────────────────────────────────────

/// Tag byte then payload; the byte order matches [`Key`]'s ordering.
fn encode_key(key: &Key) -> Vec<u8> {
    match key {
        Key::Number(n) => {
            let mut out = Vec::with_capacity(9);
            out.push(0);
            out.extend_from_slice(&n.to_be_bytes());
            out
        }
        Key::Text(s) => {
            let mut out = Vec::with_capacity(1 + s.len());
            out.push(1);
            out.extend_from_slice(s.as_bytes());
            out
        }
    }
}

fn decode_key(bytes: &[u8]) -> Result<Key, EngineError> {
    match bytes.split_first() {
        Some((0, rest)) => {
            let raw: [u8; 8] = rest
                .try_into()
                .map_err(|_| EngineError::Codec("invalid numeric key".into()))?;
            Ok(Key::Number(u64::from_be_bytes(raw)))
        }
        Some((1, rest)) => std::str::from_utf8(rest)
            .map(|s| Key::Text(s.to_string()))
            .map_err(EngineError::codec),
        _ => Err(EngineError::Codec("invalid key tag".into())),
    }
}

fn decode_value(bytes: &[u8]) -> Result<Value, EngineError> {
    serde_json::from_slice(bytes).map_err(EngineError::codec)
}

fn encode_value(value: &Value) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(EngineError::codec)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, EngineError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::Codec("invalid sequence".into()))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_u32(bytes: &[u8]) -> Result<u32, EngineError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| EngineError::Codec("invalid version".into()))?;
    Ok(u32::from_be_bytes(raw))
}

// ── Configuration ───────────────────────────────────────────────────

/// redb configuration options.
#[derive(Debug, Clone)]
pub struct RedbConfig {
    /// Page cache size in bytes per store. Defaults to 64 MiB.
    pub cache_size: usize,
}

impl Default for RedbConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
enum Location {
    Dir(PathBuf),
    Memory,
}

// ── Engine ──────────────────────────────────────────────────────────

/// A database shared by every handle of one store.
///
/// `dropped` is set by [`StorageEngine::drop_store`]; handles that still
/// point here report [`EngineError::Closed`] from then on.
struct OpenDb {
    db: Database,
    dropped: AtomicBool,
}

/// A storage engine built on [`redb`].
///
/// Databases are opened once and shared by every handle of the same store.
pub struct RedbEngine {
    location: Location,
    config: RedbConfig,
    open: Mutex<HashMap<String, Arc<OpenDb>>>,
}

impl RedbEngine {
    /// Open (or create) an engine rooted at `dir` with default config.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, EngineError> {
        Self::open_with_config(dir, RedbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(dir: P, config: RedbConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            location: Location::Dir(dir.as_ref().to_path_buf()),
            config,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// An engine whose stores live in memory (for testing).
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            config: RedbConfig::default(),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<OpenDb>>>, EngineError> {
        self.open.lock().map_err(|_| EngineError::LockPoisoned)
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        match &self.location {
            Location::Dir(dir) => Some(dir.join(format!("{name}.redb"))),
            Location::Memory => None,
        }
    }

    fn database(&self, name: &str) -> Result<Arc<OpenDb>, EngineError> {
        let mut open = self.registry()?;
        if let Some(store) = open.get(name) {
            return Ok(Arc::clone(store));
        }
        let mut builder = Database::builder();
        builder.set_cache_size(self.config.cache_size);
        let db = match self.path(name) {
            Some(path) => builder.create(path).map_err(err)?,
            None => builder
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .map_err(err)?,
        };
        let store = Arc::new(OpenDb {
            db,
            dropped: AtomicBool::new(false),
        });
        open.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn candidate_names(&self) -> Result<Vec<String>, EngineError> {
        match &self.location {
            Location::Memory => Ok(self.registry()?.keys().cloned().collect()),
            Location::Dir(dir) => {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("redb") {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
                Ok(names)
            }
        }
    }
}

fn read_version(txn: &ReadTransaction) -> Result<Option<u32>, EngineError> {
    let meta = match txn.open_table(META_TABLE) {
        Ok(meta) => meta,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(err(e)),
    };
    let version = meta.get(VERSION_KEY).map_err(err)?;
    version.map(|g| decode_u32(g.value())).transpose()
}

impl StorageEngine for RedbEngine {
    type Handle = RedbHandle;

    fn list_stores(&self) -> Result<Vec<StoreInfo>, EngineError> {
        let mut out = Vec::new();
        for name in self.candidate_names()? {
            let store = self.database(&name)?;
            let txn = store.db.begin_read().map_err(err)?;
            if let Some(version) = read_version(&txn)? {
                out.push(StoreInfo { name, version });
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
    ) -> Result<RedbHandle, EngineError> {
        let store = self.database(name)?;
        let txn = store.db.begin_write().map_err(err)?;
        let existing = {
            let meta = txn.open_table(META_TABLE).map_err(err)?;
            let version = meta.get(VERSION_KEY).map_err(err)?;
            version.map(|g| decode_u32(g.value())).transpose()?
        };
        let (target, needs_setup) = plan_open(existing, version)?;
        if needs_setup {
            setup(&mut RedbEditor { txn: &txn }, existing.unwrap_or(0))?;
            let mut meta = txn.open_table(META_TABLE).map_err(err)?;
            meta.insert(VERSION_KEY, target.to_be_bytes().as_slice())
                .map_err(err)?;
            drop(meta);
        }
        txn.commit().map_err(err)?;
        debug!(store = name, version = target, "redb store open");
        Ok(RedbHandle {
            name: name.to_string(),
            store,
            version: target,
            closed: AtomicBool::new(false),
        })
    }

    fn drop_store(&self, name: &str) -> Result<(), EngineError> {
        if let Some(store) = self.registry()?.remove(name) {
            store.dropped.store(true, Ordering::Release);
        }
        if let Some(path) = self.path(name) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ── Layout metadata ─────────────────────────────────────────────────

fn load_layout(txn: &WriteTransaction, table: &str) -> Result<Option<TableLayout>, EngineError> {
    let meta = txn.open_table(META_TABLE).map_err(err)?;
    let layout = meta.get(layout_key(table).as_str()).map_err(err)?;
    layout.map(|g| TableLayout::from_bytes(g.value())).transpose()
}

fn save_layout(txn: &WriteTransaction, table: &str, layout: &TableLayout) -> Result<(), EngineError> {
    let bytes = layout.to_bytes()?;
    let mut meta = txn.open_table(META_TABLE).map_err(err)?;
    meta.insert(layout_key(table).as_str(), bytes.as_slice())
        .map_err(err)?;
    Ok(())
}

fn layouts_in(meta: &impl ReadableTable<&'static str, Bytes>) -> Result<BTreeMap<String, TableLayout>, EngineError> {
    let mut out = BTreeMap::new();
    for item in meta.iter().map_err(err)? {
        let (k, v) = item.map_err(err)?;
        if let Some(table) = k.value().strip_prefix(LAYOUT_PREFIX) {
            out.insert(table.to_string(), TableLayout::from_bytes(v.value())?);
        }
    }
    Ok(out)
}

// ── Schema editing ──────────────────────────────────────────────────

struct RedbEditor<'a> {
    txn: &'a WriteTransaction,
}

impl RedbEditor<'_> {
    fn layouts(&self) -> Result<BTreeMap<String, TableLayout>, EngineError> {
        let meta = self.txn.open_table(META_TABLE).map_err(err)?;
        layouts_in(&meta)
    }
}

impl SchemaEditor for RedbEditor<'_> {
    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.layouts()?.into_keys().collect())
    }

    fn create_table(&mut self, name: &str, key_policy: KeyPolicy) -> Result<(), EngineError> {
        if load_layout(self.txn, name)?.is_some() {
            return Err(EngineError::TableExists(name.to_string()));
        }
        let data = data_name(name);
        self.txn
            .open_table(TableDefinition::<Bytes, Bytes>::new(&data))
            .map_err(err)?;
        save_layout(self.txn, name, &TableLayout::new(key_policy))
    }

    fn create_index(&mut self, table: &str, column: &str, unique: bool) -> Result<(), EngineError> {
        let mut layout =
            load_layout(self.txn, table)?.ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        if layout.index(column).is_some() {
            return Err(EngineError::IndexExists {
                table: table.to_string(),
                column: column.to_string(),
            });
        }

        let data = data_name(table);
        let index = index_name(table, column);
        let rows = {
            let t = self
                .txn
                .open_table(TableDefinition::<Bytes, Bytes>::new(&data))
                .map_err(err)?;
            scan(&t)?
        };
        let mut idx = self
            .txn
            .open_multimap_table(MultimapTableDefinition::<Bytes, Bytes>::new(&index))
            .map_err(err)?;
        for record in &rows {
            let Some(v) = index_value(&record.value, column) else {
                continue;
            };
            let ik = encode_value(v)?;
            if unique && idx.get(ik.as_slice()).map_err(err)?.next().is_some() {
                return Err(unique_violation(table, column, v));
            }
            idx.insert(ik.as_slice(), encode_key(&record.key).as_slice())
                .map_err(err)?;
        }
        drop(idx);

        layout.indexes.push(IndexSpec {
            column: column.to_string(),
            unique,
        });
        save_layout(self.txn, table, &layout)
    }

    fn drop_table(&mut self, name: &str) -> Result<(), EngineError> {
        let layout =
            load_layout(self.txn, name)?.ok_or_else(|| EngineError::TableNotFound(name.to_string()))?;
        for index in &layout.indexes {
            let index = index_name(name, &index.column);
            self.txn
                .delete_multimap_table(MultimapTableDefinition::<Bytes, Bytes>::new(&index))
                .map_err(err)?;
        }
        let data = data_name(name);
        self.txn
            .delete_table(TableDefinition::<Bytes, Bytes>::new(&data))
            .map_err(err)?;
        let mut meta = self.txn.open_table(META_TABLE).map_err(err)?;
        meta.remove(layout_key(name).as_str()).map_err(err)?;
        meta.remove(seq_key(name).as_str()).map_err(err)?;
        Ok(())
    }
}

fn unique_violation(table: &str, column: &str, value: &Value) -> EngineError {
    EngineError::ConstraintViolation {
        table: table.to_string(),
        detail: format!("unique index `{column}` already holds {value}"),
    }
}

// ── Read helpers ────────────────────────────────────────────────────

fn scan(table: &impl ReadableTable<Bytes, Bytes>) -> Result<Vec<Record>, EngineError> {
    let mut out = Vec::new();
    for item in table.iter().map_err(err)? {
        let (k, v) = item.map_err(err)?;
        out.push(Record::new(decode_key(k.value())?, decode_value(v.value())?));
    }
    Ok(out)
}

fn fetch(table: &impl ReadableTable<Bytes, Bytes>, key: &[u8]) -> Result<Option<Value>, EngineError> {
    let found = table.get(key).map_err(err)?;
    found.map(|g| decode_value(g.value())).transpose()
}

fn count_rows(table: &impl ReadableTable<Bytes, Bytes>) -> Result<u64, EngineError> {
    let mut n = 0u64;
    for item in table.iter().map_err(err)? {
        item.map_err(err)?;
        n += 1;
    }
    Ok(n)
}

fn lookup(
    index: &impl ReadableMultimapTable<Bytes, Bytes>,
    data: &impl ReadableTable<Bytes, Bytes>,
    wanted: &[u8],
) -> Result<Vec<Record>, EngineError> {
    let mut out = Vec::new();
    for item in index.get(wanted).map_err(err)? {
        let pk = item.map_err(err)?;
        if let Some(value) = fetch(data, pk.value())? {
            out.push(Record::new(decode_key(pk.value())?, value));
        }
    }
    Ok(out)
}

// ── Handle ──────────────────────────────────────────────────────────

/// An open redb store.
pub struct RedbHandle {
    name: String,
    store: Arc<OpenDb>,
    version: u32,
    closed: AtomicBool,
}

impl RedbHandle {
    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) || self.store.dropped.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_layouts(&self) -> Result<BTreeMap<String, TableLayout>, EngineError> {
        self.check_open()?;
        let txn = self.store.db.begin_read().map_err(err)?;
        let meta = txn.open_table(META_TABLE).map_err(err)?;
        layouts_in(&meta)
    }
}

impl StoreHandle for RedbHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn table_names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.read_layouts()?.into_keys().collect())
    }

    fn layout(&self, table: &str) -> Result<Option<TableLayout>, EngineError> {
        Ok(self.read_layouts()?.remove(table))
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
        let mut all = self.read_layouts()?;
        let mut layouts = BTreeMap::new();
        for table in tables {
            let layout = all
                .remove(*table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            layouts.insert(table.to_string(), layout);
        }

        let txn = match mode {
            TxMode::ReadOnly => RedbTxn::Read(self.store.db.begin_read().map_err(err)?),
            TxMode::ReadWrite => RedbTxn::Write(self.store.db.begin_write().map_err(err)?),
        };
        let mut tx = RedbTx {
            scope: TxScope::new(tables, mode),
            txn,
            layouts,
        };
        let out = f(&mut tx)?;
        if let RedbTxn::Write(txn) = tx.txn {
            txn.commit().map_err(err)?;
        }
        Ok(out)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ── Transactions ────────────────────────────────────────────────────

enum RedbTxn {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

/// Open the same table on either transaction kind and evaluate `$body`.
macro_rules! with_txn {
    ($txn:expr, $t:ident => $body:expr) => {
        match $txn {
            RedbTxn::Read($t) => $body,
            RedbTxn::Write($t) => $body,
        }
    };
}

struct RedbTx {
    scope: TxScope,
    txn: RedbTxn,
    layouts: BTreeMap<String, TableLayout>,
}

impl RedbTx {
    fn layout(&self, table: &str) -> Result<&TableLayout, EngineError> {
        self.scope.read(table)?;
        self.layouts
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))
    }

    fn writer(&self, table: &str) -> Result<&WriteTransaction, EngineError> {
        self.scope.write(table)?;
        match &self.txn {
            RedbTxn::Write(txn) => Ok(txn),
            RedbTxn::Read(_) => Err(EngineError::ReadOnly {
                table: table.to_string(),
            }),
        }
    }

    fn write(
        &mut self,
        table: &str,
        key: Option<&Key>,
        value: Value,
        overwrite: bool,
    ) -> Result<Key, EngineError> {
        let layout = self.layout(table)?.clone();
        let txn = self.writer(table)?;
        let data = data_name(table);
        let data_def = TableDefinition::<Bytes, Bytes>::new(&data);

        let seq = {
            let meta = txn.open_table(META_TABLE).map_err(err)?;
            let seq = meta.get(seq_key(table).as_str()).map_err(err)?;
            seq.map(|g| decode_u64(g.value())).transpose()?.unwrap_or(0)
        };
        let key = layout.resolve_key(table, key, seq)?;
        let pk = encode_key(&key);
        let old = {
            let t = txn.open_table(data_def).map_err(err)?;
            fetch(&t, &pk)?
        };
        if !overwrite && old.is_some() {
            return Err(EngineError::ConstraintViolation {
                table: table.to_string(),
                detail: format!("key {key} already exists"),
            });
        }

        // Check every unique index before touching any of them.
        for index in layout.indexes.iter().filter(|i| i.unique) {
            let Some(v) = index_value(&value, &index.column) else {
                continue;
            };
            let name = index_name(table, &index.column);
            let idx = txn
                .open_multimap_table(MultimapTableDefinition::<Bytes, Bytes>::new(&name))
                .map_err(err)?;
            for holder in idx.get(encode_value(v)?.as_slice()).map_err(err)? {
                if holder.map_err(err)?.value() != pk.as_slice() {
                    return Err(unique_violation(table, &index.column, v));
                }
            }
        }

        for index in &layout.indexes {
            let name = index_name(table, &index.column);
            let mut idx = txn
                .open_multimap_table(MultimapTableDefinition::<Bytes, Bytes>::new(&name))
                .map_err(err)?;
            if let Some(v) = old.as_ref().and_then(|o| index_value(o, &index.column)) {
                idx.remove(encode_value(v)?.as_slice(), pk.as_slice())
                    .map_err(err)?;
            }
            if let Some(v) = index_value(&value, &index.column) {
                idx.insert(encode_value(v)?.as_slice(), pk.as_slice())
                    .map_err(err)?;
            }
        }

        {
            let mut t = txn.open_table(data_def).map_err(err)?;
            t.insert(pk.as_slice(), encode_value(&value)?.as_slice())
                .map_err(err)?;
        }
        if let Key::Number(n) = key {
            if n > seq {
                let mut meta = txn.open_table(META_TABLE).map_err(err)?;
                meta.insert(seq_key(table).as_str(), n.to_be_bytes().as_slice())
                    .map_err(err)?;
            }
        }
        Ok(key)
    }
}

impl Transaction for RedbTx {
    fn mode(&self) -> TxMode {
        self.scope.mode()
    }

    fn get(&mut self, table: &str, key: &Key) -> Result<Option<Value>, EngineError> {
        self.layout(table)?;
        let data = data_name(table);
        let def = TableDefinition::<Bytes, Bytes>::new(&data);
        with_txn!(&self.txn, txn => fetch(&txn.open_table(def).map_err(err)?, &encode_key(key)))
    }

    fn get_all(&mut self, table: &str) -> Result<Vec<Record>, EngineError> {
        self.layout(table)?;
        let data = data_name(table);
        let def = TableDefinition::<Bytes, Bytes>::new(&data);
        with_txn!(&self.txn, txn => scan(&txn.open_table(def).map_err(err)?))
    }

    fn put(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, true)
    }

    fn add(&mut self, table: &str, key: Option<&Key>, value: Value) -> Result<Key, EngineError> {
        self.write(table, key, value, false)
    }

    fn delete(&mut self, table: &str, key: &Key) -> Result<(), EngineError> {
        let layout = self.layout(table)?.clone();
        let txn = self.writer(table)?;
        let data = data_name(table);
        let pk = encode_key(key);
        let old = {
            let mut t = txn
                .open_table(TableDefinition::<Bytes, Bytes>::new(&data))
                .map_err(err)?;
            let removed = t.remove(pk.as_slice()).map_err(err)?;
            removed.map(|g| decode_value(g.value())).transpose()?
        };
        let Some(old) = old else {
            return Ok(());
        };
        for index in &layout.indexes {
            if let Some(v) = index_value(&old, &index.column) {
                let name = index_name(table, &index.column);
                let mut idx = txn
                    .open_multimap_table(MultimapTableDefinition::<Bytes, Bytes>::new(&name))
                    .map_err(err)?;
                idx.remove(encode_value(v)?.as_slice(), pk.as_slice())
                    .map_err(err)?;
            }
        }
        Ok(())
    }

    fn clear(&mut self, table: &str) -> Result<(), EngineError> {
        let layout = self.layout(table)?.clone();
        let txn = self.writer(table)?;
        // Deleting and reopening leaves an empty table of the same name.
        let data = data_name(table);
        let def = TableDefinition::<Bytes, Bytes>::new(&data);
        txn.delete_table(def).map_err(err)?;
        txn.open_table(def).map_err(err)?;
        for index in &layout.indexes {
            let name = index_name(table, &index.column);
            let def = MultimapTableDefinition::<Bytes, Bytes>::new(&name);
            txn.delete_multimap_table(def).map_err(err)?;
            txn.open_multimap_table(def).map_err(err)?;
        }
        Ok(())
    }

    fn count(&mut self, table: &str) -> Result<u64, EngineError> {
        self.layout(table)?;
        let data = data_name(table);
        let def = TableDefinition::<Bytes, Bytes>::new(&data);
        with_txn!(&self.txn, txn => count_rows(&txn.open_table(def).map_err(err)?))
    }

    fn open_cursor(
        &mut self,
        table: &str,
        query: Option<(&str, &Value)>,
    ) -> Result<Cursor, EngineError> {
        let layout = self.layout(table)?;
        let data = data_name(table);
        let data_def = TableDefinition::<Bytes, Bytes>::new(&data);
        let records = match query {
            None => with_txn!(&self.txn, txn => scan(&txn.open_table(data_def).map_err(err)?))?,
            Some((column, wanted)) => {
                if layout.index(column).is_none() {
                    return Err(EngineError::IndexNotFound {
                        table: table.to_string(),
                        column: column.to_string(),
                    });
                }
                let name = index_name(table, column);
                let index_def = MultimapTableDefinition::<Bytes, Bytes>::new(&name);
                let wanted = encode_value(wanted)?;
                with_txn!(&self.txn, txn => {
                    let index = txn.open_multimap_table(index_def).map_err(err)?;
                    let data = txn.open_table(data_def).map_err(err)?;
                    lookup(&index, &data, &wanted)
                })?
            }
        };
        Ok(Cursor::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_items(engine: &RedbEngine) -> RedbHandle {
        engine
            .open_store("app", Some(1), &mut |editor, _| {
                editor.create_table("items", KeyPolicy::AutoIncrement)?;
                editor.create_index("items", "name", true)?;
                editor.create_index("items", "category", false)
            })
            .unwrap()
    }

    #[test]
    fn key_encoding_preserves_order() {
        let mut keys = vec![Key::from("b"), Key::Number(300), Key::from("a"), Key::Number(2)];
        let mut encoded: Vec<Vec<u8>> = keys.iter().map(encode_key).collect();
        keys.sort();
        encoded.sort();
        let decoded: Vec<Key> = encoded.iter().map(|b| decode_key(b).unwrap()).collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn index_follows_updates_and_deletes() {
        let engine = RedbEngine::in_memory();
        let store = open_items(&engine);
        let by_category = |store: &RedbHandle, c: &str| {
            store
                .transaction(&["items"], TxMode::ReadOnly, |tx| {
                    tx.open_cursor("items", Some(("category", &json!(c))))
                })
                .unwrap()
                .count()
        };

        store
            .transaction(&["items"], TxMode::ReadWrite, |tx| {
                tx.add("items", None, json!({"name": "Ramen", "category": "food"}))?;
                tx.add("items", None, json!({"name": "Soap", "category": "home"}))
            })
            .unwrap();
        assert_eq!(by_category(&store, "food"), 1);

        store
            .transaction(&["items"], TxMode::ReadWrite, |tx| {
                tx.put("items", Some(&Key::Number(1)), json!({"name": "Ramen", "category": "home"}))
            })
            .unwrap();
        assert_eq!(by_category(&store, "food"), 0);
        assert_eq!(by_category(&store, "home"), 2);

        store
            .transaction(&["items"], TxMode::ReadWrite, |tx| tx.delete("items", &Key::Number(2)))
            .unwrap();
        assert_eq!(by_category(&store, "home"), 1);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let engine = RedbEngine::in_memory();
        let store = open_items(&engine);
        let result = store.transaction(&["items"], TxMode::ReadWrite, |tx| {
            tx.add("items", None, json!({"name": "Ramen"}))?;
            tx.add("items", None, json!({"name": "Ramen"}))
        });
        assert!(matches!(result, Err(EngineError::ConstraintViolation { .. })));
        let n = store
            .transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items"))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn exhausted_key_sequence_is_an_error() {
        let engine = RedbEngine::in_memory();
        let store = open_items(&engine);
        store
            .transaction(&["items"], TxMode::ReadWrite, |tx| {
                tx.put("items", Some(&Key::Number(u64::MAX)), json!({"name": "last"}))
            })
            .unwrap();

        let result = store.transaction(&["items"], TxMode::ReadWrite, |tx| {
            tx.add("items", None, json!({"name": "one more"}))
        });
        assert!(matches!(result, Err(EngineError::ConstraintViolation { .. })));
        let n = store
            .transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items"))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn dropped_store_closes_handles() {
        let engine = RedbEngine::in_memory();
        let handle = open_items(&engine);
        engine.drop_store("app").unwrap();
        assert!(matches!(handle.table_names(), Err(EngineError::Closed)));
        let result = handle.transaction(&["items"], TxMode::ReadOnly, |tx| tx.count("items"));
        assert!(matches!(result, Err(EngineError::Closed)));
        assert!(engine.list_stores().unwrap().is_empty());

        // Reopening the name starts from scratch.
        let fresh = open_items(&engine);
        assert_eq!(fresh.table_names().unwrap(), vec!["items".to_string()]);
        assert!(matches!(handle.table_names(), Err(EngineError::Closed)));
    }

    #[test]
    fn file_backed_stores_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = RedbEngine::open(dir.path()).unwrap();
            let store = open_items(&engine);
            store
                .transaction(&["items"], TxMode::ReadWrite, |tx| {
                    tx.add("items", None, json!({"name": "Ramen"}))
                })
                .unwrap();
        }

        let engine = RedbEngine::open(dir.path()).unwrap();
        assert_eq!(
            engine.list_stores().unwrap(),
            vec![StoreInfo { name: "app".into(), version: 1 }]
        );
        let store = engine.open_store("app", None, &mut |_, _| Ok(())).unwrap();
        let all = store
            .transaction(&["items"], TxMode::ReadOnly, |tx| tx.get_all("items"))
            .unwrap();
        assert_eq!(all, vec![Record::new(1u64, json!({"name": "Ramen"}))]);

        engine.drop_store("app").unwrap();
        assert!(engine.list_stores().unwrap().is_empty());
    }
}
