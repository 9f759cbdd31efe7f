//! Opening a store at a model's version.
//!
//! ```text
//! DETECT ──► NEW ───────► create structure at the model version
//!        ├─► SAME ──────► open, contents untouched
//!        ├─► UPGRADE ───► snapshot at old version, close,
//!        │                drop + recreate structure at the model version,
//!        │                migrate snapshot, replay (or reset on failure)
//!        └─► newer ─────► version conflict
//! ```

use tablekit_migrate::{evaluate_from_old_version, MigrationError, SchemaModel, TabularState};
use tracing::{debug, info, warn};

use crate::error::{DbError, EngineError};
use crate::traits::{KeyPolicy, SchemaEditor, StorageEngine, StoreHandle, TxMode};

/// What happens when the upgrade migration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationFailurePolicy {
    /// Keep the recreated, empty tables and report [`OpenOutcome::Reset`].
    #[default]
    ResetTables,
    /// Fail the open with [`DbError::Migration`]. The structure has already
    /// been recreated, so the store is empty at the new version either way.
    Abort,
}

/// How [`Database::open`](crate::Database::open) found the store.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// The store did not exist and was created at the model version.
    Created,
    /// The store was already at the model version.
    Opened,
    /// The store was migrated from an older version.
    Upgraded {
        /// Version found on open.
        from: u32,
        /// Records written back after migration.
        replayed: usize,
    },
    /// The migration failed; the store now holds empty tables.
    Reset {
        /// Version found on open.
        from: u32,
        /// Why the migration failed.
        error: MigrationError,
    },
}

impl OpenOutcome {
    /// The version the store had before this open, if it existed.
    pub fn previous_version(&self) -> Option<u32> {
        match self {
            Self::Created | Self::Opened => None,
            Self::Upgraded { from, .. } | Self::Reset { from, .. } => Some(*from),
        }
    }

    /// Whether existing data was discarded.
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

/// Open `name` at `model.version()`, upgrading older stores.
pub(crate) fn open_with_model<E: StorageEngine>(
    engine: &E,
    name: &str,
    model: &SchemaModel,
    policy: MigrationFailurePolicy,
) -> Result<(E::Handle, OpenOutcome), DbError> {
    let target = model.version();
    let existing = engine
        .list_stores()
        .map_err(DbError::Structural)?
        .into_iter()
        .find(|info| info.name == name)
        .map(|info| info.version)
        .filter(|&v| v > 0);

    match existing {
        None => {
            info!(store = name, version = target, "creating store");
            let handle = engine
                .open_store(name, Some(target), &mut |editor, _| rebuild(editor, model))
                .map_err(DbError::Structural)?;
            Ok((handle, OpenOutcome::Created))
        }
        Some(found) if found == target => {
            debug!(store = name, version = target, "store is current");
            let handle = engine
                .open_store(name, Some(target), &mut |_, _| Ok(()))
                .map_err(DbError::Structural)?;
            Ok((handle, OpenOutcome::Opened))
        }
        Some(found) if found > target => Err(DbError::Structural(EngineError::VersionConflict {
            requested: target,
            existing: found,
        })),
        Some(from) => upgrade(engine, name, model, from, policy),
    }
}

fn upgrade<E: StorageEngine>(
    engine: &E,
    name: &str,
    model: &SchemaModel,
    from: u32,
    policy: MigrationFailurePolicy,
) -> Result<(E::Handle, OpenOutcome), DbError> {
    let to = model.version();

    let old = engine
        .open_store(name, Some(from), &mut |_, _| Ok(()))
        .map_err(DbError::Structural)?;
    let snapshot = read_all(&old);
    old.close();
    let snapshot = snapshot.map_err(DbError::Structural)?;
    info!(
        store = name,
        from,
        to,
        tables = snapshot.len(),
        records = snapshot.record_count(),
        "upgrading store"
    );

    let handle = engine
        .open_store(name, Some(to), &mut |editor, _| rebuild(editor, model))
        .map_err(DbError::Structural)?;

    match evaluate_from_old_version(model, from, snapshot) {
        Ok(state) => match replay(&handle, state) {
            Ok(replayed) => {
                info!(store = name, from, to, replayed, "store upgraded");
                Ok((handle, OpenOutcome::Upgraded { from, replayed }))
            }
            Err(e) => {
                handle.close();
                Err(DbError::Structural(e))
            }
        },
        Err(error) => {
            warn!(store = name, from, to, %error, "migration failed, tables were reset");
            match policy {
                MigrationFailurePolicy::ResetTables => Ok((handle, OpenOutcome::Reset { from, error })),
                MigrationFailurePolicy::Abort => {
                    handle.close();
                    Err(DbError::Migration(error))
                }
            }
        }
    }
}

/// Drop every table, then create the model's tables and indexes.
fn rebuild(editor: &mut dyn SchemaEditor, model: &SchemaModel) -> Result<(), EngineError> {
    for table in editor.table_names()? {
        editor.drop_table(&table)?;
    }
    for (name, def) in model.tables() {
        editor.create_table(name, KeyPolicy::for_kind(def.key_kind()))?;
        for (column, unique) in def.indexes() {
            editor.create_index(name, column, unique)?;
        }
    }
    Ok(())
}

/// Every record of every table, in one read-only transaction.
pub(crate) fn read_all<H: StoreHandle>(handle: &H) -> Result<TabularState, EngineError> {
    let names = handle.table_names()?;
    let scope: Vec<&str> = names.iter().map(String::as_str).collect();
    handle.transaction(&scope, TxMode::ReadOnly, |tx| {
        let mut state = TabularState::new();
        for &table in &scope {
            state.insert(table, tx.get_all(table)?);
        }
        Ok(state)
    })
}

/// Write every record back with its original key, in one transaction.
fn replay<H: StoreHandle>(handle: &H, state: TabularState) -> Result<usize, EngineError> {
    let names: Vec<String> = state.table_names().map(str::to_string).collect();
    let scope: Vec<&str> = names.iter().map(String::as_str).collect();
    handle.transaction(&scope, TxMode::ReadWrite, |tx| {
        let mut replayed = 0;
        for (table, records) in state {
            for record in records {
                tx.put(&table, Some(&record.key), record.value)?;
                replayed += 1;
            }
        }
        Ok(replayed)
    })
}
