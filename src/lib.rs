//! # tablekit
//!
//! Typed tables over transactional, versioned key-value stores, with
//! chained schema migrations and live observables.
//!
//! A store's schema is a chain of [`SchemaModel`]s. Opening a store written
//! by an older model snapshots it, rebuilds the tables of the current model
//! and replays the migrated records, all before [`Database::open`] returns.
//! Every mutation notifies table listeners; an [`Observable`] uses them to
//! keep a derived value current.
//!
//! ## Quick Start
//!
//! ```
//! use tablekit::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Item { name: String, category: String }
//!
//! let v1 = SchemaModel::create([
//!     ("items", TableDefinition::keyed([("name", Column::unique()), ("category", Column::indexed())])),
//! ]);
//!
//! let engine = MemoryEngine::new();
//! let db = Database::open(&engine, "shop", v1).unwrap();
//! db.add("items", &Item { name: "Ramen".into(), category: "cooking".into() }).unwrap();
//!
//! let cooking: Vec<Item> = db.get_all_by("items", "category", "cooking").unwrap();
//! assert_eq!(cooking.len(), 1);
//! ```
//!
//! ## Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | [`tablekit_migrate`] | Schema model chain, tabular state, migration engine |
//! | [`tablekit_store`] | Storage engines, upgrade protocol, `Database`, observables |
//!
//! ## Features
//!
//! | Feature | Default | Enables |
//! |---------|---------|---------|
//! | `observable` | yes | [`Observable`] (pulls in `tokio`) |
//! | `redb` | no | `RedbEngine` |
//! | `sqlite` | no | `SqliteEngine` (bundled SQLite) |

pub mod prelude;

pub use tablekit_migrate;
pub use tablekit_store;

pub use tablekit_migrate::{
    evaluate_from_old_version, Column, Key, KeyKind, MigrationEngine, MigrationError, MigrationStep,
    Record, Revision, SchemaModel, TableDefinition, TabularState,
};
#[cfg(feature = "observable")]
pub use tablekit_store::{Observable, ObservableState};
#[cfg(feature = "redb")]
pub use tablekit_store::{RedbConfig, RedbEngine};
#[cfg(feature = "sqlite")]
pub use tablekit_store::{JournalMode, SqliteConfig, SqliteEngine};
pub use tablekit_store::{
    Database, DatabaseBuilder, DatabaseConfig, DbError, EngineError, MemoryEngine,
    MigrationFailurePolicy, OpenOutcome, StorageEngine, StoreHandle, Subscription,
};
