//! # tablekit-store
//!
//! Storage engines, the store upgrade protocol, typed table access and live
//! observables for [`tablekit`](https://docs.rs/tablekit).
//!
//! A [`Database`] opens a named store at a
//! [`SchemaModel`](tablekit_migrate::SchemaModel)'s version. Older stores are
//! snapshotted, rebuilt and migrated in one pass before the handle is
//! returned. Every mutation notifies table listeners, which
//! [`Observable`]s use to recompute derived values.
//!
//! ## Quick Start
//!
//! ```
//! use tablekit_migrate::{Column, SchemaModel, TableDefinition};
//! use tablekit_store::{Database, MemoryEngine, OpenOutcome};
//!
//! let model = SchemaModel::create([
//!     ("sensors", TableDefinition::keyed([("name", Column::unique())])),
//! ]);
//! let db = Database::open(&MemoryEngine::new(), "edge", model).unwrap();
//! assert_eq!(db.outcome(), &OpenOutcome::Created);
//!
//! let key = db.add("sensors", &serde_json::json!({ "name": "s-42" })).unwrap();
//! assert!(db.has("sensors", key).unwrap());
//! ```
//!
//! ## Engines
//!
//! | Engine | Feature flag | Use case |
//! |--------|-------------|----------|
//! | [`MemoryEngine`] | *(always available)* | Testing, prototyping |
//! | `RedbEngine` | `redb` | Pure-Rust embedded storage |
//! | `SqliteEngine` | `sqlite` | Desktop, mobile, edge Linux |

mod db;
mod error;
mod listeners;
mod memory;
#[cfg(feature = "observable")]
mod observable;
#[cfg(feature = "redb")]
mod redb;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;
mod upgrade;

pub use db::{Database, DatabaseBuilder, DatabaseConfig};
pub use error::{DbError, EngineError};
pub use listeners::Subscription;
pub use memory::{MemoryEngine, MemoryHandle};
#[cfg(feature = "observable")]
pub use observable::{Observable, ObservableState};
#[cfg(feature = "redb")]
pub use redb::{RedbConfig, RedbEngine, RedbHandle};
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteEngine, SqliteHandle};
pub use traits::*;
pub use upgrade::{MigrationFailurePolicy, OpenOutcome};
