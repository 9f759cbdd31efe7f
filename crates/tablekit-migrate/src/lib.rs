//! # tablekit-migrate
//!
//! Versioned schema models and composed table migrations for
//! [`tablekit`](https://docs.rs/tablekit).
//!
//! A store's schema is described by a chain of [`SchemaModel`]s. Every model
//! after the first carries a migration that turns the previous version's
//! [`TabularState`] into its own. Opening a store written at version `v`
//! with a model at version `n` runs the migrations of `v+1, ..., n` in order.
//!
//! ## Key Concepts
//!
//! - **Linear chain**: versions are consecutive, starting at 1, and every link
//!   is kept so any older store can still be upgraded.
//! - **Whole-state migrations**: a migration sees every table of the previous
//!   version and must emit every table of its own version.
//! - **Deterministic**: the same old state always produces the same new state.

mod engine;
mod schema;
mod state;

pub use engine::{evaluate_from_old_version, MigrationEngine, MigrationError, MigrationStep};
pub use schema::{Ancestors, Column, Revision, SchemaModel, TableDefinition, Tables};
pub use state::{Key, KeyKind, Record, TabularState};
