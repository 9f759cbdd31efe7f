//! Convenient re-exports for common usage.
//!
//! ```
//! use tablekit::prelude::*;
//! ```

pub use crate::Column;
pub use crate::Database;
pub use crate::DbError;
pub use crate::Key;
pub use crate::MemoryEngine;
pub use crate::MigrationError;
pub use crate::OpenOutcome;
pub use crate::Record;
pub use crate::SchemaModel;
pub use crate::TableDefinition;
pub use crate::TabularState;

#[cfg(feature = "observable")]
pub use crate::Observable;
#[cfg(feature = "redb")]
pub use crate::RedbEngine;
#[cfg(feature = "sqlite")]
pub use crate::SqliteEngine;
