use std::collections::BTreeSet;

use tracing::debug;

use crate::schema::SchemaModel;
use crate::state::TabularState;

/// A migration from one schema version's tabular state to the next.
///
/// Each step must be **deterministic and pure**: the same input always
/// produces the same output. Any
/// `Fn(TabularState) -> Result<TabularState, MigrationError>` closure is a
/// step.
pub trait MigrationStep: Send + Sync {
    /// Transform the previous version's state into this version's state.
    fn migrate(&self, state: TabularState) -> Result<TabularState, MigrationError>;
}

impl<F> MigrationStep for F
where
    F: Fn(TabularState) -> Result<TabularState, MigrationError> + Send + Sync,
{
    fn migrate(&self, state: TabularState) -> Result<TabularState, MigrationError> {
        self(state)
    }
}

/// Error during migration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MigrationError {
    /// Origin and target versions are equal; nothing to run.
    #[error("store is already at v{version}, nothing to migrate")]
    NothingToMigrate { version: u32 },
    /// The origin version is newer than the target model.
    #[error("data version v{found} is newer than current v{current}")]
    FutureVersion { found: u32, current: u32 },
    /// The chain ends before reaching the origin version.
    #[error("missing schema model for v{missing}")]
    GapInChain { missing: u32 },
    /// A model in the required range has no migration function.
    #[error("schema v{version} has no migration function")]
    MissingMigration { version: u32 },
    /// A migration function failed.
    #[error("migration v{from}→v{to} failed: {reason}")]
    StepFailed { from: u32, to: u32, reason: String },
    /// A migration returned a different table set than its model declares.
    #[error("migration to v{version} emitted tables {emitted:?}, expected {expected:?}")]
    TableSetMismatch {
        version: u32,
        expected: Vec<String>,
        emitted: Vec<String>,
    },
    /// Deserialization of a record failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// Serialization of a record failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Compose migrations from `origin_version` up to `target`.
///
/// With models `M1 → … → Mn` and origin `v`, the result is
/// `Mn.migrate(… M(v+1).migrate(state))`: the chain is walked backward to
/// find the links, then the oldest link runs first. The output of every link
/// is checked to name exactly the tables of its model.
///
/// Callers must not call this when `origin_version == target.version()`.
pub fn evaluate_from_old_version(
    target: &SchemaModel,
    origin_version: u32,
    state: TabularState,
) -> Result<TabularState, MigrationError> {
    let current = target.version();
    if origin_version > current {
        return Err(MigrationError::FutureVersion {
            found: origin_version,
            current,
        });
    }
    if origin_version == current {
        return Err(MigrationError::NothingToMigrate { version: current });
    }

    // Newest first: M(current), M(current-1), ..., M(origin+1).
    let mut links = Vec::with_capacity((current - origin_version) as usize);
    let mut model = Some(target);
    for version in ((origin_version + 1)..=current).rev() {
        let m = model
            .filter(|m| m.version() == version)
            .ok_or(MigrationError::GapInChain { missing: version })?;
        if !m.has_migration() {
            return Err(MigrationError::MissingMigration { version });
        }
        links.push(m);
        model = m.prev();
    }

    let mut state = state;
    for m in links.into_iter().rev() {
        let to = m.version();
        let step = m
            .migration()
            .ok_or(MigrationError::MissingMigration { version: to })?;
        debug!(from = to - 1, to, tables = state.len(), "running migration step");
        state = step.migrate(state).map_err(|e| MigrationError::StepFailed {
            from: to - 1,
            to,
            reason: e.to_string(),
        })?;
        check_table_set(m, &state)?;
    }
    Ok(state)
}

fn check_table_set(model: &SchemaModel, state: &TabularState) -> Result<(), MigrationError> {
    let expected: BTreeSet<&str> = model.tables().keys().map(String::as_str).collect();
    let emitted: BTreeSet<&str> = state.table_names().collect();
    if expected == emitted {
        return Ok(());
    }
    Err(MigrationError::TableSetMismatch {
        version: model.version(),
        expected: expected.into_iter().map(str::to_string).collect(),
        emitted: emitted.into_iter().map(str::to_string).collect(),
    })
}

/// Runs a model chain's migrations against stored state.
///
/// The engine is bound to one target model. When data at version N needs to
/// reach version M (N < M), it runs the migrations of models N+1, ..., M in
/// sequence.
///
/// # Example
///
/// ```
/// use tablekit_migrate::{MigrationEngine, Record, SchemaModel, TableDefinition, TabularState};
/// use serde_json::json;
///
/// let v1 = SchemaModel::create([("readings", TableDefinition::auto_keyed())]);
/// let v2 = v1.next([("readings", TableDefinition::auto_keyed())], |mut s: TabularState| {
///     let rows = s
///         .take("readings")
///         .into_iter()
///         .map(|r| r.map(|v| json!({ "celsius": v })))
///         .collect();
///     Ok(TabularState::new().with_table("readings", rows))
/// });
///
/// let engine = MigrationEngine::new(v2);
/// let old = TabularState::new().with_table("readings", vec![Record::new(1u64, json!(22.5))]);
/// let new = engine.migrate_to_current(old, 1).unwrap();
/// assert_eq!(new.table("readings").unwrap()[0].value, json!({ "celsius": 22.5 }));
/// ```
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    target: SchemaModel,
}

impl MigrationEngine {
    /// Create an engine targeting `model`.
    pub fn new(model: SchemaModel) -> Self {
        Self { target: model }
    }

    /// The target model.
    pub fn target(&self) -> &SchemaModel {
        &self.target
    }

    /// The current (target) schema version.
    pub fn current_version(&self) -> u32 {
        self.target.version()
    }

    /// Check if data needs migration.
    pub fn needs_migration(&self, data_version: u32) -> bool {
        data_version != self.target.version()
    }

    /// Migrate `state` from `from_version` to the current version.
    ///
    /// Returns `state` unchanged when it is already current.
    pub fn migrate_to_current(
        &self,
        state: TabularState,
        from_version: u32,
    ) -> Result<TabularState, MigrationError> {
        if !self.needs_migration(from_version) {
            return Ok(state);
        }
        evaluate_from_old_version(&self.target, from_version, state)
    }

    /// Validate that every version from `min_version` to current can be migrated.
    pub fn validate_chain(&self, min_version: u32) -> Result<(), MigrationError> {
        let current = self.target.version();
        if min_version > current {
            return Err(MigrationError::FutureVersion {
                found: min_version,
                current,
            });
        }
        for version in (min_version + 1)..=current {
            match self.target.at_version(version) {
                Some(m) if m.has_migration() => {}
                Some(_) => return Err(MigrationError::MissingMigration { version }),
                None => return Err(MigrationError::GapInChain { missing: version }),
            }
        }
        Ok(())
    }

    /// All migration links of the chain as (from, to) pairs, oldest first.
    pub fn registered_steps(&self) -> Vec<(u32, u32)> {
        let mut steps: Vec<(u32, u32)> = self
            .target
            .ancestors()
            .filter(|m| m.has_migration())
            .map(|m| (m.version() - 1, m.version()))
            .collect();
        steps.reverse();
        steps
    }
}
