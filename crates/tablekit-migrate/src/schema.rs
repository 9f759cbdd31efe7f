use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{MigrationError, MigrationStep};
use crate::state::{KeyKind, TabularState};

/// A named field of a [`TableDefinition::Keyed`] table.
///
/// Uniqueness can only be requested together with an index, so a
/// unique-but-unindexed column is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Column {
    indexable: bool,
    unique: bool,
}

impl Column {
    /// A plain column with no secondary index.
    pub const fn plain() -> Self {
        Self {
            indexable: false,
            unique: false,
        }
    }

    /// A column with a non-unique secondary index.
    pub const fn indexed() -> Self {
        Self {
            indexable: true,
            unique: false,
        }
    }

    /// A column with a unique secondary index.
    pub const fn unique() -> Self {
        Self {
            indexable: true,
            unique: true,
        }
    }

    /// Whether a secondary index is built for this column.
    pub fn is_indexable(&self) -> bool {
        self.indexable
    }

    /// Whether the index enforces uniqueness.
    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

/// Definition of one table in a [`SchemaModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableDefinition {
    /// Named columns, auto-increment numeric key, one index per indexable column.
    Keyed {
        /// Columns by name.
        columns: BTreeMap<String, Column>,
    },
    /// A single opaque value per key.
    Simple {
        /// `true` for auto-increment numeric keys, `false` for caller-supplied strings.
        auto_key: bool,
    },
}

impl TableDefinition {
    /// A keyed table from `(name, column)` pairs.
    pub fn keyed<N: Into<String>>(columns: impl IntoIterator<Item = (N, Column)>) -> Self {
        Self::Keyed {
            columns: columns.into_iter().map(|(n, c)| (n.into(), c)).collect(),
        }
    }

    /// A simple table with auto-increment keys.
    pub fn auto_keyed() -> Self {
        Self::Simple { auto_key: true }
    }

    /// A simple table with caller-supplied string keys.
    pub fn caller_keyed() -> Self {
        Self::Simple { auto_key: false }
    }

    /// The primary key kind, fixed by the definition.
    pub fn key_kind(&self) -> KeyKind {
        match self {
            Self::Keyed { .. } | Self::Simple { auto_key: true } => KeyKind::Number,
            Self::Simple { auto_key: false } => KeyKind::Text,
        }
    }

    /// Indexed columns as `(column, unique)`. Empty for simple tables.
    pub fn indexes(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        let columns = match self {
            Self::Keyed { columns } => Some(columns),
            Self::Simple { .. } => None,
        };
        columns
            .into_iter()
            .flat_map(|c| c.iter())
            .filter(|(_, col)| col.is_indexable())
            .map(|(name, col)| (name.as_str(), col.is_unique()))
    }

    /// Whether `column` has a secondary index.
    pub fn has_index(&self, column: &str) -> bool {
        self.indexes().any(|(name, _)| name == column)
    }
}

/// Table name → definition.
pub type Tables = BTreeMap<String, TableDefinition>;

/// How a model was derived from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// The first model of a chain.
    Root,
    /// Built by [`SchemaModel::next`]: tables replace the previous set.
    Replace,
    /// Built by [`SchemaModel::extend`]: tables merged over the previous set.
    Extend,
}

struct ModelNode {
    version: u32,
    tables: Tables,
    prev: Option<SchemaModel>,
    migrate: Option<Arc<dyn MigrationStep>>,
    revision: Revision,
}

/// One version of a store's schema, linked to the version before it.
///
/// Models are immutable and cheap to clone. A chain is built forward from
/// [`SchemaModel::create`] and traversed backward through [`SchemaModel::prev`].
///
/// # Example
///
/// ```
/// use tablekit_migrate::{Column, Record, SchemaModel, TableDefinition, TabularState};
///
/// let v1 = SchemaModel::create([
///     ("notes", TableDefinition::keyed([("title", Column::unique())])),
/// ]);
/// let v2 = v1.extend([("tags", TableDefinition::caller_keyed())], |mut old: TabularState| {
///     let notes = old.take("notes");
///     Ok(TabularState::new().with_table("notes", notes).with_table("tags", Vec::<Record>::new()))
/// });
///
/// assert_eq!(v2.version(), 2);
/// assert_eq!(v2.prev().map(|m| m.version()), Some(1));
/// assert!(v2.table("tags").is_some());
/// ```
#[derive(Clone)]
pub struct SchemaModel {
    node: Arc<ModelNode>,
}

impl SchemaModel {
    /// Build the root model at version 1.
    pub fn create<N: Into<String>>(tables: impl IntoIterator<Item = (N, TableDefinition)>) -> Self {
        Self::from_node(ModelNode {
            version: 1,
            tables: collect_tables(tables),
            prev: None,
            migrate: None,
            revision: Revision::Root,
        })
    }

    /// Build a successor whose tables fully replace this model's tables.
    ///
    /// `migrate` receives this model's state and must return every table of
    /// the new set.
    pub fn next<N, F>(&self, tables: impl IntoIterator<Item = (N, TableDefinition)>, migrate: F) -> Self
    where
        N: Into<String>,
        F: Fn(TabularState) -> Result<TabularState, MigrationError> + Send + Sync + 'static,
    {
        self.next_step(tables, migrate)
    }

    /// Like [`next`](Self::next), with any [`MigrationStep`] implementation.
    pub fn next_step<N, M>(&self, tables: impl IntoIterator<Item = (N, TableDefinition)>, step: M) -> Self
    where
        N: Into<String>,
        M: MigrationStep + 'static,
    {
        self.successor(collect_tables(tables), Arc::new(step), Revision::Replace)
    }

    /// Build a successor whose tables are this model's tables with
    /// `add_tables` merged in (same names override).
    ///
    /// `migrate` must still return every table of the merged set, including
    /// the unchanged ones.
    pub fn extend<N, F>(&self, add_tables: impl IntoIterator<Item = (N, TableDefinition)>, migrate: F) -> Self
    where
        N: Into<String>,
        F: Fn(TabularState) -> Result<TabularState, MigrationError> + Send + Sync + 'static,
    {
        self.extend_step(add_tables, migrate)
    }

    /// Like [`extend`](Self::extend), with any [`MigrationStep`] implementation.
    pub fn extend_step<N, M>(&self, add_tables: impl IntoIterator<Item = (N, TableDefinition)>, step: M) -> Self
    where
        N: Into<String>,
        M: MigrationStep + 'static,
    {
        let mut tables = self.node.tables.clone();
        tables.extend(collect_tables(add_tables));
        self.successor(tables, Arc::new(step), Revision::Extend)
    }

    fn successor(&self, tables: Tables, migrate: Arc<dyn MigrationStep>, revision: Revision) -> Self {
        Self::from_node(ModelNode {
            version: self.node.version + 1,
            tables,
            prev: Some(self.clone()),
            migrate: Some(migrate),
            revision,
        })
    }

    fn from_node(node: ModelNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Schema version of this model.
    pub fn version(&self) -> u32 {
        self.node.version
    }

    /// All table definitions.
    pub fn tables(&self) -> &Tables {
        &self.node.tables
    }

    /// One table definition.
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.node.tables.get(name)
    }

    /// The immediately preceding model.
    pub fn prev(&self) -> Option<&SchemaModel> {
        self.node.prev.as_ref()
    }

    /// The migration from the previous model's state to this one's.
    pub fn migration(&self) -> Option<&dyn MigrationStep> {
        self.node.migrate.as_deref()
    }

    /// Whether this model carries a migration.
    pub fn has_migration(&self) -> bool {
        self.node.migrate.is_some()
    }

    /// How this model was derived.
    pub fn revision(&self) -> Revision {
        self.node.revision
    }

    /// This model followed by every predecessor, newest first.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// The model in this chain with the given version.
    pub fn at_version(&self, version: u32) -> Option<&SchemaModel> {
        self.ancestors().find(|m| m.version() == version)
    }
}

impl fmt::Debug for SchemaModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaModel")
            .field("version", &self.node.version)
            .field("revision", &self.node.revision)
            .field("tables", &self.node.tables.keys().collect::<Vec<_>>())
            .field("has_migration", &self.has_migration())
            .finish()
    }
}

/// Iterator over a model and its predecessors.
pub struct Ancestors<'a> {
    next: Option<&'a SchemaModel>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a SchemaModel;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.prev();
        Some(current)
    }
}

fn collect_tables<N: Into<String>>(tables: impl IntoIterator<Item = (N, TableDefinition)>) -> Tables {
    tables.into_iter().map(|(n, t)| (n.into(), t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(state: TabularState) -> Result<TabularState, MigrationError> {
        Ok(state)
    }

    #[test]
    fn root_has_no_predecessor() {
        let model = SchemaModel::create([("a", TableDefinition::auto_keyed())]);
        assert_eq!(model.version(), 1);
        assert!(model.prev().is_none());
        assert!(!model.has_migration());
        assert_eq!(model.revision(), Revision::Root);
    }

    #[test]
    fn next_replaces_tables() {
        let v1 = SchemaModel::create([("a", TableDefinition::auto_keyed())]);
        let v2 = v1.next([("b", TableDefinition::caller_keyed())], identity);
        assert_eq!(v2.version(), 2);
        assert!(v2.table("a").is_none());
        assert!(v2.table("b").is_some());
        assert_eq!(v2.revision(), Revision::Replace);
        assert!(v2.has_migration());
    }

    #[test]
    fn extend_merges_and_overrides() {
        let v1 = SchemaModel::create([
            ("a", TableDefinition::auto_keyed()),
            ("b", TableDefinition::auto_keyed()),
        ]);
        let v2 = v1.extend([("b", TableDefinition::caller_keyed())], identity);
        assert_eq!(v2.tables().len(), 2);
        assert_eq!(v2.table("b"), Some(&TableDefinition::caller_keyed()));
        assert_eq!(v2.revision(), Revision::Extend);
        // the predecessor is untouched
        assert_eq!(v1.table("b"), Some(&TableDefinition::auto_keyed()));
    }

    #[test]
    fn key_kinds_follow_definition() {
        let keyed = TableDefinition::keyed([("name", Column::unique())]);
        assert_eq!(keyed.key_kind(), KeyKind::Number);
        assert_eq!(TableDefinition::auto_keyed().key_kind(), KeyKind::Number);
        assert_eq!(TableDefinition::caller_keyed().key_kind(), KeyKind::Text);
    }

    #[test]
    fn indexes_skip_plain_columns() {
        let table = TableDefinition::keyed([
            ("name", Column::unique()),
            ("category", Column::indexed()),
            ("notes", Column::plain()),
        ]);
        let indexes: Vec<_> = table.indexes().collect();
        assert_eq!(indexes, vec![("category", false), ("name", true)]);
        assert!(!table.has_index("notes"));
        assert_eq!(TableDefinition::auto_keyed().indexes().count(), 0);
    }

    #[test]
    fn ancestors_walk_backward() {
        let v1 = SchemaModel::create([("a", TableDefinition::auto_keyed())]);
        let v3 = v1.extend(Vec::<(String, _)>::new(), identity).extend(Vec::<(String, _)>::new(), identity);
        let versions: Vec<u32> = v3.ancestors().map(SchemaModel::version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(v3.at_version(2).map(SchemaModel::version), Some(2));
        assert!(v3.at_version(4).is_none());
    }
}
