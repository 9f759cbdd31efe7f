use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::MigrationError;

/// The kind of primary key a table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Engine-assigned, auto-incrementing integer.
    Number,
    /// Caller-supplied string.
    Text,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number => f.write_str("number"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// A primary key.
///
/// Auto-increment tables use [`Key::Number`], caller-keyed tables use
/// [`Key::Text`]. Numeric keys sort before text keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Auto-increment key.
    Number(u64),
    /// Caller-supplied key.
    Text(String),
}

impl Key {
    /// The kind of this key.
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Number(_) => KeyKind::Number,
            Self::Text(_) => KeyKind::Text,
        }
    }

    /// The numeric value, if this is a numeric key.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// The string value, if this is a text key.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// One `{ key, value }` entry of a table.
///
/// Untyped records (the default) carry a JSON document; [`Record::decode`]
/// turns one into a typed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<V = Value> {
    /// Primary key.
    pub key: Key,
    /// Stored value.
    pub value: V,
}

impl<V> Record<V> {
    /// Create a record.
    pub fn new(key: impl Into<Key>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Map the value, keeping the key.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Record<U> {
        Record {
            key: self.key,
            value: f(self.value),
        }
    }
}

impl Record {
    /// Build an untyped record from any serializable value.
    pub fn encode<T: Serialize>(key: impl Into<Key>, value: &T) -> Result<Self, MigrationError> {
        let value =
            serde_json::to_value(value).map_err(|e| MigrationError::Serialization(e.to_string()))?;
        Ok(Self::new(key, value))
    }

    /// Decode the value into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Record<T>, MigrationError> {
        let value = serde_json::from_value(self.value.clone())
            .map_err(|e| MigrationError::Deserialization(e.to_string()))?;
        Ok(Record {
            key: self.key.clone(),
            value,
        })
    }
}

/// Table name → ordered records.
///
/// This is the format every migration consumes and produces, and the format
/// a store is snapshotted into and replayed from during an upgrade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabularState {
    tables: BTreeMap<String, Vec<Record>>,
}

impl TabularState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a table's records, builder style.
    pub fn with_table(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert(name, records);
        self
    }

    /// Insert (or replace) a table's records.
    pub fn insert(&mut self, name: impl Into<String>, records: Vec<Record>) -> Option<Vec<Record>> {
        self.tables.insert(name.into(), records)
    }

    /// Insert a table from typed records.
    pub fn insert_typed<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        records: impl IntoIterator<Item = Record<T>>,
    ) -> Result<(), MigrationError> {
        let records = records
            .into_iter()
            .map(|r| Record::encode(r.key, &r.value))
            .collect::<Result<Vec<_>, _>>()?;
        self.tables.insert(name.into(), records);
        Ok(())
    }

    /// Records of a table, if present.
    pub fn table(&self, name: &str) -> Option<&[Record]> {
        self.tables.get(name).map(Vec::as_slice)
    }

    /// Remove a table and return its records (empty if absent).
    pub fn take(&mut self, name: &str) -> Vec<Record> {
        self.tables.remove(name).unwrap_or_default()
    }

    /// Decode every record of a table into `T`. An absent table decodes as empty.
    pub fn records_as<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<Record<T>>, MigrationError> {
        self.table(name)
            .unwrap_or_default()
            .iter()
            .map(Record::decode)
            .collect()
    }

    /// Whether a table is present (possibly with zero records).
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Names of all tables, in sorted order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether there are no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Total records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Iterate `(table, records)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl IntoIterator for TabularState {
    type Item = (String, Vec<Record>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<Record>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.into_iter()
    }
}

impl FromIterator<(String, Vec<Record>)> for TabularState {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Record>)>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}
