//! Introspected live database schema.
//!
//! Adapters fill a [`Schemas`] snapshot from the database catalog; the diff
//! engine compares it against the registered models. Maps are ordered so two
//! snapshots of the same database always iterate identically.

use crate::schema::TypeClass;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSnapshot {
    pub required: bool,
    pub type_class: Option<TypeClass>,
    /// Normalized, upper-cased type string as reported by the catalog
    pub adapter_type_string: String,
    pub description: Option<String>,
}

impl ColumnSnapshot {
    pub fn new(adapter_type_string: impl Into<String>, required: bool) -> Self {
        Self {
            required,
            type_class: None,
            adapter_type_string: adapter_type_string.into().to_uppercase(),
            description: None,
        }
    }

    pub fn with_type_class(mut self, type_class: TypeClass) -> Self {
        self.type_class = Some(type_class);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Columns of one live table, keyed by storage name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemasTable {
    pub columns: BTreeMap<String, ColumnSnapshot>,
    pub description: Option<String>,
}

impl SchemasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, column: ColumnSnapshot) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TableSnapshot {
    /// The store keeps no structural metadata (document stores)
    NoSchema,
    Columns(SchemasTable),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSnapshot {
    /// Storage column names, in index order
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schemas {
    pub tables: BTreeMap<String, TableSnapshot>,
    /// table → index name → index
    pub indexes: BTreeMap<String, BTreeMap<String, IndexSnapshot>>,
    /// table → column → referenced table
    pub foreign_keys: BTreeMap<String, BTreeMap<String, String>>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: SchemasTable) -> Self {
        self.tables.insert(name.into(), TableSnapshot::Columns(table));
        self
    }

    pub fn with_schemaless_table(mut self, name: impl Into<String>) -> Self {
        self.tables.insert(name.into(), TableSnapshot::NoSchema);
        self
    }

    pub fn with_index(
        mut self,
        table: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<impl Into<String>>,
        unique: bool,
    ) -> Self {
        self.indexes.entry(table.into()).or_default().insert(
            name.into(),
            IndexSnapshot {
                columns: columns.into_iter().map(|c| c.into()).collect(),
                unique,
            },
        );
        self
    }

    pub fn with_foreign_key(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        self.foreign_keys
            .entry(table.into())
            .or_default()
            .insert(column.into(), referenced.into());
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    pub fn index(&self, table: &str, name: &str) -> Option<&IndexSnapshot> {
        self.indexes.get(table).and_then(|t| t.get(name))
    }

    pub fn foreign_key(&self, table: &str, column: &str) -> Option<&String> {
        self.foreign_keys.get(table).and_then(|t| t.get(column))
    }
}
