use crate::error::{QueryError, Result};
use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Logical column types, independent of any backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeClass {
    String,
    Number,
    Boolean,
    Integer,
    BigInteger,
    Date,
    Object,
    Text,
    Blob,
    GeoPoint,
    Vector,
    RecordId,
}

impl TypeClass {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeClass::Number | TypeClass::Integer | TypeClass::BigInteger | TypeClass::RecordId
        )
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeClass::String => "string",
            TypeClass::Number => "number",
            TypeClass::Boolean => "boolean",
            TypeClass::Integer => "integer",
            TypeClass::BigInteger => "biginteger",
            TypeClass::Date => "date",
            TypeClass::Object => "object",
            TypeClass::Text => "text",
            TypeClass::Blob => "blob",
            TypeClass::GeoPoint => "geopoint",
            TypeClass::Vector => "vector",
            TypeClass::RecordId => "recordid",
        };
        write!(f, "{}", name)
    }
}

/// Normalized metadata of one (possibly nested) column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProperty {
    /// Logical dotted path, e.g. `address.city`
    pub name: String,
    pub type_class: TypeClass,
    pub array: bool,
    pub required: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub record_id: bool,
    /// VARCHAR length for strings, dimension for vectors
    pub size: Option<u32>,
    pub description: Option<String>,
    /// Storage column name, underscored (`address_city`)
    pub dbname_us: String,
    /// Storage column name, dotted (`address.city`)
    pub dbname_dot: String,
    pub parts: Vec<String>,
    /// Storage path segments, for backends with nested storage
    pub parts_db: Vec<String>,
}

impl ColumnProperty {
    pub fn new(path: impl Into<String>, type_class: TypeClass) -> Self {
        let name = path.into();
        let parts: Vec<String> = name.split('.').map(String::from).collect();

        Self {
            dbname_us: parts.join("_"),
            dbname_dot: name.clone(),
            parts_db: parts.clone(),
            parts,
            name,
            type_class,
            array: false,
            required: false,
            unique: false,
            primary_key: false,
            record_id: type_class == TypeClass::RecordId,
            size: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Store the column under a different physical name
    pub fn stored_as(mut self, storage: impl Into<String>) -> Self {
        let storage = storage.into();
        self.parts_db = storage.split('.').map(String::from).collect();
        self.dbname_us = self.parts_db.join("_");
        self.dbname_dot = storage;
        self
    }

    fn primary() -> Self {
        let mut id = ColumnProperty::new("id", TypeClass::Integer);
        id.primary_key = true;
        id.required = true;
        id
    }
}

/// Index declaration on logical column paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Empty until named; models fill in `{table}_{columns}`
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(columns: Vec<impl Into<String>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(|c| c.into()).collect();
        Self {
            name: String::new(),
            columns,
            unique: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// What happens to children when the referenced parent is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrity {
    Ignore,
    Restrict,
    Cascade,
    Nullify,
}

impl Integrity {
    pub fn on_delete_sql(&self) -> &'static str {
        match self {
            Integrity::Ignore => "NO ACTION",
            Integrity::Restrict => "RESTRICT",
            Integrity::Cascade => "CASCADE",
            Integrity::Nullify => "SET NULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Association {
    /// This model holds `foreign_key` referencing `target.id`
    BelongsTo {
        target: String,
        foreign_key: String,
        integrity: Integrity,
    },
    /// `target` holds `foreign_key` referencing this model's id
    HasMany { target: String, foreign_key: String },
}

/// Normalized schema of one model
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub name: String,
    pub table_name: String,
    pub description: Option<String>,
    columns: Vec<ColumnProperty>,
    pub indexes: Vec<IndexDef>,
    pub associations: Vec<Association>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table_name: tableize(&name),
            name,
            description: None,
            columns: Vec::new(),
            indexes: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a column; re-adding a path replaces the earlier definition
    pub fn column(mut self, property: ColumnProperty) -> Self {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == property.name) {
            *existing = property;
        } else {
            self.columns.push(property);
        }
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declare `self.{target}_id → target.id`
    pub fn belongs_to(self, target: &str, integrity: Integrity) -> Self {
        let foreign_key = foreign_key_for(target);
        let mut model = self.column(ColumnProperty::new(foreign_key.clone(), TypeClass::RecordId));
        model.associations.push(Association::BelongsTo {
            target: target.to_string(),
            foreign_key,
            integrity,
        });
        model
    }

    /// Declare `target.{self}_id → self.id`
    pub fn has_many(mut self, target: &str) -> Self {
        let foreign_key = foreign_key_for(&self.name);
        self.associations.push(Association::HasMany {
            target: target.to_string(),
            foreign_key,
        });
        self
    }

    pub fn get(&self, path: &str) -> Option<&ColumnProperty> {
        self.columns.iter().find(|c| c.name == path)
    }

    pub fn get_by_storage(&self, dbname: &str) -> Option<&ColumnProperty> {
        self.columns.iter().find(|c| c.dbname_us == dbname)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnProperty> {
        self.columns.iter()
    }

    /// Map a record's fields (nested objects allowed) onto columns, in
    /// declaration order; unknown fields fail with `UnknownColumn`.
    pub fn flatten<'a>(&self, data: &'a HashMap<String, Value>) -> Result<Vec<(&ColumnProperty, &'a Value)>> {
        let mut out = Vec::with_capacity(data.len());
        for (key, value) in data {
            self.flatten_into(key, value, &mut out)?;
        }
        out.sort_by_key(|(column, _)| self.position(&column.name));
        Ok(out)
    }

    fn flatten_into<'s, 'a>(
        &'s self,
        path: &str,
        value: &'a Value,
        out: &mut Vec<(&'s ColumnProperty, &'a Value)>,
    ) -> Result<()> {
        if let Some(column) = self.get(path) {
            out.push((column, value));
            return Ok(());
        }
        let prefix = format!("{}.", path);
        match value {
            Value::Object(map) if self.columns.iter().any(|c| c.name.starts_with(&prefix)) => {
                for (key, value) in map {
                    self.flatten_into(&format!("{}{}", prefix, key), value, out)?;
                }
                Ok(())
            }
            _ => Err(QueryError::UnknownColumn(format!("{}.{}", self.name, path))),
        }
    }

    fn position(&self, path: &str) -> usize {
        self.columns.iter().position(|c| c.name == path).unwrap_or(usize::MAX)
    }

    pub fn primary_key(&self) -> Option<&ColumnProperty> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Explicit indexes plus one unique index per unique column
    pub fn declared_indexes(&self) -> Vec<IndexDef> {
        let mut indexes = self.indexes.clone();
        for column in self.columns.iter().filter(|c| c.unique && !c.primary_key) {
            if !indexes.iter().any(|i| i.columns == [column.name.clone()]) {
                indexes.push(IndexDef::new(vec![column.name.clone()]).unique());
            }
        }
        for index in indexes.iter_mut().filter(|i| i.name.is_empty()) {
            let columns: Vec<String> = index.columns.iter().map(|c| c.replace('.', "_")).collect();
            index.name = format!("{}_{}", self.table_name, columns.join("_"));
        }
        indexes
    }

    pub fn belongs_to_targets(&self) -> impl Iterator<Item = (&str, &str, Integrity)> {
        self.associations.iter().filter_map(|a| match a {
            Association::BelongsTo {
                target,
                foreign_key,
                integrity,
            } => Some((target.as_str(), foreign_key.as_str(), *integrity)),
            Association::HasMany { .. } => None,
        })
    }
}

/// Registered models of one connection
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<ModelSchema>>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, adding the synthetic `id` primary key
    pub fn register(&mut self, mut model: ModelSchema) -> Result<Arc<ModelSchema>> {
        if self.by_name.contains_key(&model.name) {
            return Err(QueryError::Schema(format!(
                "Model {} already registered",
                model.name
            )));
        }

        match model.get("id") {
            Some(id) if !id.primary_key => {
                return Err(QueryError::Schema(format!(
                    "Model {} declares a non-primary 'id' column",
                    model.name
                )));
            }
            Some(_) => {}
            None => model.columns.insert(0, ColumnProperty::primary()),
        }

        if model.columns.iter().filter(|c| c.primary_key).count() != 1 {
            return Err(QueryError::Schema(format!(
                "Model {} must have exactly one primary key",
                model.name
            )));
        }

        let model = Arc::new(model);
        self.by_name.insert(model.name.clone(), self.models.len());
        self.models.push(model.clone());
        Ok(model)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelSchema>> {
        self.by_name
            .get(name)
            .map(|i| self.models[*i].clone())
            .ok_or_else(|| QueryError::ModelNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Models in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models holding a belongs-to reference to `target`
    pub fn children_of(&self, target: &str) -> Vec<(Arc<ModelSchema>, String, Integrity)> {
        self.models
            .iter()
            .flat_map(|m| {
                m.belongs_to_targets()
                    .filter(|(t, _, _)| *t == target)
                    .map(|(_, fk, integrity)| (m.clone(), fk.to_string(), integrity))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// `UserProfile` → `user_profiles`
pub fn tableize(model_name: &str) -> String {
    pluralize(&model_name.to_case(Case::Snake))
}

/// `UserProfile` → `user_profile_id`
pub fn foreign_key_for(model_name: &str) -> String {
    format!("{}_id", model_name.to_case(Case::Snake))
}

fn pluralize(word: &str) -> String {
    if word.ends_with('y') && !word.ends_with("ay") && !word.ends_with("ey") && !word.ends_with("oy") {
        format!("{}ies", &word[..word.len() - 1])
    } else if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}
