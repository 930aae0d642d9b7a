//! Group-by and aggregate expressions.
//!
//! A grouped query projects the group keys plus one reducer per output field.
//! The projected fields form a synthetic schema ([`GroupSchema`]) that the
//! post-aggregation filter is compiled against, so `HAVING`-style conditions
//! reference aggregate results by their output names.

use crate::error::{QueryError, Result};
use crate::schema::TypeClass;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    Sum,
    Min,
    Max,
    Avg,
    Any,
}

impl GroupOp {
    fn parse(name: &str) -> Result<GroupOp> {
        match name {
            "$sum" => Ok(GroupOp::Sum),
            "$min" => Ok(GroupOp::Min),
            "$max" => Ok(GroupOp::Max),
            "$avg" => Ok(GroupOp::Avg),
            "$any" => Ok(GroupOp::Any),
            other => Err(QueryError::InvalidExpression(format!(
                "unsupported aggregate operator {}",
                other
            ))),
        }
    }
}

impl fmt::Display for GroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupOp::Sum => write!(f, "$sum"),
            GroupOp::Min => write!(f, "$min"),
            GroupOp::Max => write!(f, "$max"),
            GroupOp::Avg => write!(f, "$avg"),
            GroupOp::Any => write!(f, "$any"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSource {
    /// The literal `1`: one per row
    Count,
    Column(String),
}

/// One reducer, e.g. `{ "$sum": "$price" }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupExpr {
    pub op: GroupOp,
    pub source: GroupSource,
}

impl GroupExpr {
    pub fn count() -> Self {
        Self {
            op: GroupOp::Sum,
            source: GroupSource::Count,
        }
    }

    pub fn new(op: GroupOp, column: impl Into<String>) -> Self {
        Self {
            op,
            source: GroupSource::Column(column.into()),
        }
    }

    pub fn from_json(value: &Value) -> Result<GroupExpr> {
        let map = value.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
            QueryError::InvalidExpression(format!(
                "aggregate must be a single-operator object, got {}",
                value
            ))
        })?;
        let (name, source) = map.iter().next().ok_or_else(|| {
            QueryError::InvalidExpression("empty aggregate expression".to_string())
        })?;
        let op = GroupOp::parse(name)?;

        let source = match source {
            Value::Number(n) if n.as_f64() == Some(1.0) && op == GroupOp::Sum => GroupSource::Count,
            Value::String(s) => match s.strip_prefix('$') {
                Some(column) if !column.is_empty() => GroupSource::Column(column.to_string()),
                _ => {
                    return Err(QueryError::InvalidExpression(format!(
                        "{} expects '$column', got '{}'",
                        op, s
                    )))
                }
            },
            other => {
                return Err(QueryError::InvalidExpression(format!(
                    "{} expects 1 or '$column', got {}",
                    op, other
                )))
            }
        };

        Ok(GroupExpr { op, source })
    }

    /// Output type of the reducer given the type of its source column
    pub fn output_type(&self, source_type: Option<TypeClass>) -> TypeClass {
        match (&self.source, self.op) {
            (GroupSource::Count, _) => TypeClass::Integer,
            (_, GroupOp::Sum | GroupOp::Avg) => TypeClass::Number,
            (_, _) => source_type.unwrap_or(TypeClass::Number),
        }
    }
}

/// Parse `{ "total": { "$sum": "$price" }, ... }` into ordered fields
pub fn parse_group_fields(value: &Value) -> Result<Vec<(String, GroupExpr)>> {
    let map = value.as_object().ok_or_else(|| {
        QueryError::InvalidExpression(format!("group fields must be an object, got {}", value))
    })?;
    map.iter()
        .map(|(name, expr)| Ok((name.clone(), GroupExpr::from_json(expr)?)))
        .collect()
}

/// Group keys; empty means one aggregate row over everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupBy(pub Vec<String>);

impl GroupBy {
    pub fn none() -> Self {
        GroupBy(Vec::new())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn is_total(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for GroupBy {
    fn from(columns: &str) -> Self {
        GroupBy(columns.split_whitespace().map(String::from).collect())
    }
}

impl From<Option<&str>> for GroupBy {
    fn from(columns: Option<&str>) -> Self {
        columns.map(GroupBy::from).unwrap_or_default()
    }
}

impl From<Vec<&str>> for GroupBy {
    fn from(columns: Vec<&str>) -> Self {
        GroupBy(columns.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for GroupBy {
    fn from(columns: Vec<String>) -> Self {
        GroupBy(columns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupFieldSource {
    Key(String),
    Aggregate(GroupExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupField {
    pub name: String,
    /// Column alias used in projections
    pub alias: String,
    pub type_class: TypeClass,
    pub source: GroupFieldSource,
}

/// Synthetic schema made of group keys and aggregate outputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSchema {
    pub fields: Vec<GroupField>,
}

impl GroupSchema {
    /// Build the schema; `resolve_type` looks a source column up in the
    /// queried model and fails with `UnknownColumn`.
    pub fn build(
        group_by: &GroupBy,
        fields: &[(String, GroupExpr)],
        resolve_type: impl Fn(&str) -> Result<TypeClass>,
    ) -> Result<GroupSchema> {
        let mut out = Vec::with_capacity(group_by.0.len() + fields.len());

        for key in &group_by.0 {
            out.push(GroupField {
                name: key.clone(),
                alias: key.replace('.', "_"),
                type_class: resolve_type(key)?,
                source: GroupFieldSource::Key(key.clone()),
            });
        }

        for (name, expr) in fields {
            let source_type = match &expr.source {
                GroupSource::Count => None,
                GroupSource::Column(column) => Some(resolve_type(column)?),
            };
            out.push(GroupField {
                name: name.clone(),
                alias: name.clone(),
                type_class: expr.output_type(source_type),
                source: GroupFieldSource::Aggregate(expr.clone()),
            });
        }

        Ok(GroupSchema { fields: out })
    }

    pub fn get(&self, name: &str) -> Option<&GroupField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn by_alias(&self, alias: &str) -> Option<&GroupField> {
        self.fields.iter().find(|f| f.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_group_expr() {
        assert_eq!(GroupExpr::from_json(&json!({ "$sum": 1 })).unwrap(), GroupExpr::count());
        assert_eq!(
            GroupExpr::from_json(&json!({ "$avg": "$price" })).unwrap(),
            GroupExpr::new(GroupOp::Avg, "price")
        );
    }

    #[test]
    fn test_parse_group_expr_errors() {
        for bad in [
            json!({ "$count": 1 }),
            json!({ "$sum": "price" }),
            json!({ "$max": 1 }),
            json!({ "$sum": 2 }),
            json!({ "$sum": 1, "$max": "$a" }),
            json!("$price"),
        ] {
            assert!(
                matches!(GroupExpr::from_json(&bad), Err(QueryError::InvalidExpression(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_group_by_forms() {
        assert!(GroupBy::from(None).is_total());
        assert_eq!(GroupBy::from("customer").columns(), ["customer"]);
        assert_eq!(GroupBy::from("customer  region").columns(), ["customer", "region"]);
        assert_eq!(GroupBy::from(vec!["a", "b"]).columns(), ["a", "b"]);
    }

    #[test]
    fn test_group_schema_types() {
        let fields = parse_group_fields(&json!({
            "count": { "$sum": 1 },
            "top": { "$max": "$price" },
            "total": { "$sum": "$price" },
        }))
        .unwrap();

        let schema = GroupSchema::build(&GroupBy::from("customer"), &fields, |c| match c {
            "customer" => Ok(TypeClass::String),
            "price" => Ok(TypeClass::Integer),
            other => Err(QueryError::UnknownColumn(other.to_string())),
        })
        .unwrap();

        assert_eq!(schema.fields.len(), 4);
        assert_eq!(schema.get("customer").unwrap().type_class, TypeClass::String);
        assert_eq!(schema.get("count").unwrap().type_class, TypeClass::Integer);
        assert_eq!(schema.get("top").unwrap().type_class, TypeClass::Integer);
        assert_eq!(schema.get("total").unwrap().type_class, TypeClass::Number);
    }

    #[test]
    fn test_group_schema_unknown_column() {
        let fields = vec![("total".to_string(), GroupExpr::new(GroupOp::Sum, "missing"))];
        let result = GroupSchema::build(&GroupBy::none(), &fields, |c| {
            Err(QueryError::UnknownColumn(c.to_string()))
        });
        assert!(matches!(result, Err(QueryError::UnknownColumn(_))));
    }
}
