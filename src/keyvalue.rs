//! Key-value compilation.
//!
//! A key-value store can only address records by key, so the only filters
//! it accepts are id equality and id membership, combined with AND/OR.
//! Ordering, windowing and projection are applied in memory after the
//! records are fetched.

use crate::backend::Record;
use crate::condition::{ColumnTest, Condition};
use crate::error::{QueryError, Result};
use crate::query::QueryOptions;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Set of every table holding records
pub const TABLES_KEY: &str = "_tables";

/// Which records of a table a condition addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    All,
    Ids(BTreeSet<String>),
}

impl KeySelection {
    fn intersect(self, other: KeySelection) -> KeySelection {
        match (self, other) {
            (KeySelection::All, other) | (other, KeySelection::All) => other,
            (KeySelection::Ids(a), KeySelection::Ids(b)) => KeySelection::Ids(a.intersection(&b).cloned().collect()),
        }
    }

    fn union(self, other: KeySelection) -> KeySelection {
        match (self, other) {
            (KeySelection::All, _) | (_, KeySelection::All) => KeySelection::All,
            (KeySelection::Ids(mut a), KeySelection::Ids(b)) => {
                a.extend(b);
                KeySelection::Ids(a)
            }
        }
    }
}

pub fn compile_selection(condition: &Condition) -> Result<KeySelection> {
    if condition.is_empty() {
        return Ok(KeySelection::All);
    }
    match condition {
        Condition::And(items) => items
            .iter()
            .filter(|c| !c.is_empty())
            .try_fold(KeySelection::All, |acc, c| Ok(acc.intersect(compile_selection(c)?))),
        Condition::Or(items) => {
            let mut selection = KeySelection::Ids(BTreeSet::new());
            for item in items.iter().filter(|c| !c.is_empty()) {
                selection = selection.union(compile_selection(item)?);
            }
            Ok(selection)
        }
        Condition::Column { path, test } if path == "id" => match test {
            ColumnTest::Eq(id) => Ok(KeySelection::Ids(BTreeSet::from([id_string(id)]))),
            ColumnTest::In(ids) => Ok(KeySelection::Ids(ids.iter().map(id_string).collect())),
            other => Err(QueryError::UnsupportedFeature(format!(
                "id test {:?} on a key-value store",
                other
            ))),
        },
        Condition::Column { path, .. } => Err(QueryError::UnsupportedFeature(format!(
            "filter on {} in a key-value store",
            path
        ))),
    }
}

/// Ids compare by their textual form
pub fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn record_key(table: &str, id: &str) -> String {
    format!("{}:{}", table, id)
}

/// Set of the ids stored for a table
pub fn ids_key(table: &str) -> String {
    format!("{}:_ids", table)
}

/// Counter generating ids for a table
pub fn sequence_key(table: &str) -> String {
    format!("{}:_seq", table)
}

/// Reject options a key-value store cannot honor
pub fn check_options(options: &QueryOptions) -> Result<()> {
    let unsupported = if options.group.is_some() || options.having.is_some() {
        Some("grouping")
    } else if !options.joins.is_empty() {
        Some("joins")
    } else if options.near.is_some() {
        Some("geo queries")
    } else {
        None
    };
    match unsupported {
        Some(feature) => Err(QueryError::UnsupportedFeature(format!("{} on a key-value store", feature))),
        None => Ok(()),
    }
}

/// Order, window and project fetched records
pub fn apply_options(mut records: Vec<Record>, options: &QueryOptions) -> Result<Vec<Record>> {
    check_options(options)?;

    if !options.orders.is_empty() {
        records.sort_by(|a, b| {
            options
                .orders
                .iter()
                .map(|order| {
                    let ordering = compare(a.get_path(&order.column), b.get_path(&order.column));
                    if order.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    let offset = options.offset.unwrap_or(0) as usize;
    let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let window = records.into_iter().skip(offset).take(limit);

    Ok(match &options.select {
        Some(paths) => window
            .map(|record| {
                let mut projected = Record::new();
                if let Some(id) = record.id() {
                    projected.insert("id".to_string(), id.clone());
                }
                for path in paths {
                    if let Some(value) = record.get_path(path) {
                        projected.set_path(path, value.clone());
                    }
                }
                projected
            })
            .collect(),
        None => window.collect(),
    })
}

/// Missing and null sort first
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.filter(|v| !v.is_null()), b.filter(|v| !v.is_null())) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::OrderSpec;
    use serde_json::json;

    fn ids(values: &[&str]) -> KeySelection {
        KeySelection::Ids(values.iter().map(|s| s.to_string()).collect())
    }

    fn selection(condition: Value) -> Result<KeySelection> {
        compile_selection(&Condition::from_json(&condition).unwrap())
    }

    #[test]
    fn test_id_selection() {
        assert_eq!(selection(json!({})).unwrap(), KeySelection::All);
        assert_eq!(selection(json!({ "id": 3 })).unwrap(), ids(&["3"]));
        assert_eq!(selection(json!({ "id": ["a", "b"] })).unwrap(), ids(&["a", "b"]));
        assert_eq!(selection(json!({ "id": [] })).unwrap(), ids(&[]));
        assert_eq!(
            selection(json!({ "$or": [{ "id": "a" }, { "id": "b" }] })).unwrap(),
            ids(&["a", "b"])
        );
        assert_eq!(
            selection(json!({ "$and": [{ "id": ["a", "b"] }, { "id": "b" }] })).unwrap(),
            ids(&["b"])
        );
    }

    #[test]
    fn test_other_filters_unsupported() {
        assert!(matches!(
            selection(json!({ "name": "x" })),
            Err(QueryError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            selection(json!({ "id": { "$gt": 3 } })),
            Err(QueryError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_keys() {
        assert_eq!(record_key("users", "7"), "users:7");
        assert_eq!(ids_key("users"), "users:_ids");
        assert_eq!(sequence_key("users"), "users:_seq");
    }

    #[test]
    fn test_apply_options() {
        let records: Vec<Record> = [
            json!({ "id": 1, "name": "b", "score": 3 }),
            json!({ "id": 2, "name": "a", "score": 3 }),
            json!({ "id": 3, "name": "c" }),
        ]
        .into_iter()
        .map(|v| Record::from_value(v).unwrap())
        .collect();

        let options = QueryOptions {
            orders: OrderSpec::parse("-score name"),
            limit: Some(2),
            select: Some(vec!["name".to_string()]),
            ..Default::default()
        };
        let out = apply_options(records, &options).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get_string("name"), Some("a".to_string()));
        assert_eq!(out[1].get_i64("id"), Some(1));
        assert!(!out[0].contains("score"));
    }
}
