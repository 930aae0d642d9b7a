//! The condition DSL.
//!
//! Conditions arrive as MongoDB-style JSON and are parsed once into the typed
//! [`Condition`] tree; every backend compiler works on the tree, never on raw
//! JSON.
//!
//! ```text
//! [A, B]                       implicit AND
//! { "$and": [..] }             AND   (any key starting with "$and")
//! { "$or": [..] }              OR    (any key starting with "$or")
//! { "a": 1, "b": 2 }           implicit AND across columns
//! { "a": [1, 2] }              membership
//! { "a": { "$gte": 10 } }      operator
//! { "a": { "b": 1 } }          nested column `a.b`
//! { "a": { "$regex": "^x" } }  regular expression literal
//! ```

use crate::error::{QueryError, Result};
use crate::value::Pattern;
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl CompareOp {
    pub fn mongo(&self) -> &'static str {
        match self {
            CompareOp::Eq => "$eq",
            CompareOp::Ne => "$ne",
            CompareOp::Gt => "$gt",
            CompareOp::Lt => "$lt",
            CompareOp::Gte => "$gte",
            CompareOp::Lte => "$lte",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "="),
            CompareOp::Ne => write!(f, "<>"),
            CompareOp::Gt => write!(f, ">"),
            CompareOp::Lt => write!(f, "<"),
            CompareOp::Gte => write!(f, ">="),
            CompareOp::Lte => write!(f, "<="),
        }
    }
}

/// Test applied to a single column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnTest {
    Eq(Value),
    Null,
    In(Vec<Value>),
    Not(Box<ColumnTest>),
    /// Ordering comparison against a literal
    Compare(CompareOp, Value),
    /// Comparison against another column of the same row
    ColumnCompare(CompareOp, String),
    Contains(Vec<String>),
    StartsWith(Vec<String>),
    EndsWith(Vec<String>),
    Regex(Pattern),
    /// Several operators on one column, all of which must hold
    All(Vec<ColumnTest>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Column { path: String, test: ColumnTest },
}

impl Condition {
    pub fn and(conditions: Vec<Condition>) -> Condition {
        Condition::And(conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Condition {
        Condition::Or(conditions)
    }

    pub fn test(path: impl Into<String>, test: ColumnTest) -> Condition {
        Condition::Column {
            path: path.into(),
            test,
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Condition {
        let value = value.into();
        let test = if value.is_null() {
            ColumnTest::Null
        } else {
            ColumnTest::Eq(value)
        };
        Condition::test(path, test)
    }

    pub fn empty() -> Condition {
        Condition::And(Vec::new())
    }

    /// True when the condition filters nothing
    pub fn is_empty(&self) -> bool {
        match self {
            Condition::And(items) | Condition::Or(items) => items.iter().all(|c| c.is_empty()),
            Condition::Column { .. } => false,
        }
    }

    /// Parse the JSON spelling of the DSL
    pub fn from_json(value: &Value) -> Result<Condition> {
        match value {
            Value::Array(items) => Ok(Condition::And(
                items.iter().map(Condition::from_json).collect::<Result<_>>()?,
            )),
            Value::Object(map) => {
                let mut parts = map
                    .iter()
                    .map(|(key, value)| parse_entry(key, value))
                    .collect::<Result<Vec<_>>>()?;
                if parts.len() == 1 {
                    Ok(parts.remove(0))
                } else {
                    Ok(Condition::And(parts))
                }
            }
            other => Err(QueryError::InvalidCondition(format!(
                "expected an object or array, got {}",
                other
            ))),
        }
    }

    /// Every column path referenced by the condition
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    /// Column values pinned by top-level equality tests
    pub fn equalities(&self) -> Vec<(&str, &Value)> {
        match self {
            Condition::And(items) => items.iter().flat_map(|c| c.equalities()).collect(),
            Condition::Column {
                path,
                test: ColumnTest::Eq(value),
            } => vec![(path.as_str(), value)],
            _ => Vec::new(),
        }
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::And(items) | Condition::Or(items) => {
                items.iter().for_each(|c| c.collect_paths(out))
            }
            Condition::Column { path, .. } => out.push(path),
        }
    }
}

impl TryFrom<Value> for Condition {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self> {
        Condition::from_json(&value)
    }
}

fn parse_entry(key: &str, value: &Value) -> Result<Condition> {
    if key.starts_with("$and") {
        return Ok(Condition::And(parse_list(key, value)?));
    }
    if key.starts_with("$or") {
        return Ok(Condition::Or(parse_list(key, value)?));
    }
    if key.starts_with('$') {
        return Err(QueryError::UnknownOperator(key.to_string()));
    }
    parse_column(key.to_string(), value)
}

fn parse_list(key: &str, value: &Value) -> Result<Vec<Condition>> {
    match value {
        Value::Array(items) => items.iter().map(Condition::from_json).collect(),
        Value::Object(_) => Ok(vec![Condition::from_json(value)?]),
        other => Err(QueryError::InvalidCondition(format!(
            "{} expects a list of conditions, got {}",
            key, other
        ))),
    }
}

fn parse_column(path: String, value: &Value) -> Result<Condition> {
    if let Value::Object(map) = value {
        let nested = !map.is_empty() && map.keys().all(|k| !k.starts_with('$'));
        if nested {
            let mut parts = map
                .iter()
                .map(|(key, value)| parse_column(format!("{}.{}", path, key), value))
                .collect::<Result<Vec<_>>>()?;
            return Ok(if parts.len() == 1 {
                parts.remove(0)
            } else {
                Condition::And(parts)
            });
        }
    }

    Ok(Condition::Column {
        test: parse_test(&path, value)?,
        path,
    })
}

fn parse_test(path: &str, value: &Value) -> Result<ColumnTest> {
    match value {
        Value::Null => Ok(ColumnTest::Null),
        Value::Array(items) => Ok(ColumnTest::In(items.clone())),
        Value::Object(map) => {
            if let Some(pattern) = parse_regex(map)? {
                return Ok(ColumnTest::Regex(pattern));
            }
            if map.is_empty() || map.keys().any(|k| !k.starts_with('$')) {
                return Err(QueryError::InvalidCondition(format!(
                    "column '{}' mixes operators and nested fields",
                    path
                )));
            }
            let mut tests = map
                .iter()
                .map(|(op, operand)| parse_operator(path, op, operand))
                .collect::<Result<Vec<_>>>()?;
            Ok(if tests.len() == 1 {
                tests.remove(0)
            } else {
                ColumnTest::All(tests)
            })
        }
        scalar => Ok(ColumnTest::Eq(scalar.clone())),
    }
}

fn parse_regex(map: &Map<String, Value>) -> Result<Option<Pattern>> {
    let Some(source) = map.get("$regex") else {
        return Ok(None);
    };
    let source = source.as_str().ok_or_else(|| {
        QueryError::InvalidCondition("$regex expects a string pattern".to_string())
    })?;
    if map.keys().any(|k| k != "$regex" && k != "$options") {
        return Err(QueryError::InvalidCondition(
            "$regex only accepts $options alongside it".to_string(),
        ));
    }
    let mut pattern = Pattern::new(source);
    if map
        .get("$options")
        .and_then(|o| o.as_str())
        .is_some_and(|o| o.contains('i'))
    {
        pattern = pattern.insensitive();
    }
    Ok(Some(pattern))
}

fn parse_operator(path: &str, op: &str, operand: &Value) -> Result<ColumnTest> {
    match op {
        "$not" => Ok(ColumnTest::Not(Box::new(parse_test(path, operand)?))),
        "$in" => match operand {
            Value::Array(items) => Ok(ColumnTest::In(items.clone())),
            other => Ok(ColumnTest::In(vec![other.clone()])),
        },
        "$gt" => Ok(ColumnTest::Compare(CompareOp::Gt, operand.clone())),
        "$lt" => Ok(ColumnTest::Compare(CompareOp::Lt, operand.clone())),
        "$gte" => Ok(ColumnTest::Compare(CompareOp::Gte, operand.clone())),
        "$lte" => Ok(ColumnTest::Compare(CompareOp::Lte, operand.clone())),
        "$ceq" => column_compare(CompareOp::Eq, op, operand),
        "$cne" => column_compare(CompareOp::Ne, op, operand),
        "$cgt" => column_compare(CompareOp::Gt, op, operand),
        "$clt" => column_compare(CompareOp::Lt, op, operand),
        "$cgte" => column_compare(CompareOp::Gte, op, operand),
        "$clte" => column_compare(CompareOp::Lte, op, operand),
        "$contains" => Ok(ColumnTest::Contains(string_list(operand))),
        "$startswith" => Ok(ColumnTest::StartsWith(string_list(operand))),
        "$endswith" => Ok(ColumnTest::EndsWith(string_list(operand))),
        other => Err(QueryError::UnknownOperator(other.to_string())),
    }
}

fn column_compare(op: CompareOp, name: &str, operand: &Value) -> Result<ColumnTest> {
    match operand.as_str().and_then(|s| s.strip_prefix('$')) {
        Some(column) if !column.is_empty() => Ok(ColumnTest::ColumnCompare(op, column.to_string())),
        _ => Err(QueryError::InvalidExpression(format!(
            "{} expects a '$column' operand, got {}",
            name, operand
        ))),
    }
}

fn string_list(operand: &Value) -> Vec<String> {
    let as_string = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match operand {
        Value::Array(items) => items.iter().map(as_string).collect(),
        other => vec![as_string(other)],
    }
}
