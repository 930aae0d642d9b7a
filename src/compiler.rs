//! Condition and aggregate compilation for SQL backends.
//!
//! Column paths are resolved against a [`Scope`]: the queried table, its
//! joined tables (addressed as `Alias.column`) or, after grouping, the
//! synthetic schema of group keys and aggregate outputs. Literals are always
//! bound through a [`ParamSink`]; no user value is ever spliced into SQL text.

use crate::condition::{ColumnTest, Condition};
use crate::dialect::Dialect;
use crate::error::{QueryError, Result};
use crate::group::{GroupExpr, GroupFieldSource, GroupSchema, GroupSource};
use crate::schema::{ColumnProperty, ModelSchema, TypeClass};
use crate::value::{coerce, escape_like, Param};
use serde_json::Value;

/// Collects bound values and hands out placeholders in order
pub struct ParamSink<'d> {
    dialect: &'d dyn Dialect,
    params: Vec<Param>,
}

impl<'d> ParamSink<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    /// Nulls are rendered inline: an untyped NULL fits any column type
    pub fn push(&mut self, param: Param) -> String {
        if matches!(param, Param::Null | Param::InvalidDate) {
            return "NULL".to_string();
        }
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> Vec<Param> {
        self.params
    }
}

/// A column path resolved to an SQL expression
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub expr: String,
    pub type_class: TypeClass,
    pub array: bool,
}

/// A joined table visible to conditions as `Alias.column`
#[derive(Debug, Clone, Copy)]
pub struct JoinScope<'a> {
    pub alias: &'a str,
    pub model: &'a ModelSchema,
}

impl JoinScope<'_> {
    pub fn sql_alias(&self) -> String {
        format!("_{}", self.alias)
    }
}

/// The queried table plus whatever is joined to it
#[derive(Debug, Clone)]
pub struct TableScope<'a> {
    pub model: &'a ModelSchema,
    /// Set whenever joins are present, so base columns stay unambiguous
    pub alias: Option<&'a str>,
    pub joins: Vec<JoinScope<'a>>,
}

impl<'a> TableScope<'a> {
    pub fn new(model: &'a ModelSchema) -> Self {
        Self {
            model,
            alias: None,
            joins: Vec::new(),
        }
    }

    pub fn with_joins(model: &'a ModelSchema, joins: Vec<JoinScope<'a>>) -> Self {
        Self {
            model,
            alias: if joins.is_empty() { None } else { Some("_Base") },
            joins,
        }
    }

    pub fn column(&self, path: &str) -> Result<&'a ColumnProperty> {
        self.model
            .get(path)
            .ok_or_else(|| QueryError::UnknownColumn(path.to_string()))
    }

    pub fn resolve(&self, path: &str) -> Result<Resolved> {
        if let Some((head, rest)) = path.split_once('.') {
            if let Some(join) = self.joins.iter().find(|j| j.alias == head) {
                let column = join
                    .model
                    .get(rest)
                    .ok_or_else(|| QueryError::UnknownColumn(path.to_string()))?;
                return Ok(Resolved {
                    expr: format!("{}.{}", join.sql_alias(), column.dbname_us),
                    type_class: column.type_class,
                    array: column.array,
                });
            }
        }

        let column = self.column(path)?;
        Ok(Resolved {
            expr: self.qualify(&column.dbname_us),
            type_class: column.type_class,
            array: column.array,
        })
    }

    /// Prefix a base-table storage column with the base alias, if any
    pub fn qualify(&self, dbname: &str) -> String {
        match self.alias {
            Some(alias) => format!("{}.{}", alias, dbname),
            None => dbname.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Scope<'s, 'a> {
    Table(&'s TableScope<'a>),
    /// Post-aggregation: only group keys and aggregate outputs are visible
    Group {
        table: &'s TableScope<'a>,
        schema: &'s GroupSchema,
    },
}

pub struct SqlCompiler<'s, 'a> {
    dialect: &'s dyn Dialect,
    scope: Scope<'s, 'a>,
}

impl<'s, 'a> SqlCompiler<'s, 'a> {
    pub fn new(dialect: &'s dyn Dialect, scope: Scope<'s, 'a>) -> Self {
        Self { dialect, scope }
    }

    pub fn resolve(&self, path: &str) -> Result<Resolved> {
        match self.scope {
            Scope::Table(table) => table.resolve(path),
            Scope::Group { table, schema } => {
                let field = schema
                    .get(path)
                    .ok_or_else(|| QueryError::UnknownColumn(path.to_string()))?;
                let expr = match &field.source {
                    GroupFieldSource::Key(key) => table.resolve(key)?.expr,
                    GroupFieldSource::Aggregate(expr) => aggregate_sql(self.dialect, table, expr)?,
                };
                Ok(Resolved {
                    expr,
                    type_class: field.type_class,
                    array: false,
                })
            }
        }
    }

    /// Compile to a boolean SQL expression; `None` when nothing is filtered
    pub fn compile(&self, condition: &Condition, sink: &mut ParamSink<'_>) -> Result<Option<String>> {
        match condition {
            Condition::And(items) => self.join_all(items, "AND", sink),
            Condition::Or(items) => self.join_all(items, "OR", sink),
            Condition::Column { path, test } => {
                let column = self.resolve(path)?;
                Ok(Some(self.compile_test(&column, test, sink)?))
            }
        }
    }

    fn join_all(&self, items: &[Condition], op: &str, sink: &mut ParamSink<'_>) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            if let Some(sql) = self.compile(item, sink)? {
                parts.push(sql);
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(format!("({})", parts.join(&format!(" {} ", op)))),
        })
    }

    fn compile_test(&self, column: &Resolved, test: &ColumnTest, sink: &mut ParamSink<'_>) -> Result<String> {
        let expr = &column.expr;
        match test {
            ColumnTest::Eq(value) => {
                let placeholder = sink.push(self.literal(column, value));
                Ok(format!("{} = {}", expr, placeholder))
            }
            ColumnTest::Null => Ok(format!("{} IS NULL", expr)),
            ColumnTest::In(values) => {
                let (nulls, values): (Vec<&Value>, Vec<&Value>) = values.iter().partition(|v| v.is_null());
                if values.is_empty() {
                    return Ok(if nulls.is_empty() {
                        "1 = 0".to_string()
                    } else {
                        format!("{} IS NULL", expr)
                    });
                }
                let placeholders: Vec<String> = values
                    .into_iter()
                    .map(|v| sink.push(self.literal(column, v)))
                    .collect();
                let membership = format!("{} IN ({})", expr, placeholders.join(", "));
                Ok(if nulls.is_empty() {
                    membership
                } else {
                    format!("({} OR {} IS NULL)", membership, expr)
                })
            }
            ColumnTest::Not(inner) => match inner.as_ref() {
                ColumnTest::Null => Ok(format!("{} IS NOT NULL", expr)),
                inner => Ok(format!("NOT ({})", self.compile_test(column, inner, sink)?)),
            },
            ColumnTest::Compare(op, value) => {
                let placeholder = sink.push(self.literal(column, value));
                Ok(format!("{} {} {}", expr, op, placeholder))
            }
            ColumnTest::ColumnCompare(op, other) => {
                let other = self.resolve(other)?;
                Ok(format!("{} {} {}", expr, op, other.expr))
            }
            ColumnTest::Contains(values) => self.like_any(expr, values, |v| format!("%{}%", escape_like(v)), sink),
            ColumnTest::StartsWith(values) => self.like_any(expr, values, |v| format!("{}%", escape_like(v)), sink),
            ColumnTest::EndsWith(values) => self.like_any(expr, values, |v| format!("%{}", escape_like(v)), sink),
            ColumnTest::Regex(pattern) => {
                let pattern = pattern.forced_insensitive();
                let placeholder = sink.push(Param::Text(pattern.source.clone()));
                self.dialect
                    .regex(expr, &placeholder, pattern.case_insensitive)
                    .ok_or_else(|| {
                        QueryError::UnsupportedFeature(format!(
                            "regular expressions are not supported on {:?}",
                            self.dialect.kind()
                        ))
                    })
            }
            ColumnTest::All(tests) => {
                let parts = tests
                    .iter()
                    .map(|t| self.compile_test(column, t, sink))
                    .collect::<Result<Vec<_>>>()?;
                Ok(match parts.len() {
                    1 => parts.into_iter().next().unwrap_or_default(),
                    _ => format!("({})", parts.join(" AND ")),
                })
            }
        }
    }

    fn like_any(
        &self,
        expr: &str,
        values: &[String],
        pattern: impl Fn(&str) -> String,
        sink: &mut ParamSink<'_>,
    ) -> Result<String> {
        let parts: Vec<String> = values
            .iter()
            .map(|v| {
                let placeholder = sink.push(Param::Text(pattern(v)));
                self.dialect.like(expr, &placeholder)
            })
            .collect();
        Ok(match parts.len() {
            0 => "1 = 0".to_string(),
            1 => parts.into_iter().next().unwrap_or_default(),
            _ => format!("({})", parts.join(" OR ")),
        })
    }

    fn literal(&self, column: &Resolved, value: &Value) -> Param {
        if column.array {
            return Param::from_json(value);
        }
        coerce(column.type_class, value)
    }
}

/// SQL for one reducer over the table scope
pub fn aggregate_sql(dialect: &dyn Dialect, table: &TableScope<'_>, expr: &GroupExpr) -> Result<String> {
    match &expr.source {
        GroupSource::Count => Ok(dialect.aggregate(expr.op, None)),
        GroupSource::Column(path) => {
            let column = table.resolve(path)?;
            Ok(dialect.aggregate(expr.op, Some(&column.expr)))
        }
    }
}

/// Projection and `GROUP BY` list of a grouped query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupClause {
    pub select: Vec<String>,
    pub group_by: Vec<String>,
}

pub fn compile_group(dialect: &dyn Dialect, table: &TableScope<'_>, schema: &GroupSchema) -> Result<GroupClause> {
    let mut clause = GroupClause::default();
    for field in &schema.fields {
        match &field.source {
            GroupFieldSource::Key(path) => {
                let column = table.resolve(path)?;
                clause.select.push(format!("{} AS {}", column.expr, field.alias));
                clause.group_by.push(column.expr);
            }
            GroupFieldSource::Aggregate(expr) => {
                clause
                    .select
                    .push(format!("{} AS {}", aggregate_sql(dialect, table, expr)?, field.alias));
            }
        }
    }
    Ok(clause)
}
