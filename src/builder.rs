use crate::compiler::{compile_group, JoinScope, ParamSink, Scope, SqlCompiler, TableScope};
use crate::condition::Condition;
use crate::dialect::{Dialect, InsertIdPosition};
use crate::error::{QueryError, Result};
use crate::group::GroupSchema;
use crate::query::QueryOptions;
use crate::schema::{ColumnProperty, ModelSchema, TypeClass};
use crate::value::{encode_write, Param};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// SQL text with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// SELECT query builder over already-compiled fragments
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    alias: Option<String>,
    columns: Vec<String>,
    joins: Vec<String>,
    where_clause: Option<String>,
    group_by: Vec<String>,
    having: Option<String>,
    order_by: Vec<String>,
    limit: Option<String>,
    distinct: bool,
}

impl SelectBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            columns: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            distinct: false,
        }
    }

    pub fn alias(mut self, alias: Option<&str>) -> Self {
        self.alias = alias.map(String::from);
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Add a complete join clause, e.g. `INNER JOIN users AS _User ON ...`
    pub fn join(mut self, clause: impl Into<String>) -> Self {
        self.joins.push(clause.into());
        self
    }

    pub fn where_clause(mut self, condition: Option<String>) -> Self {
        self.where_clause = condition;
        self
    }

    pub fn group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    pub fn having(mut self, condition: Option<String>) -> Self {
        self.having = condition;
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(format!("{} {}", expr.into(), direction));
        self
    }

    pub fn limit(mut self, clause: Option<String>) -> Self {
        self.limit = clause;
        self
    }

    pub fn build(self) -> String {
        let mut sql = String::from("SELECT ");

        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.columns.join(", "));
        }
        sql.push_str(&format!(" FROM {}", self.table));
        if let Some(alias) = &self.alias {
            sql.push_str(&format!(" AS {}", alias));
        }

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }

        if let Some(having) = &self.having {
            sql.push_str(" HAVING ");
            sql.push_str(having);
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }

        if let Some(limit) = &self.limit {
            sql.push(' ');
            sql.push_str(limit);
        }

        sql
    }
}

/// UPDATE query builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_values: Vec<String>,
    where_clause: Option<String>,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set_values: Vec::new(),
            where_clause: None,
        }
    }

    /// Add an assignment, e.g. `price = ?`
    pub fn set(mut self, assignment: impl Into<String>) -> Self {
        self.set_values.push(assignment.into());
        self
    }

    pub fn where_clause(mut self, condition: Option<String>) -> Self {
        self.where_clause = condition;
        self
    }

    pub fn build(self) -> Result<String> {
        if self.set_values.is_empty() {
            return Err(QueryError::Query("UPDATE must have at least one SET value".to_string()));
        }

        let mut sql = format!("UPDATE {} SET {}", self.table, self.set_values.join(", "));
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        Ok(sql)
    }
}

/// DELETE query builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Option<String>,
    order_by: Vec<String>,
    limit: Option<String>,
}

impl DeleteBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn where_clause(mut self, condition: Option<String>) -> Self {
        self.where_clause = condition;
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(format!("{} {}", expr.into(), direction));
        self
    }

    pub fn limit(mut self, clause: Option<String>) -> Self {
        self.limit = clause;
        self
    }

    pub fn build(self) -> String {
        let mut sql = format!("DELETE FROM {}", self.table);

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = &self.limit {
            sql.push(' ');
            sql.push_str(limit);
        }
        sql
    }
}

/// INSERT query builder for one or more rows
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    returning: Option<String>,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            returning: None,
        }
    }

    pub fn row(mut self, values: Vec<String>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    pub fn build(self) -> Result<String> {
        if self.rows.iter().any(|r| r.len() != self.columns.len()) {
            return Err(QueryError::Query("INSERT row width does not match its columns".to_string()));
        }
        let rows: Vec<String> = self.rows.iter().map(|r| format!("({})", r.join(", "))).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            self.columns.join(", "),
            rows.join(", ")
        );
        if let Some(column) = &self.returning {
            sql.push_str(&format!(" RETURNING {}", column));
        }
        Ok(sql)
    }
}

/// How the rows of a find come back
#[derive(Debug, Clone, PartialEq)]
pub enum RowShape {
    Model,
    Group(GroupSchema),
}

/// Plans SQL statements for one model
pub struct SqlPlanner<'a> {
    dialect: &'a dyn Dialect,
    model: &'a ModelSchema,
}

impl<'a> SqlPlanner<'a> {
    pub fn new(dialect: &'a dyn Dialect, model: &'a ModelSchema) -> Self {
        Self { dialect, model }
    }

    fn table_scope<'o>(&self, options: &'o QueryOptions) -> TableScope<'o>
    where
        'a: 'o,
    {
        let joins = options
            .joins
            .iter()
            .map(|j| JoinScope {
                alias: j.alias.as_str(),
                model: j.model.as_ref(),
            })
            .collect();
        TableScope::with_joins(self.model, joins)
    }

    fn join_clauses(&self, table: &TableScope<'_>, options: &QueryOptions) -> Vec<String> {
        options
            .joins
            .iter()
            .map(|join| {
                format!(
                    "{} {} AS _{} ON {} = _{}.{}",
                    join.kind,
                    join.model.table_name,
                    join.alias,
                    table.qualify(&join.base_column),
                    join.alias,
                    join.join_column
                )
            })
            .collect()
    }

    /// WHERE body: the condition plus any distance bound
    fn where_clause(
        &self,
        table: &TableScope<'_>,
        condition: &Condition,
        options: &QueryOptions,
        sink: &mut ParamSink<'_>,
    ) -> Result<Option<String>> {
        let mut parts = Vec::new();
        if let Some(sql) = SqlCompiler::new(self.dialect, Scope::Table(table)).compile(condition, sink)? {
            parts.push(sql);
        }
        if let Some(near) = &options.near {
            if let Some(max_distance) = near.max_distance {
                let distance = self.distance(table, near, sink)?;
                let bound = sink.push(Param::Float(max_distance));
                parts.push(format!("{} <= {}", distance, bound));
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(parts.join(" AND ")),
        })
    }

    fn distance(&self, table: &TableScope<'_>, near: &crate::query::NearSpec, sink: &mut ParamSink<'_>) -> Result<String> {
        let column = table.resolve(&near.column)?;
        let lng = sink.push(Param::Float(near.lng));
        let lat = sink.push(Param::Float(near.lat));
        self.dialect.distance(&column.expr, &lng, &lat).ok_or_else(|| {
            QueryError::UnsupportedFeature(format!("geo queries on {:?}", self.dialect.kind()))
        })
    }

    fn selected_columns(&self, options: &QueryOptions) -> Result<Vec<&'a ColumnProperty>> {
        match &options.select {
            None => Ok(self.model.columns().collect()),
            Some(paths) => {
                let mut columns: Vec<&ColumnProperty> = Vec::with_capacity(paths.len() + 1);
                for column in self.model.columns().filter(|c| c.primary_key) {
                    columns.push(column);
                }
                for path in paths {
                    let column = self
                        .model
                        .get(path)
                        .ok_or_else(|| QueryError::UnknownColumn(path.clone()))?;
                    if !columns.iter().any(|c| c.name == column.name) {
                        columns.push(column);
                    }
                }
                Ok(columns)
            }
        }
    }

    pub fn find(&self, condition: &Condition, options: &QueryOptions) -> Result<(Statement, RowShape)> {
        let table = self.table_scope(options);
        let mut sink = ParamSink::new(self.dialect);
        let mut select = SelectBuilder::new(&self.model.table_name)
            .alias(table.alias)
            .distinct(options.distinct);
        for join in self.join_clauses(&table, options) {
            select = select.join(join);
        }

        let group_schema = match &options.group {
            Some(group) => Some(GroupSchema::build(&group.by, &group.fields, |path| {
                table.resolve(path).map(|r| r.type_class)
            })?),
            None => None,
        };

        // projection
        match &group_schema {
            Some(schema) => {
                let clause = compile_group(self.dialect, &table, schema)?;
                select = select.columns(clause.select).group_by(clause.group_by);
            }
            None => {
                for column in self.selected_columns(options)? {
                    let expr = table.qualify(&column.dbname_us);
                    let projected = self.dialect.select_expr(column, &expr);
                    select = if projected == column.dbname_us {
                        select.column(projected)
                    } else {
                        select.column(format!("{} AS {}", projected, column.dbname_us))
                    };
                }
                if let Some(near) = &options.near {
                    let distance = self.distance(&table, near, &mut sink)?;
                    select = select.column(format!("{} AS {}_distance", distance, near.column.replace('.', "_")));
                }
            }
        }

        select = select.where_clause(self.where_clause(&table, condition, options, &mut sink)?);

        if let (Some(schema), Some(having)) = (&group_schema, &options.having) {
            let compiler = SqlCompiler::new(self.dialect, Scope::Group { table: &table, schema });
            select = select.having(compiler.compile(having, &mut sink)?);
        }

        // ordering
        if let Some(order) = &options.vector_order {
            let column = table.resolve(&order.column)?;
            let vector: Vec<Value> = order.vector.iter().map(|v| Value::from(*v)).collect();
            if self.dialect.capabilities().vector {
                let placeholder = sink.push(Param::Text(crate::value::vector_literal(&vector)));
                if let Some(expr) = self.dialect.vector_distance(&column.expr, order.op, &placeholder) {
                    select = select.order_by(expr, SortDirection::Asc);
                }
            } else {
                debug!("Ignoring vector order on {:?}", self.dialect.kind());
            }
        }
        for order in &options.orders {
            let expr = match &group_schema {
                Some(schema) => schema.get(&order.column).map(|f| f.alias.clone()),
                None => match &options.near {
                    Some(near) if order.column == format!("{}_distance", near.column) => {
                        Some(format!("{}_distance", near.column.replace('.', "_")))
                    }
                    _ => table.resolve(&order.column).ok().map(|r| r.expr),
                },
            };
            match expr {
                Some(expr) => {
                    let direction = if order.descending {
                        SortDirection::Desc
                    } else {
                        SortDirection::Asc
                    };
                    select = select.order_by(expr, direction);
                }
                None => debug!("Ignoring order on unknown column {}", order.column),
            }
        }
        if let (Some(near), None, true) = (&options.near, &group_schema, options.orders.is_empty()) {
            select = select.order_by(format!("{}_distance", near.column.replace('.', "_")), SortDirection::Asc);
        }

        select = select.limit(self.dialect.limit_clause(options.limit, options.offset));

        let shape = group_schema.map(RowShape::Group).unwrap_or(RowShape::Model);
        Ok((Statement::new(select.build(), sink.into_params()), shape))
    }

    pub fn count(&self, condition: &Condition, options: &QueryOptions) -> Result<Statement> {
        if options.is_grouped() {
            let inner_options = QueryOptions {
                orders: Vec::new(),
                limit: None,
                offset: None,
                ..options.clone()
            };
            let (inner, _) = self.find(condition, &inner_options)?;
            return Ok(Statement::new(
                format!("SELECT COUNT(*) AS count FROM ({}) AS _sub", inner.sql),
                inner.params,
            ));
        }

        let table = self.table_scope(options);
        let mut sink = ParamSink::new(self.dialect);
        let counted = if options.joins.is_empty() {
            "COUNT(*) AS count".to_string()
        } else {
            format!("COUNT(DISTINCT {}) AS count", table.qualify("id"))
        };
        let mut select = SelectBuilder::new(&self.model.table_name).alias(table.alias).column(counted);
        for join in self.join_clauses(&table, options) {
            select = select.join(join);
        }
        select = select.where_clause(self.where_clause(&table, condition, options, &mut sink)?);
        Ok(Statement::new(select.build(), sink.into_params()))
    }

    /// `SELECT id` of the rows a restricted write would touch
    fn id_subquery(&self, condition: &Condition, options: &QueryOptions, sink: &mut ParamSink<'_>) -> Result<String> {
        let table = self.table_scope(options);
        let mut select = SelectBuilder::new(&self.model.table_name)
            .alias(table.alias)
            .column(table.qualify("id"));
        for join in self.join_clauses(&table, options) {
            select = select.join(join);
        }
        select = select.where_clause(self.where_clause(&table, condition, options, sink)?);
        for order in &options.orders {
            if let Ok(column) = table.resolve(&order.column) {
                let direction = if order.descending {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                };
                select = select.order_by(column.expr, direction);
            }
        }
        select = select.limit(self.dialect.limit_clause(options.limit, options.offset));
        Ok(self.dialect.wrap_delete_subquery(select.build()))
    }

    pub fn delete(&self, condition: &Condition, options: &QueryOptions) -> Result<Statement> {
        let mut sink = ParamSink::new(self.dialect);
        let native = options.joins.is_empty()
            && (!options.restricts_rows() || self.dialect.supports_delete_order_limit(options.offset.is_some()));

        let sql = if native {
            let table = TableScope::new(self.model);
            let mut delete = DeleteBuilder::new(&self.model.table_name)
                .where_clause(self.where_clause(&table, condition, options, &mut sink)?);
            for order in &options.orders {
                if let Ok(column) = table.resolve(&order.column) {
                    let direction = if order.descending {
                        SortDirection::Desc
                    } else {
                        SortDirection::Asc
                    };
                    delete = delete.order_by(column.expr, direction);
                }
            }
            delete.limit(self.dialect.limit_clause(options.limit, None)).build()
        } else {
            let inner = self.id_subquery(condition, options, &mut sink)?;
            DeleteBuilder::new(&self.model.table_name)
                .where_clause(Some(format!("id IN ({})", inner)))
                .build()
        };
        Ok(Statement::new(sql, sink.into_params()))
    }

    /// Placeholder expression for a value written to `column`
    fn write_value(&self, column: &ColumnProperty, value: &Value, sink: &mut ParamSink<'_>) -> Result<String> {
        match column.type_class {
            TypeClass::GeoPoint if !value.is_null() => {
                let point = value.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    QueryError::Serialization(format!("{} expects [lng, lat], got {}", column.name, value))
                })?;
                let lng = sink.push(Param::from_json(&point[0]));
                let lat = sink.push(Param::from_json(&point[1]));
                self.dialect.point_value(&lng, &lat).ok_or_else(|| {
                    QueryError::UnsupportedFeature(format!("geo columns on {:?}", self.dialect.kind()))
                })
            }
            TypeClass::Vector if !value.is_null() => {
                let placeholder = sink.push(encode_write(column.type_class, false, value)?);
                Ok(self.dialect.vector_value(&placeholder))
            }
            _ => Ok(sink.push(encode_write(column.type_class, column.array, value)?)),
        }
    }

    pub fn update(&self, data: &HashMap<String, Value>, condition: &Condition, options: &QueryOptions) -> Result<Statement> {
        let mut sink = ParamSink::new(self.dialect);
        let mut update = UpdateBuilder::new(&self.model.table_name);

        for (column, value) in self.model.flatten(data)? {
            if column.primary_key {
                continue;
            }
            let increment = match value {
                Value::Object(map) if map.len() == 1 => map.get("$inc"),
                _ => None,
            };
            let assignment = match increment {
                Some(amount) => {
                    let placeholder = sink.push(Param::from_json(amount));
                    format!("{} = {} + {}", column.dbname_us, column.dbname_us, placeholder)
                }
                None => format!("{} = {}", column.dbname_us, self.write_value(column, value, &mut sink)?),
            };
            update = update.set(assignment);
        }

        let where_clause = if options.restricts_rows() || !options.joins.is_empty() {
            Some(format!("id IN ({})", self.id_subquery(condition, options, &mut sink)?))
        } else {
            self.where_clause(&TableScope::new(self.model), condition, options, &mut sink)?
        };
        let sql = update.where_clause(where_clause).build()?;
        Ok(Statement::new(sql, sink.into_params()))
    }

    pub fn insert(&self, data: &HashMap<String, Value>) -> Result<Statement> {
        self.insert_bulk(std::slice::from_ref(data))
    }

    pub fn insert_bulk(&self, rows: &[HashMap<String, Value>]) -> Result<Statement> {
        let flattened = rows
            .iter()
            .map(|row| self.model.flatten(row))
            .collect::<Result<Vec<_>>>()?;

        // union of written columns, in declaration order
        let columns: Vec<&ColumnProperty> = self
            .model
            .columns()
            .filter(|c| flattened.iter().any(|row| row.iter().any(|(col, _)| col.name == c.name)))
            .collect();

        if columns.is_empty() {
            if rows.len() != 1 {
                return Err(QueryError::Query("Bulk insert of empty records".to_string()));
            }
            let mut sql = self.dialect.empty_insert(&self.model.table_name);
            if self.dialect.insert_id_position() == InsertIdPosition::Returned {
                sql.push_str(" RETURNING id");
            }
            return Ok(Statement::raw(sql));
        }

        let mut sink = ParamSink::new(self.dialect);
        let mut insert = InsertBuilder::new(
            &self.model.table_name,
            columns.iter().map(|c| c.dbname_us.clone()).collect(),
        );
        for row in &flattened {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                let value = row
                    .iter()
                    .find(|(c, _)| c.name == column.name)
                    .map(|(_, v)| *v)
                    .unwrap_or(&Value::Null);
                values.push(self.write_value(column, value, &mut sink)?);
            }
            insert = insert.row(values);
        }
        if self.dialect.insert_id_position() == InsertIdPosition::Returned {
            insert = insert.returning("id");
        }
        Ok(Statement::new(insert.build()?, sink.into_params()))
    }
}
