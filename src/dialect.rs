//! SQL dialects.
//!
//! Every SQL backend shares one compiler; the differences between engines are
//! confined to this trait. Defaults render ANSI-ish SQL and each engine
//! overrides what it does differently.

use crate::adapter::{AdapterKind, Capabilities};
use crate::error::{QueryError, Result};
use crate::group::GroupOp;
use crate::query::VectorOp;
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelSchema, TypeClass};
use crate::transaction::IsolationLevel;
use std::fmt;

/// Which end of a multi-row insert the reported insert id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertIdPosition {
    First,
    Last,
    /// Ids come back through `RETURNING`
    Returned,
}

pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> AdapterKind;

    fn capabilities(&self) -> Capabilities;

    /// Placeholder for the `index`-th parameter (1-based)
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// DDL type of a column, without nullability
    fn column_type(&self, column: &ColumnProperty) -> Result<String>;

    /// Type string as the catalog reports it after creation
    fn adapter_type_string(&self, column: &ColumnProperty) -> Result<String> {
        Ok(self.column_type(column)?.to_uppercase())
    }

    /// Normalize a type string read from the catalog
    fn normalize_type_string(&self, raw: &str) -> String {
        raw.trim().to_uppercase()
    }

    fn primary_key_definition(&self) -> &'static str {
        "id INTEGER PRIMARY KEY"
    }

    /// Render a LIKE test, `pattern` being an already-escaped placeholder operand
    fn like(&self, expr: &str, placeholder: &str) -> String {
        format!("{} LIKE {} ESCAPE '\\'", expr, placeholder)
    }

    /// Render a regular-expression test, if the engine has one
    fn regex(&self, _expr: &str, _placeholder: &str, _case_insensitive: bool) -> Option<String> {
        None
    }

    /// Render the reducer of a grouped query; `expr` is `None` for the row count
    fn aggregate(&self, op: GroupOp, expr: Option<&str>) -> String {
        match (op, expr) {
            (_, None) => "COUNT(*)".to_string(),
            (GroupOp::Sum, Some(e)) => format!("SUM({})", e),
            (GroupOp::Avg, Some(e)) => format!("AVG({})", e),
            (GroupOp::Min, Some(e)) | (GroupOp::Any, Some(e)) => format!("MIN({})", e),
            (GroupOp::Max, Some(e)) => format!("MAX({})", e),
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            (None, Some(o)) => Some(format!("OFFSET {}", o)),
            (None, None) => None,
        }
    }

    /// Whether `DELETE ... ORDER BY ... LIMIT` runs natively
    fn supports_delete_order_limit(&self, _has_offset: bool) -> bool {
        false
    }

    /// Wrap the id subquery of a nested delete
    fn wrap_delete_subquery(&self, inner: String) -> String {
        inner
    }

    /// Great-circle distance in meters between a column and a point
    fn distance(&self, _expr: &str, _lng: &str, _lat: &str) -> Option<String> {
        None
    }

    /// Value expression used when writing a point
    fn point_value(&self, _lng: &str, _lat: &str) -> Option<String> {
        None
    }

    /// Projection expression for a stored column
    fn select_expr(&self, _column: &ColumnProperty, expr: &str) -> String {
        expr.to_string()
    }

    fn vector_distance(&self, _expr: &str, _op: VectorOp, _placeholder: &str) -> Option<String> {
        None
    }

    /// Value expression used when writing a vector
    fn vector_value(&self, placeholder: &str) -> String {
        placeholder.to_string()
    }

    fn insert_id_position(&self) -> InsertIdPosition {
        InsertIdPosition::Last
    }

    fn empty_insert(&self, table: &str) -> String {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    }

    fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        match isolation {
            Some(level) => vec![format!("BEGIN TRANSACTION ISOLATION LEVEL {}", level)],
            None => vec!["BEGIN".to_string()],
        }
    }

    /// `CREATE TABLE` plus any follow-up statements (comments)
    fn create_table_sql(&self, model: &ModelSchema, targets: &[(String, String, Integrity)]) -> Result<Vec<String>> {
        let mut definitions = vec![self.primary_key_definition().to_string()];
        for column in model.columns().filter(|c| !c.primary_key) {
            let mut definition = format!("{} {}", column.dbname_us, self.column_type(column)?);
            if column.required {
                definition.push_str(" NOT NULL");
            }
            if let Some(comment) = self.inline_column_comment(column) {
                definition.push_str(&comment);
            }
            definitions.push(definition);
        }
        if self.capabilities().native_integrity {
            for (column, target_table, integrity) in targets {
                if *integrity != Integrity::Ignore {
                    definitions.push(format!(
                        "FOREIGN KEY ({}) REFERENCES {}(id) ON DELETE {}",
                        column,
                        target_table,
                        integrity.on_delete_sql()
                    ));
                }
            }
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({}){}",
            model.table_name,
            definitions.join(", "),
            self.table_options(model)
        )];
        statements.extend(self.comment_statements(model));
        Ok(statements)
    }

    /// Suffix after the column list of `CREATE TABLE`
    fn table_options(&self, _model: &ModelSchema) -> String {
        String::new()
    }

    fn inline_column_comment(&self, _column: &ColumnProperty) -> Option<String> {
        None
    }

    /// Description statements issued after table creation
    fn comment_statements(&self, _model: &ModelSchema) -> Vec<String> {
        Vec::new()
    }

    /// New columns are always nullable; a required flag shows up later as drift
    fn add_column_sql(&self, table: &str, column: &ColumnProperty) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table,
            column.dbname_us,
            self.column_type(column)?
        ))
    }

    fn alter_column_sql(&self, _table: &str, _column: &ColumnProperty) -> Result<Option<String>> {
        Ok(None)
    }

    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", table, column)
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", table)
    }

    fn create_index_sql(&self, model: &ModelSchema, index: &IndexDef) -> Result<String> {
        let columns = index
            .columns
            .iter()
            .map(|path| {
                model
                    .get(path)
                    .map(|c| c.dbname_us.clone())
                    .ok_or_else(|| QueryError::UnknownColumn(format!("{}.{}", model.name, path)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            index.name,
            model.table_name,
            columns.join(", ")
        ))
    }

    fn drop_index_sql(&self, _table: &str, index: &str) -> String {
        format!("DROP INDEX {}", index)
    }

    fn add_foreign_key_sql(&self, table: &str, column: &str, target_table: &str, integrity: Integrity) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT fk_{}_{} FOREIGN KEY ({}) REFERENCES {}(id) ON DELETE {}",
            table,
            table,
            column,
            column,
            target_table,
            integrity.on_delete_sql()
        )
    }

    fn table_description_sql(&self, _model: &ModelSchema) -> Option<String> {
        None
    }

    fn column_description_sql(&self, _table: &str, _column: &ColumnProperty) -> Result<Option<String>> {
        Ok(None)
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn unsupported_type(dialect: &str, column: &ColumnProperty) -> QueryError {
    QueryError::UnsupportedFeature(format!(
        "{} columns are not supported on {} ({})",
        column.type_class, dialect, column.name
    ))
}

/// Plain SQL for engines without a dedicated dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericSqlDialect;

impl Dialect for GenericSqlDialect {
    fn kind(&self) -> AdapterKind {
        AdapterKind::GenericSql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_integrity: true,
            group_by: true,
            joins: true,
            ..Capabilities::default()
        }
    }

    fn column_type(&self, column: &ColumnProperty) -> Result<String> {
        if column.array {
            return Ok("TEXT".to_string());
        }
        Ok(match column.type_class {
            TypeClass::String => format!("VARCHAR({})", column.size.unwrap_or(255)),
            TypeClass::Number => "DOUBLE PRECISION".to_string(),
            TypeClass::Integer | TypeClass::RecordId => "INTEGER".to_string(),
            TypeClass::BigInteger => "BIGINT".to_string(),
            TypeClass::Boolean => "BOOLEAN".to_string(),
            TypeClass::Date => "TIMESTAMP".to_string(),
            TypeClass::Object | TypeClass::Text => "TEXT".to_string(),
            TypeClass::Blob => "BLOB".to_string(),
            TypeClass::GeoPoint | TypeClass::Vector => return Err(unsupported_type("generic SQL", column)),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            group_by: true,
            joins: true,
            ..Capabilities::default()
        }
    }

    fn column_type(&self, column: &ColumnProperty) -> Result<String> {
        if column.array {
            return Ok("TEXT".to_string());
        }
        Ok(match column.type_class {
            TypeClass::String | TypeClass::Text | TypeClass::Object => "TEXT".to_string(),
            TypeClass::Number => "REAL".to_string(),
            // epoch milliseconds
            TypeClass::Date => "REAL".to_string(),
            TypeClass::Integer | TypeClass::BigInteger | TypeClass::RecordId => "INTEGER".to_string(),
            TypeClass::Boolean => "TINYINT".to_string(),
            TypeClass::Blob => "BLOB".to_string(),
            TypeClass::GeoPoint | TypeClass::Vector => return Err(unsupported_type("SQLite", column)),
        })
    }

    fn primary_key_definition(&self) -> &'static str {
        "id INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, Some(o)) => Some(format!("LIMIT -1 OFFSET {}", o)),
            (limit, offset) => GenericSqlDialect.limit_clause(limit, offset),
        }
    }

    fn begin_statements(&self, _isolation: Option<IsolationLevel>) -> Vec<String> {
        // serializable regardless of the requested level
        vec!["BEGIN IMMEDIATE".to_string()]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Postgres
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_integrity: true,
            geo: false,
            vector: true,
            regex: true,
            descriptions: true,
            group_by: true,
            joins: true,
        }
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn column_type(&self, column: &ColumnProperty) -> Result<String> {
        if column.array && column.type_class != TypeClass::Vector {
            return Ok("JSONB".to_string());
        }
        Ok(match column.type_class {
            TypeClass::String => format!("VARCHAR({})", column.size.unwrap_or(255)),
            TypeClass::Number => "DOUBLE PRECISION".to_string(),
            TypeClass::Integer | TypeClass::RecordId => "INTEGER".to_string(),
            TypeClass::BigInteger => "BIGINT".to_string(),
            TypeClass::Boolean => "BOOLEAN".to_string(),
            TypeClass::Date => "TIMESTAMP WITHOUT TIME ZONE".to_string(),
            TypeClass::Object => "JSONB".to_string(),
            TypeClass::Text => "TEXT".to_string(),
            TypeClass::Blob => "BYTEA".to_string(),
            TypeClass::Vector => match column.size {
                Some(dimension) => format!("VECTOR({})", dimension),
                None => "VECTOR".to_string(),
            },
            TypeClass::GeoPoint => return Err(unsupported_type("PostgreSQL", column)),
        })
    }

    fn adapter_type_string(&self, column: &ColumnProperty) -> Result<String> {
        if column.array && column.type_class != TypeClass::Vector {
            return Ok("JSONB".to_string());
        }
        Ok(match column.type_class {
            TypeClass::String => "CHARACTER VARYING".to_string(),
            TypeClass::Vector => "VECTOR".to_string(),
            _ => self.column_type(column)?.to_uppercase(),
        })
    }

    fn primary_key_definition(&self) -> &'static str {
        "id SERIAL PRIMARY KEY"
    }

    fn like(&self, expr: &str, placeholder: &str) -> String {
        format!("{} ILIKE {}", expr, placeholder)
    }

    fn regex(&self, expr: &str, placeholder: &str, case_insensitive: bool) -> Option<String> {
        let op = if case_insensitive { "~*" } else { "~" };
        Some(format!("{} {} {}", expr, op, placeholder))
    }

    fn aggregate(&self, op: GroupOp, expr: Option<&str>) -> String {
        match (op, expr) {
            (GroupOp::Sum, Some(e)) => format!("CAST(SUM({}) AS DOUBLE PRECISION)", e),
            (GroupOp::Avg, Some(e)) => format!("CAST(AVG({}) AS DOUBLE PRECISION)", e),
            (GroupOp::Any, Some(e)) => format!("(ARRAY_AGG({}))[1]", e),
            (op, expr) => GenericSqlDialect.aggregate(op, expr),
        }
    }

    fn select_expr(&self, column: &ColumnProperty, expr: &str) -> String {
        if column.type_class == TypeClass::Vector {
            format!("{}::text", expr)
        } else {
            expr.to_string()
        }
    }

    fn vector_distance(&self, expr: &str, op: VectorOp, placeholder: &str) -> Option<String> {
        Some(format!("{} {} {}::vector", expr, op.pgvector_operator(), placeholder))
    }

    fn vector_value(&self, placeholder: &str) -> String {
        format!("{}::vector", placeholder)
    }

    fn insert_id_position(&self) -> InsertIdPosition {
        InsertIdPosition::Returned
    }

    fn alter_column_sql(&self, table: &str, column: &ColumnProperty) -> Result<Option<String>> {
        let column_type = self.column_type(column)?;
        Ok(Some(format!(
            "ALTER TABLE {table} ALTER COLUMN {name} TYPE {column_type} USING {name}::{column_type}, ALTER COLUMN {name} {nullability}",
            table = table,
            name = column.dbname_us,
            column_type = column_type,
            nullability = if column.required { "SET NOT NULL" } else { "DROP NOT NULL" },
        )))
    }

    fn comment_statements(&self, model: &ModelSchema) -> Vec<String> {
        let mut statements: Vec<String> = self.table_description_sql(model).into_iter().collect();
        for column in model.columns() {
            if let Some(description) = &column.description {
                statements.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    model.table_name,
                    column.dbname_us,
                    quote_literal(description)
                ));
            }
        }
        statements
    }

    fn table_description_sql(&self, model: &ModelSchema) -> Option<String> {
        model.description.as_ref().map(|description| {
            format!("COMMENT ON TABLE {} IS {}", model.table_name, quote_literal(description))
        })
    }

    fn column_description_sql(&self, table: &str, column: &ColumnProperty) -> Result<Option<String>> {
        let description = column.description.as_deref().map(quote_literal);
        Ok(Some(format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            table,
            column.dbname_us,
            description.unwrap_or_else(|| "NULL".to_string())
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    fn definition(&self, column: &ColumnProperty) -> Result<String> {
        let mut definition = format!("{} {}", column.dbname_us, self.column_type(column)?);
        if column.required {
            definition.push_str(" NOT NULL");
        }
        if let Some(comment) = self.inline_column_comment(column) {
            definition.push_str(&comment);
        }
        Ok(definition)
    }
}

impl Dialect for MySqlDialect {
    fn kind(&self) -> AdapterKind {
        AdapterKind::MySql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_integrity: true,
            geo: true,
            vector: false,
            regex: true,
            descriptions: true,
            group_by: true,
            joins: true,
        }
    }

    fn column_type(&self, column: &ColumnProperty) -> Result<String> {
        if column.array {
            return Ok("JSON".to_string());
        }
        Ok(match column.type_class {
            TypeClass::String => format!("VARCHAR({})", column.size.unwrap_or(255)),
            TypeClass::Number => "DOUBLE".to_string(),
            TypeClass::Integer | TypeClass::RecordId => "INT".to_string(),
            TypeClass::BigInteger => "BIGINT".to_string(),
            TypeClass::Boolean => "TINYINT(1)".to_string(),
            TypeClass::Date => "DATETIME(3)".to_string(),
            TypeClass::Object => "JSON".to_string(),
            TypeClass::Text => "TEXT".to_string(),
            TypeClass::Blob => "BLOB".to_string(),
            TypeClass::GeoPoint => "POINT".to_string(),
            TypeClass::Vector => return Err(unsupported_type("MySQL", column)),
        })
    }

    /// `int(11)` and `bigint(20)` lose their display width
    fn normalize_type_string(&self, raw: &str) -> String {
        let upper = raw.trim().to_uppercase();
        for prefix in ["INT(", "BIGINT("] {
            if upper.starts_with(prefix) {
                if let Some(end) = upper.find(')') {
                    return format!("{}{}", &upper[..prefix.len() - 1], &upper[end + 1..]);
                }
            }
        }
        upper
    }

    fn primary_key_definition(&self) -> &'static str {
        "id INT NOT NULL AUTO_INCREMENT PRIMARY KEY"
    }

    fn like(&self, expr: &str, placeholder: &str) -> String {
        format!("{} LIKE {}", expr, placeholder)
    }

    fn regex(&self, expr: &str, placeholder: &str, case_insensitive: bool) -> Option<String> {
        let flags = if case_insensitive { "i" } else { "c" };
        Some(format!("REGEXP_LIKE({}, {}, '{}')", expr, placeholder, flags))
    }

    fn aggregate(&self, op: GroupOp, expr: Option<&str>) -> String {
        match (op, expr) {
            (GroupOp::Sum, Some(e)) => format!("CAST(SUM({}) AS DOUBLE)", e),
            (GroupOp::Avg, Some(e)) => format!("CAST(AVG({}) AS DOUBLE)", e),
            (GroupOp::Any, Some(e)) => format!("ANY_VALUE({})", e),
            (op, expr) => GenericSqlDialect.aggregate(op, expr),
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, Some(o)) => Some(format!("LIMIT 18446744073709551615 OFFSET {}", o)),
            (limit, offset) => GenericSqlDialect.limit_clause(limit, offset),
        }
    }

    fn supports_delete_order_limit(&self, has_offset: bool) -> bool {
        !has_offset
    }

    fn wrap_delete_subquery(&self, inner: String) -> String {
        format!("SELECT id FROM ({}) AS _sub", inner)
    }

    fn distance(&self, expr: &str, lng: &str, lat: &str) -> Option<String> {
        Some(format!("ST_Distance_Sphere({}, POINT({}, {}))", expr, lng, lat))
    }

    fn point_value(&self, lng: &str, lat: &str) -> Option<String> {
        Some(format!("POINT({}, {})", lng, lat))
    }

    fn select_expr(&self, column: &ColumnProperty, expr: &str) -> String {
        if column.type_class == TypeClass::GeoPoint && !column.array {
            format!("JSON_ARRAY(ST_X({}), ST_Y({}))", expr, expr)
        } else {
            expr.to_string()
        }
    }

    fn insert_id_position(&self) -> InsertIdPosition {
        InsertIdPosition::First
    }

    fn empty_insert(&self, table: &str) -> String {
        format!("INSERT INTO {} () VALUES ()", table)
    }

    fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        let mut statements = Vec::new();
        if let Some(level) = isolation {
            statements.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level));
        }
        statements.push("START TRANSACTION".to_string());
        statements
    }

    fn table_options(&self, model: &ModelSchema) -> String {
        match &model.description {
            Some(description) => format!(" COMMENT={}", quote_literal(description)),
            None => String::new(),
        }
    }

    fn inline_column_comment(&self, column: &ColumnProperty) -> Option<String> {
        column
            .description
            .as_ref()
            .map(|description| format!(" COMMENT {}", quote_literal(description)))
    }

    fn alter_column_sql(&self, table: &str, column: &ColumnProperty) -> Result<Option<String>> {
        Ok(Some(format!("ALTER TABLE {} MODIFY COLUMN {}", table, self.definition(column)?)))
    }

    fn drop_index_sql(&self, table: &str, index: &str) -> String {
        format!("DROP INDEX {} ON {}", index, table)
    }

    fn table_description_sql(&self, model: &ModelSchema) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} COMMENT = {}",
            model.table_name,
            quote_literal(model.description.as_deref().unwrap_or(""))
        ))
    }

    fn column_description_sql(&self, table: &str, column: &ColumnProperty) -> Result<Option<String>> {
        self.alter_column_sql(table, column)
    }
}
