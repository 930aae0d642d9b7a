//! Document-store compilation.
//!
//! Conditions become native BSON filters, grouped queries become aggregation
//! pipelines, and records are encoded to and decoded from BSON documents.
//! Storage uses dotted paths (`address.city`) and nested documents, and the
//! primary key lives in `_id`.
//!
//! Negation compiles to `$nor`, so `$not` applied twice is exactly the
//! original filter. Geo proximity filters are always placed at the top level
//! of the filter document; the server rejects `$nearSphere` inside `$and`.

use crate::backend::Record;
use crate::condition::{ColumnTest, Condition};
use crate::error::{QueryError, Result};
use crate::group::{GroupFieldSource, GroupOp, GroupSchema, GroupSource};
use crate::query::{NearSpec, QueryOptions};
use crate::schema::{ColumnProperty, ModelSchema, TypeClass};
use crate::value::{coerce, decode_blob, encode_blob, escape_regex, parse_date, Param, Pattern};
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document, Regex};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// A compiled read against one collection
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPlan {
    Find {
        filter: Document,
        projection: Option<Document>,
        sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    },
    Aggregate(Vec<Document>),
}

#[derive(Debug)]
struct Field {
    path: String,
    type_class: Option<TypeClass>,
    object_id: bool,
}

enum FieldScope<'a> {
    Model(&'a ModelSchema),
    Group(&'a GroupSchema),
}

impl FieldScope<'_> {
    fn resolve(&self, path: &str) -> Result<Field> {
        match self {
            FieldScope::Model(model) => match model.get(path) {
                Some(column) if column.primary_key => Ok(Field {
                    path: "_id".to_string(),
                    type_class: Some(column.type_class),
                    object_id: true,
                }),
                Some(column) => Ok(Field {
                    path: column.dbname_dot.clone(),
                    type_class: Some(column.type_class),
                    object_id: column.record_id,
                }),
                None if path == "id" => Ok(Field {
                    path: "_id".to_string(),
                    type_class: None,
                    object_id: true,
                }),
                None => Err(QueryError::UnknownColumn(format!("{}.{}", model.name, path))),
            },
            FieldScope::Group(schema) => schema
                .get(path)
                .map(|field| Field {
                    path: field.alias.clone(),
                    type_class: Some(field.type_class),
                    object_id: false,
                })
                .ok_or_else(|| QueryError::UnknownColumn(path.to_string())),
        }
    }
}

/// Compile a condition into a `find` filter; the empty condition is `{}`
pub fn compile_filter(model: &ModelSchema, condition: &Condition) -> Result<Document> {
    Ok(compile(&FieldScope::Model(model), condition)?.unwrap_or_default())
}

fn compile(scope: &FieldScope<'_>, condition: &Condition) -> Result<Option<Document>> {
    match condition {
        Condition::And(items) => combine(scope, items, "$and"),
        Condition::Or(items) => combine(scope, items, "$or"),
        Condition::Column { path, test } => {
            let field = scope.resolve(path)?;
            compile_test(scope, &field, test).map(Some)
        }
    }
}

fn combine(scope: &FieldScope<'_>, items: &[Condition], operator: &str) -> Result<Option<Document>> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        if let Some(part) = compile(scope, item)? {
            parts.push(part);
        }
    }
    Ok(match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(doc! { operator: parts }),
    })
}

fn compile_test(scope: &FieldScope<'_>, field: &Field, test: &ColumnTest) -> Result<Document> {
    let path = field.path.as_str();
    Ok(match test {
        ColumnTest::Eq(value) => doc! { path: { "$eq": literal(field, value) } },
        ColumnTest::Null => doc! { path: Bson::Null },
        ColumnTest::In(values) => {
            let values: Vec<Bson> = values.iter().map(|v| literal(field, v)).collect();
            doc! { path: { "$in": values } }
        }
        ColumnTest::Not(inner) => doc! { "$nor": [compile_test(scope, field, inner)?] },
        ColumnTest::Compare(op, value) => doc! { path: { op.mongo(): literal(field, value) } },
        ColumnTest::ColumnCompare(op, other) => {
            let other = scope.resolve(other)?;
            doc! { "$expr": { op.mongo(): [format!("${}", path), format!("${}", other.path)] } }
        }
        ColumnTest::Contains(values) => any_pattern(path, values, |v| escape_regex(v)),
        ColumnTest::StartsWith(values) => any_pattern(path, values, |v| format!("^{}", escape_regex(v))),
        ColumnTest::EndsWith(values) => any_pattern(path, values, |v| format!("{}$", escape_regex(v))),
        ColumnTest::Regex(pattern) => doc! { path: regex(&pattern.forced_insensitive()) },
        ColumnTest::All(tests) => {
            let parts = tests
                .iter()
                .map(|t| compile_test(scope, field, t))
                .collect::<Result<Vec<_>>>()?;
            doc! { "$and": parts }
        }
    })
}

fn any_pattern(path: &str, values: &[String], source: impl Fn(&str) -> String) -> Document {
    let mut parts: Vec<Document> = values
        .iter()
        .map(|v| doc! { path: regex(&Pattern::new(source(v)).insensitive()) })
        .collect();
    match parts.len() {
        1 => parts.remove(0),
        // no operand matches nothing
        0 => doc! { path: { "$in": [] } },
        _ => doc! { "$or": parts },
    }
}

fn regex(pattern: &Pattern) -> Bson {
    Bson::RegularExpression(Regex {
        pattern: pattern.source.clone(),
        options: pattern.options().to_string(),
    })
}

/// Condition literal, coerced through the field's declared type
fn literal(field: &Field, value: &Value) -> Bson {
    match (field.object_id, value) {
        (true, Value::String(s)) => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .unwrap_or_else(|_| Bson::String(s.clone())),
        (true, _) => json_to_bson(value),
        (false, _) => match field.type_class {
            Some(type_class) => param_to_bson(coerce(type_class, value)),
            None => json_to_bson(value),
        },
    }
}

fn param_to_bson(param: Param) -> Bson {
    match param {
        Param::Null | Param::InvalidDate => Bson::Null,
        Param::Bool(b) => Bson::Boolean(b),
        Param::Int(i) => Bson::Int64(i),
        Param::Float(f) => Bson::Double(f),
        Param::Text(s) => Bson::String(s),
        Param::Date(d) => Bson::DateTime(bson::DateTime::from_millis(d.timestamp_millis())),
        Param::Json(v) => json_to_bson(&v),
        Param::Bytes(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes,
        }),
    }
}

fn json_to_bson(value: &Value) -> Bson {
    bson::to_bson(value).unwrap_or(Bson::Null)
}

/// Plan a find; grouped queries become an aggregation pipeline
pub fn build_find(model: &ModelSchema, condition: &Condition, options: &QueryOptions) -> Result<DocumentPlan> {
    if !options.joins.is_empty() {
        return Err(QueryError::UnsupportedFeature("joins on a document store".to_string()));
    }
    if options.vector_order.is_some() {
        debug!("Ignoring vector order on a document store");
    }

    let scope = FieldScope::Model(model);
    let mut filter = compile_filter(model, condition)?;

    if options.group.is_none() {
        if let Some(near) = &options.near {
            filter = with_near(model, filter, near)?;
        }
        let projection = match &options.select {
            Some(paths) => {
                let mut projection = Document::new();
                for path in paths {
                    projection.insert(scope.resolve(path)?.path, 1);
                }
                Some(projection)
            }
            None => None,
        };
        return Ok(DocumentPlan::Find {
            filter,
            projection,
            sort: sort_document(&scope, options),
            skip: options.offset,
            limit: options.limit.map(|l| l as i64),
        });
    }

    if options.near.is_some() {
        return Err(QueryError::UnsupportedFeature("near combined with group".to_string()));
    }
    let schema = group_schema(model, options)?.unwrap_or_default();
    let mut pipeline = group_stages(model, filter, &schema)?;

    if let Some(having) = &options.having {
        if let Some(having) = compile(&FieldScope::Group(&schema), having)? {
            pipeline.push(doc! { "$match": having });
        }
    }
    if let Some(sort) = sort_document(&FieldScope::Group(&schema), options) {
        pipeline.push(doc! { "$sort": sort });
    }
    if let Some(offset) = options.offset {
        pipeline.push(doc! { "$skip": offset as i64 });
    }
    if let Some(limit) = options.limit {
        pipeline.push(doc! { "$limit": limit as i64 });
    }
    debug!("Group pipeline for {}: {} stages", model.name, pipeline.len());
    Ok(DocumentPlan::Aggregate(pipeline))
}

/// Plan a count; `Find` carries the filter and window for `count_documents`
pub fn build_count(model: &ModelSchema, condition: &Condition, options: &QueryOptions) -> Result<DocumentPlan> {
    if !options.joins.is_empty() {
        return Err(QueryError::UnsupportedFeature("joins on a document store".to_string()));
    }
    let mut filter = compile_filter(model, condition)?;

    if options.group.is_none() {
        // count_documents rejects $nearSphere; bound the circle instead
        if let Some(near) = &options.near {
            if let Some(max_distance) = near.max_distance {
                let field = geo_field(model, &near.column)?;
                let within = doc! {
                    field: { "$geoWithin": { "$centerSphere": [[near.lng, near.lat], max_distance / EARTH_RADIUS_METERS] } }
                };
                filter = and_documents(filter, within);
            }
        }
        return Ok(DocumentPlan::Find {
            filter,
            projection: None,
            sort: None,
            skip: options.offset,
            limit: options.limit.map(|l| l as i64),
        });
    }

    let DocumentPlan::Aggregate(mut pipeline) = build_find(model, condition, options)? else {
        return Err(QueryError::Query("grouped count did not produce a pipeline".to_string()));
    };
    pipeline.push(doc! { "$count": "count" });
    Ok(DocumentPlan::Aggregate(pipeline))
}

pub(crate) fn group_schema(model: &ModelSchema, options: &QueryOptions) -> Result<Option<GroupSchema>> {
    options
        .group
        .as_ref()
        .map(|group| {
            GroupSchema::build(&group.by, &group.fields, |path| {
                FieldScope::Model(model)
                    .resolve(path)
                    .map(|field| field.type_class.unwrap_or(TypeClass::RecordId))
            })
        })
        .transpose()
}

/// `$match`, `$group` and `$project` for a group schema
fn group_stages(model: &ModelSchema, filter: Document, schema: &GroupSchema) -> Result<Vec<Document>> {
    let scope = FieldScope::Model(model);
    let mut pipeline = Vec::new();
    if !filter.is_empty() {
        pipeline.push(doc! { "$match": filter });
    }

    let mut key = Document::new();
    let mut group = Document::new();
    let mut project = doc! { "_id": 0 };
    for field in &schema.fields {
        match &field.source {
            GroupFieldSource::Key(path) => {
                key.insert(field.alias.clone(), format!("${}", scope.resolve(path)?.path));
                project.insert(field.alias.clone(), format!("$_id.{}", field.alias));
            }
            GroupFieldSource::Aggregate(expr) => {
                let operator = match expr.op {
                    GroupOp::Sum => "$sum",
                    GroupOp::Min => "$min",
                    GroupOp::Max => "$max",
                    GroupOp::Avg => "$avg",
                    GroupOp::Any => "$first",
                };
                let source = match &expr.source {
                    GroupSource::Count => Bson::Int32(1),
                    GroupSource::Column(path) => Bson::String(format!("${}", scope.resolve(path)?.path)),
                };
                group.insert(field.alias.clone(), doc! { operator: source });
                project.insert(field.alias.clone(), 1);
            }
        }
    }

    let id = if key.is_empty() { Bson::Null } else { Bson::Document(key) };
    let mut stage = doc! { "_id": id };
    stage.extend(group);
    pipeline.push(doc! { "$group": stage });
    pipeline.push(doc! { "$project": project });
    Ok(pipeline)
}

fn sort_document(scope: &FieldScope<'_>, options: &QueryOptions) -> Option<Document> {
    let mut sort = Document::new();
    for order in &options.orders {
        match scope.resolve(&order.column) {
            Ok(field) => {
                sort.insert(field.path, if order.descending { -1 } else { 1 });
            }
            Err(_) => debug!("Ignoring order on unknown column {}", order.column),
        }
    }
    (!sort.is_empty()).then_some(sort)
}

fn geo_field(model: &ModelSchema, path: &str) -> Result<String> {
    match model.get(path) {
        Some(column) if column.type_class == TypeClass::GeoPoint => Ok(column.dbname_dot.clone()),
        Some(_) => Err(QueryError::InvalidCondition(format!("{} is not a geo point", path))),
        None => Err(QueryError::UnknownColumn(format!("{}.{}", model.name, path))),
    }
}

fn with_near(model: &ModelSchema, filter: Document, near: &NearSpec) -> Result<Document> {
    let field = geo_field(model, &near.column)?;
    let mut near_sphere = doc! {
        "$geometry": { "type": "Point", "coordinates": [near.lng, near.lat] }
    };
    if let Some(max_distance) = near.max_distance {
        near_sphere.insert("$maxDistance", max_distance);
    }

    // the proximity test must stay a top-level key
    let mut out = if filter.contains_key(&field) {
        doc! { "$and": [filter] }
    } else {
        filter
    };
    out.insert(field, doc! { "$nearSphere": near_sphere });
    Ok(out)
}

fn and_documents(left: Document, right: Document) -> Document {
    if left.is_empty() {
        right
    } else {
        doc! { "$and": [left, right] }
    }
}

/// `$set` / `$inc` update for the given partial data
pub fn update_document(model: &ModelSchema, data: &Record) -> Result<Document> {
    let mut set = Document::new();
    let mut inc = Document::new();
    for (column, value) in model.flatten(&data.columns)? {
        if column.primary_key {
            continue;
        }
        match value {
            Value::Object(map) if map.len() == 1 && map.contains_key("$inc") => {
                let amount = map.get("$inc").map(json_to_bson).unwrap_or(Bson::Int32(0));
                inc.insert(column.dbname_dot.clone(), amount);
            }
            _ => {
                set.insert(column.dbname_dot.clone(), encode_value(column, value)?);
            }
        }
    }

    let mut update = Document::new();
    if !set.is_empty() {
        update.insert("$set", set);
    }
    if !inc.is_empty() {
        update.insert("$inc", inc);
    }
    if update.is_empty() {
        return Err(QueryError::Query(format!("Nothing to update on {}", model.name)));
    }
    Ok(update)
}

/// Encode a record for insertion; nested columns become subdocuments
pub fn encode_document(model: &ModelSchema, data: &Record) -> Result<Document> {
    let mut document = Document::new();
    for (column, value) in model.flatten(&data.columns)? {
        if column.primary_key {
            if !value.is_null() {
                document.insert("_id", literal(&FieldScope::Model(model).resolve("id")?, value));
            }
            continue;
        }
        insert_path(&mut document, &column.parts_db, encode_value(column, value)?);
    }
    Ok(document)
}

fn insert_path(document: &mut Document, parts: &[String], value: Bson) {
    match parts {
        [] => {}
        [last] => {
            document.insert(last.clone(), value);
        }
        [head, rest @ ..] => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head.clone(), Document::new());
            }
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                insert_path(inner, rest, value);
            }
        }
    }
}

fn encode_value(column: &ColumnProperty, value: &Value) -> Result<Bson> {
    match value {
        Value::Null => Ok(Bson::Null),
        Value::Array(items) if column.array => items
            .iter()
            .map(|item| encode_scalar(column, item))
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        other => encode_scalar(column, other),
    }
}

fn encode_scalar(column: &ColumnProperty, value: &Value) -> Result<Bson> {
    if column.type_class == TypeClass::Blob && !value.is_null() {
        return Ok(Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: decode_blob(value)?,
        }));
    }
    let encoded = match (column.type_class, value) {
        (_, Value::Null) => Bson::Null,
        (TypeClass::Date, v) => parse_date(v)
            .map(|d| Bson::DateTime(bson::DateTime::from_millis(d.timestamp_millis())))
            .unwrap_or(Bson::Null),
        (TypeClass::GeoPoint, v) => match point(v) {
            Some((lng, lat)) => Bson::Document(doc! { "type": "Point", "coordinates": [lng, lat] }),
            None => json_to_bson(v),
        },
        (TypeClass::RecordId, Value::String(s)) => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .unwrap_or_else(|_| Bson::String(s.clone())),
        (TypeClass::Integer | TypeClass::BigInteger, Value::Number(n)) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => json_to_bson(value),
        },
        (TypeClass::Number, Value::Number(n)) => n.as_f64().map(Bson::Double).unwrap_or(Bson::Null),
        (_, v) => json_to_bson(v),
    };
    Ok(encoded)
}

/// `[lng, lat]` or `{ "lng": .., "lat": .. }`
fn point(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Array(items) if items.len() == 2 => Some((items[0].as_f64()?, items[1].as_f64()?)),
        Value::Object(map) => Some((map.get("lng")?.as_f64()?, map.get("lat")?.as_f64()?)),
        _ => None,
    }
}

/// Decode a stored document into a logical record
pub fn decode_document(model: &ModelSchema, document: &Document) -> Record {
    let mut record = Record::new();
    if let Some(id) = document.get("_id") {
        record.insert("id".to_string(), decode_bson(id));
    }
    for column in model.columns().filter(|c| !c.primary_key) {
        if let Some(value) = lookup(document, &column.parts_db) {
            let decoded = match (column.type_class, value) {
                (TypeClass::GeoPoint, Bson::Document(geo)) => geo
                    .get_array("coordinates")
                    .map(|c| Value::Array(c.iter().map(decode_bson).collect()))
                    .unwrap_or_else(|_| decode_bson(value)),
                _ => decode_bson(value),
            };
            record.set_path(&column.name, decoded);
        }
    }
    record
}

/// Decode one output document of a group pipeline
pub fn decode_group(schema: &GroupSchema, document: &Document) -> Record {
    let mut record = Record::new();
    for (key, value) in document {
        match schema.by_alias(key) {
            Some(field) => record.set_path(&field.name, decode_bson(value)),
            None => record.insert(key.clone(), decode_bson(value)),
        }
    }
    record
}

fn lookup<'d>(document: &'d Document, parts: &[String]) -> Option<&'d Bson> {
    let (last, init) = parts.split_last()?;
    let mut current = document;
    for part in init {
        current = current.get_document(part).ok()?;
    }
    current.get(last)
}

pub(crate) fn decode_bson(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(date) => Utc
            .timestamp_millis_opt(date.timestamp_millis())
            .single()
            .map(|d| Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
        Bson::Binary(binary) => Value::String(encode_blob(&binary.bytes)),
        Bson::Array(items) => Value::Array(items.iter().map(decode_bson).collect()),
        Bson::Document(inner) => Value::Object(inner.iter().map(|(k, v)| (k.clone(), decode_bson(v))).collect()),
        other => other.clone().into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupExpr;
    use crate::query::{GroupSpec, JoinKind, JoinSpec, OrderSpec};
    use crate::schema::ModelRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn order() -> Arc<ModelSchema> {
        let model = ModelSchema::new("Order")
            .column(ColumnProperty::new("customer", TypeClass::String))
            .column(ColumnProperty::new("price", TypeClass::Number))
            .column(ColumnProperty::new("quantity", TypeClass::Integer))
            .column(ColumnProperty::new("discount", TypeClass::Number))
            .column(ColumnProperty::new("placed", TypeClass::Date))
            .column(ColumnProperty::new("location", TypeClass::GeoPoint))
            .column(ColumnProperty::new("address.city", TypeClass::String));
        ModelRegistry::new().register(model).unwrap()
    }

    fn filter(condition: Value) -> Document {
        compile_filter(&order(), &Condition::from_json(&condition).unwrap()).unwrap()
    }

    #[test]
    fn test_membership_and_negation() {
        assert_eq!(filter(json!({ "customer": [] })), doc! { "customer": { "$in": [] } });
        assert_eq!(filter(json!({ "customer": null })), doc! { "customer": null });
        assert_eq!(
            filter(json!({ "customer": { "$not": null } })),
            doc! { "$nor": [{ "customer": null }] }
        );
        assert_eq!(
            filter(json!({ "customer": { "$not": { "$not": "A" } } })),
            doc! { "$nor": [{ "$nor": [{ "customer": { "$eq": "A" } }] }] }
        );
    }

    #[test]
    fn test_nested_and_or() {
        let compiled = filter(json!({ "$or": [{ "address.city": "Oslo" }, { "price": { "$gt": "9" } }] }));
        assert_eq!(
            compiled,
            doc! { "$or": [{ "address.city": { "$eq": "Oslo" } }, { "price": { "$gt": 9.0 } }] }
        );
        assert_eq!(filter(json!({})), Document::new());
    }

    #[test]
    fn test_numeric_sentinel() {
        assert_eq!(
            filter(json!({ "quantity": { "$gt": "not-a-number" } })),
            doc! { "quantity": { "$gt": -2147483648i64 } }
        );
    }

    #[test]
    fn test_patterns_are_escaped() {
        assert_eq!(
            filter(json!({ "customer": { "$contains": "50%_off." } })),
            doc! { "customer": Bson::RegularExpression(Regex { pattern: "50%_off\\.".into(), options: "i".into() }) }
        );
        assert_eq!(
            filter(json!({ "customer": { "$startswith": ["a", "b"] } })),
            doc! { "$or": [
                { "customer": Bson::RegularExpression(Regex { pattern: "^a".into(), options: "i".into() }) },
                { "customer": Bson::RegularExpression(Regex { pattern: "^b".into(), options: "i".into() }) },
            ] }
        );
        assert_eq!(
            filter(json!({ "customer": { "$regex": "^a.c$" } })),
            doc! { "customer": Bson::RegularExpression(Regex { pattern: "^a.c$".into(), options: "i".into() }) }
        );
    }

    #[test]
    fn test_column_comparison() {
        assert_eq!(
            filter(json!({ "price": { "$cgt": "$discount" } })),
            doc! { "$expr": { "$gt": ["$price", "$discount"] } }
        );
        let err = compile_filter(&order(), &Condition::from_json(&json!({ "price": { "$cgt": "$nope" } })).unwrap());
        assert!(matches!(err, Err(QueryError::UnknownColumn(_))));
    }

    #[test]
    fn test_ids_become_object_ids() {
        let hex = "65a1b2c3d4e5f60718293a4b";
        let oid = ObjectId::parse_str(hex).unwrap();
        assert_eq!(filter(json!({ "id": hex })), doc! { "_id": { "$eq": oid } });
        assert_eq!(filter(json!({ "id": "plain" })), doc! { "_id": { "$eq": "plain" } });
    }

    #[test]
    fn test_group_pipeline() {
        let options = QueryOptions {
            group: Some(GroupSpec {
                by: "customer".into(),
                fields: vec![("total".to_string(), GroupExpr::new(GroupOp::Sum, "price"))],
            }),
            having: Some(Condition::from_json(&json!({ "total": { "$gte": 10 } })).unwrap()),
            orders: OrderSpec::parse("customer"),
            ..Default::default()
        };
        let plan = build_find(&order(), &Condition::empty(), &options).unwrap();

        assert_eq!(
            plan,
            DocumentPlan::Aggregate(vec![
                doc! { "$group": { "_id": { "customer": "$customer" }, "total": { "$sum": "$price" } } },
                doc! { "$project": { "_id": 0, "customer": "$_id.customer", "total": 1 } },
                doc! { "$match": { "total": { "$gte": 10.0 } } },
                doc! { "$sort": { "customer": 1 } },
            ])
        );
    }

    #[test]
    fn test_total_group_and_any() {
        let options = QueryOptions {
            group: Some(GroupSpec {
                by: Default::default(),
                fields: vec![
                    ("count".to_string(), GroupExpr::count()),
                    ("some".to_string(), GroupExpr::new(GroupOp::Any, "customer")),
                ],
            }),
            ..Default::default()
        };
        let condition = Condition::from_json(&json!({ "price": { "$lt": 10 } })).unwrap();
        let DocumentPlan::Aggregate(pipeline) = build_find(&order(), &condition, &options).unwrap() else {
            panic!("expected a pipeline");
        };
        assert_eq!(pipeline[0], doc! { "$match": { "price": { "$lt": 10.0 } } });
        assert_eq!(
            pipeline[1],
            doc! { "$group": { "_id": null, "count": { "$sum": 1 }, "some": { "$first": "$customer" } } }
        );
    }

    #[test]
    fn test_near_stays_top_level() {
        let options = QueryOptions {
            near: Some(NearSpec {
                column: "location".to_string(),
                lng: 10.0,
                lat: 59.0,
                max_distance: Some(500.0),
            }),
            ..Default::default()
        };
        let condition = Condition::from_json(&json!({ "customer": "A", "price": { "$lt": 5 } })).unwrap();
        let DocumentPlan::Find { filter, .. } = build_find(&order(), &condition, &options).unwrap() else {
            panic!("expected a find");
        };

        assert!(filter.contains_key("$and"));
        let near = filter.get_document("location").unwrap();
        assert!(near.contains_key("$nearSphere"));

        let DocumentPlan::Find { filter, .. } = build_count(&order(), &condition, &options).unwrap() else {
            panic!("expected a find");
        };
        assert!(!filter.to_string().contains("$nearSphere"));
        assert!(filter.to_string().contains("$geoWithin"));
    }

    #[test]
    fn test_joins_unsupported() {
        let customer = Arc::new(ModelSchema::new("Customer"));
        let base = ModelSchema::new("Order").belongs_to("Customer", crate::schema::Integrity::Ignore);
        let options = QueryOptions {
            joins: vec![JoinSpec::between(&base, customer, JoinKind::Inner).unwrap()],
            ..Default::default()
        };
        let result = build_find(&order(), &Condition::empty(), &options);
        assert!(matches!(result, Err(QueryError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_update_document() {
        let data = Record::from_value(json!({ "customer": "B", "quantity": { "$inc": 2 } })).unwrap();
        assert_eq!(
            update_document(&order(), &data).unwrap(),
            doc! { "$set": { "customer": "B" }, "$inc": { "quantity": 2i64 } }
        );
        assert!(update_document(&order(), &Record::new()).is_err());
    }

    #[test]
    fn test_encode_decode_document() {
        let data = Record::from_value(json!({
            "customer": "A",
            "placed": "2024-01-02T03:04:05.000Z",
            "location": [10.5, 59.9],
            "address": { "city": "Oslo" },
        }))
        .unwrap();
        let document = encode_document(&order(), &data).unwrap();
        assert_eq!(document.get_document("address").unwrap(), &doc! { "city": "Oslo" });
        assert!(matches!(document.get("placed"), Some(Bson::DateTime(_))));
        assert_eq!(
            document.get_document("location").unwrap(),
            &doc! { "type": "Point", "coordinates": [10.5, 59.9] }
        );

        let mut stored = document.clone();
        stored.insert("_id", ObjectId::parse_str("65a1b2c3d4e5f60718293a4b").unwrap());
        let record = decode_document(&order(), &stored);
        assert_eq!(record.get_string("id"), Some("65a1b2c3d4e5f60718293a4b".to_string()));
        assert_eq!(record.get_string("placed"), Some("2024-01-02T03:04:05.000Z".to_string()));
        assert_eq!(record.get_value("location"), Some(&json!([10.5, 59.9])));
        assert_eq!(record.get_path("address.city"), Some(&json!("Oslo")));
    }

    #[test]
    fn test_blob_round_trip() {
        let model = ModelRegistry::new()
            .register(ModelSchema::new("Attachment").column(ColumnProperty::new("data", TypeClass::Blob)))
            .unwrap();

        let document = encode_document(&model, &Record::from_value(json!({ "data": "aGVsbG8=" })).unwrap()).unwrap();
        assert_eq!(
            document.get("data"),
            Some(&Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: b"hello".to_vec() }))
        );

        let read = decode_document(&model, &document);
        assert_eq!(read.get_value("data"), Some(&json!("aGVsbG8=")));
        let again = encode_document(&model, &read).unwrap();
        assert_eq!(again.get("data"), document.get("data"));

        let bad = Record::from_value(json!({ "data": [104, 361] })).unwrap();
        assert!(matches!(encode_document(&model, &bad), Err(QueryError::Serialization(_))));
        assert!(update_document(&model, &bad).is_err());
    }
}
