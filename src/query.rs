//! Chainable queries.
//!
//! A [`Query`] accumulates conditions and options and is consumed by exactly
//! one terminal operation (`exec`, `count`, `delete`, ...). Build a fresh one,
//! or clone before executing, to run it twice.

use crate::adapter::{Adapter, RecordStream};
use crate::backend::Record;
use crate::condition::{ColumnTest, Condition};
use crate::connection::Connection;
use crate::error::{QueryError, Result};
use crate::group::{parse_group_fields, GroupBy, GroupExpr};
use crate::schema::{foreign_key_for, ModelSchema};
use crate::transaction::Transaction;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub column: String,
    pub descending: bool,
}

impl OrderSpec {
    /// Parse `"-price name"`: space separated, `-` for descending
    pub fn parse(spec: &str) -> Vec<OrderSpec> {
        spec.split_whitespace()
            .map(|item| match item.strip_prefix('-') {
                Some(column) => OrderSpec {
                    column: column.to_string(),
                    descending: true,
                },
                None => OrderSpec {
                    column: item.to_string(),
                    descending: false,
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKind::Inner => write!(f, "INNER JOIN"),
            JoinKind::LeftOuter => write!(f, "LEFT OUTER JOIN"),
        }
    }
}

/// A joined model; conditions address its columns as `{alias}.{column}`
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub model: Arc<ModelSchema>,
    pub alias: String,
    pub kind: JoinKind,
    /// Storage column on the queried model
    pub base_column: String,
    /// Storage column on the joined model
    pub join_column: String,
}

impl JoinSpec {
    /// Resolve the association between `base` and `target` in either direction
    pub fn between(base: &ModelSchema, target: Arc<ModelSchema>, kind: JoinKind) -> Result<JoinSpec> {
        let (base_column, join_column) = if let Some(fk) = base.get(&foreign_key_for(&target.name)) {
            (fk.dbname_us.clone(), "id".to_string())
        } else if let Some(fk) = target.get(&foreign_key_for(&base.name)) {
            ("id".to_string(), fk.dbname_us.clone())
        } else {
            return Err(QueryError::Query(format!(
                "No association between {} and {}",
                base.name, target.name
            )));
        };

        Ok(JoinSpec {
            alias: target.name.clone(),
            model: target,
            kind,
            base_column,
            join_column,
        })
    }
}

/// Order by distance from a point, optionally bounded
#[derive(Debug, Clone, PartialEq)]
pub struct NearSpec {
    pub column: String,
    pub lng: f64,
    pub lat: f64,
    /// Meters
    pub max_distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Cosine,
    L1,
    L2,
    InnerProduct,
    Hamming,
    Jaccard,
}

impl VectorOp {
    pub fn pgvector_operator(&self) -> &'static str {
        match self {
            VectorOp::Cosine => "<=>",
            VectorOp::L1 => "<+>",
            VectorOp::L2 => "<->",
            VectorOp::InnerProduct => "<#>",
            VectorOp::Hamming => "<~>",
            VectorOp::Jaccard => "<%>",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorOrder {
    pub column: String,
    pub op: VectorOp,
    pub vector: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub by: GroupBy,
    pub fields: Vec<(String, GroupExpr)>,
}

/// Everything about a query other than its filter
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub joins: Vec<JoinSpec>,
    pub group: Option<GroupSpec>,
    pub having: Option<Condition>,
    pub orders: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    pub near: Option<NearSpec>,
    pub vector_order: Option<VectorOrder>,
}

impl QueryOptions {
    pub fn is_grouped(&self) -> bool {
        self.group.is_some()
    }

    /// Ordering, limit or offset restrict which rows a write touches
    pub fn restricts_rows(&self) -> bool {
        !self.orders.is_empty() || self.limit.is_some() || self.offset.is_some()
    }
}

#[derive(Debug, Clone)]
enum FindIds {
    One(Value),
    Many(Vec<Value>),
}

pub struct Query<'c, A: Adapter> {
    connection: &'c Connection<A>,
    model: Arc<ModelSchema>,
    conditions: Vec<Condition>,
    options: QueryOptions,
    find: Option<FindIds>,
    transaction: Option<&'c Transaction>,
}

impl<A: Adapter> Clone for Query<'_, A> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection,
            model: self.model.clone(),
            conditions: self.conditions.clone(),
            options: self.options.clone(),
            find: self.find.clone(),
            transaction: self.transaction,
        }
    }
}

impl<'c, A: Adapter> Query<'c, A> {
    pub fn new(connection: &'c Connection<A>, model: Arc<ModelSchema>) -> Self {
        Self {
            connection,
            model,
            conditions: Vec::new(),
            options: QueryOptions::default(),
            find: None,
            transaction: None,
        }
    }

    pub fn model(&self) -> &ModelSchema {
        &self.model
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Conditions added by successive calls are ANDed
    pub fn condition(&self) -> Condition {
        match self.conditions.as_slice() {
            [single] => single.clone(),
            many => Condition::And(many.to_vec()),
        }
    }

    /// Filter rows; once grouped, conditions filter the grouped output instead
    pub fn where_(mut self, condition: Condition) -> Self {
        if self.options.group.is_some() {
            return self.having(condition);
        }
        self.conditions.push(condition);
        self
    }

    pub fn where_json(self, condition: Value) -> Result<Self> {
        Ok(self.where_(Condition::from_json(&condition)?))
    }

    /// Space-separated column paths
    pub fn select(self, columns: &str) -> Self {
        self.select_columns(columns.split_whitespace().collect())
    }

    pub fn select_columns(mut self, columns: Vec<&str>) -> Self {
        self.options.select = Some(columns.into_iter().map(String::from).collect());
        self
    }

    pub fn order(mut self, spec: &str) -> Self {
        self.options.orders.extend(OrderSpec::parse(spec));
        self
    }

    pub fn group(mut self, by: impl Into<GroupBy>, fields: Vec<(impl Into<String>, GroupExpr)>) -> Self {
        self.options.group = Some(GroupSpec {
            by: by.into(),
            fields: fields.into_iter().map(|(name, expr)| (name.into(), expr)).collect(),
        });
        self
    }

    /// Group with fields in JSON form, e.g. `{ "total": { "$sum": "$price" } }`
    pub fn group_json(mut self, by: impl Into<GroupBy>, fields: &Value) -> Result<Self> {
        self.options.group = Some(GroupSpec {
            by: by.into(),
            fields: parse_group_fields(fields)?,
        });
        Ok(self)
    }

    /// Filter applied to group results
    pub fn having(mut self, condition: Condition) -> Self {
        self.options.having = Some(match self.options.having.take() {
            Some(existing) => Condition::And(vec![existing, condition]),
            None => condition,
        });
        self
    }

    pub fn having_json(self, condition: Value) -> Result<Self> {
        Ok(self.having(Condition::from_json(&condition)?))
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn skip(mut self, offset: u64) -> Self {
        self.options.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.options.distinct = true;
        self
    }

    pub fn join(self, model: &str) -> Result<Self> {
        self.join_with(model, JoinKind::Inner)
    }

    pub fn left_outer_join(self, model: &str) -> Result<Self> {
        self.join_with(model, JoinKind::LeftOuter)
    }

    fn join_with(mut self, model: &str, kind: JoinKind) -> Result<Self> {
        let target = self.connection.model(model)?;
        let spec = JoinSpec::between(&self.model, target, kind)?;
        self.options.joins.push(spec);
        Ok(self)
    }

    /// Order by distance from `(lng, lat)`, nearest first
    pub fn near(mut self, column: &str, lng: f64, lat: f64, max_distance: Option<f64>) -> Self {
        self.options.near = Some(NearSpec {
            column: column.to_string(),
            lng,
            lat,
            max_distance,
        });
        self
    }

    pub fn order_by_vector(mut self, column: &str, op: VectorOp, vector: Vec<f64>) -> Self {
        self.options.vector_order = Some(VectorOrder {
            column: column.to_string(),
            op,
            vector,
        });
        self
    }

    pub fn transaction(mut self, transaction: &'c Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Restrict to one id; `exec` fails with `NotFound` unless it exists
    pub fn find(mut self, id: impl Into<Value>) -> Self {
        self.find = Some(FindIds::One(id.into()));
        self
    }

    /// Restrict to several ids; every one of them must exist
    pub fn find_many(mut self, ids: Vec<Value>) -> Self {
        self.find = Some(FindIds::Many(ids));
        self
    }

    fn check_transaction(&self) -> Result<()> {
        if let Some(transaction) = self.transaction {
            transaction.check_active()?;
        }
        Ok(())
    }

    /// Condition including any `find` restriction
    fn effective_condition(&self) -> Condition {
        let mut conditions = self.conditions.clone();
        match &self.find {
            Some(FindIds::One(id)) => conditions.push(Condition::eq("id", id.clone())),
            Some(FindIds::Many(ids)) => {
                conditions.push(Condition::test("id", ColumnTest::In(ids.clone())))
            }
            None => {}
        }
        match conditions.len() {
            1 => conditions.remove(0),
            _ => Condition::And(conditions),
        }
    }

    pub async fn exec(self) -> Result<Vec<Record>> {
        self.check_transaction()?;
        let adapter = self.connection.adapter();

        if let Some(FindIds::One(id)) = &self.find {
            if self.conditions.is_empty() && !self.options.is_grouped() && self.options.joins.is_empty() {
                return match adapter.find_by_id(&self.model, id, &self.options, self.transaction).await {
                    Ok(record) => Ok(vec![record]),
                    Err(QueryError::NotFound(_)) => Err(not_found(&self.model, id)),
                    Err(e) => Err(e),
                };
            }
        }

        let condition = self.effective_condition();
        debug!("Finding {} where {:?}", self.model.name, condition);
        let records = adapter
            .find(&self.model, &condition, &self.options, self.transaction)
            .await?;

        match &self.find {
            Some(FindIds::One(id)) if records.is_empty() => Err(not_found(&self.model, id)),
            Some(FindIds::Many(ids)) => {
                let wanted: HashSet<String> = ids.iter().map(id_key).collect();
                let found: HashSet<String> = records.iter().filter_map(|r| r.id()).map(id_key).collect();
                if wanted.is_subset(&found) {
                    Ok(records)
                } else {
                    Err(QueryError::NotFound(format!("{} records", self.model.name)))
                }
            }
            _ => Ok(records),
        }
    }

    pub async fn first(self) -> Result<Option<Record>> {
        Ok(self.limit(1).exec().await?.into_iter().next())
    }

    pub async fn count(self) -> Result<u64> {
        self.check_transaction()?;
        let condition = self.effective_condition();
        self.connection
            .adapter()
            .count(&self.model, &condition, &self.options, self.transaction)
            .await
    }

    /// Delete matching records, honoring integrity rules of child models
    pub async fn delete(self) -> Result<u64> {
        self.check_transaction()?;
        let condition = self.effective_condition();
        self.connection
            .delete_with_integrity(self.model.clone(), condition, self.options.clone(), self.transaction)
            .await
    }

    /// Apply `data` to matching records; `{ "$inc": n }` values increment
    pub async fn update(self, data: Record) -> Result<u64> {
        self.check_transaction()?;
        let condition = self.effective_condition();
        self.connection
            .adapter()
            .update_partial(&self.model, &data, &condition, &self.options, self.transaction)
            .await
    }

    /// Update matching records, inserting one if none match
    pub async fn upsert(self, data: Record) -> Result<()> {
        self.check_transaction()?;
        let condition = self.effective_condition();
        self.connection
            .adapter()
            .upsert(&self.model, &data, &condition, &self.options, self.transaction)
            .await
    }

    pub async fn stream(self) -> Result<RecordStream> {
        if self.transaction.is_some() {
            return Err(QueryError::UnsupportedFeature(
                "streaming inside a transaction".to_string(),
            ));
        }
        let condition = self.effective_condition();
        self.connection
            .adapter()
            .stream(self.model.clone(), condition, self.options)
            .await
    }
}

fn not_found(model: &ModelSchema, id: &Value) -> QueryError {
    QueryError::NotFound(format!("{} {}", model.name, id))
}

/// Ids compare by their textual form so `1` and `"1"` match
fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnProperty, Integrity, TypeClass};

    #[test]
    fn test_order_spec_parse() {
        assert_eq!(
            OrderSpec::parse("-price  name"),
            vec![
                OrderSpec {
                    column: "price".into(),
                    descending: true
                },
                OrderSpec {
                    column: "name".into(),
                    descending: false
                },
            ]
        );
        assert!(OrderSpec::parse("").is_empty());
    }

    #[test]
    fn test_join_spec_both_directions() {
        let user = Arc::new(ModelSchema::new("User").column(ColumnProperty::new("name", TypeClass::String)));
        let post = Arc::new(ModelSchema::new("Post").belongs_to("User", Integrity::Ignore));

        let spec = JoinSpec::between(&post, user.clone(), JoinKind::Inner).unwrap();
        assert_eq!(spec.alias, "User");
        assert_eq!((spec.base_column.as_str(), spec.join_column.as_str()), ("user_id", "id"));

        let spec = JoinSpec::between(&user, post.clone(), JoinKind::LeftOuter).unwrap();
        assert_eq!((spec.base_column.as_str(), spec.join_column.as_str()), ("id", "user_id"));

        let tag = Arc::new(ModelSchema::new("Tag"));
        assert!(JoinSpec::between(&user, tag, JoinKind::Inner).is_err());
    }

    #[test]
    fn test_vector_operators() {
        assert_eq!(VectorOp::Cosine.pgvector_operator(), "<=>");
        assert_eq!(VectorOp::InnerProduct.pgvector_operator(), "<#>");
    }
}
