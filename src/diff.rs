//! Schema diff engine.
//!
//! [`plan`] compares the registered models against a snapshot of the live
//! database and returns an ordered [`SchemaPlan`]. Nothing is executed while
//! planning. [`SchemaPlan::apply`] runs the plan, skipping every ignorable
//! change unless the caller opts in, so removals and alterations of live
//! columns never happen implicitly.

use crate::adapter::{Adapter, AdapterKind};
use crate::error::{QueryError, Result};
use crate::schema::{ColumnProperty, IndexDef, Integrity, ModelRegistry, ModelSchema};
use crate::snapshot::{Schemas, TableSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One structural operation, carrying what the adapter needs to run it
#[derive(Debug, Clone)]
pub enum SchemaOperation {
    AddTable(Arc<ModelSchema>),
    AddColumn {
        model: Arc<ModelSchema>,
        column: ColumnProperty,
    },
    AlterColumn {
        model: Arc<ModelSchema>,
        column: ColumnProperty,
    },
    UpdateColumnDescription {
        model: Arc<ModelSchema>,
        column: ColumnProperty,
    },
    DropColumn {
        table: String,
        column: String,
    },
    UpdateTableDescription(Arc<ModelSchema>),
    DropTable(String),
    AddIndex {
        model: Arc<ModelSchema>,
        index: IndexDef,
    },
    DropIndex {
        table: String,
        index: String,
    },
    AddForeignKey {
        model: Arc<ModelSchema>,
        /// Logical path of the foreign key column
        column: String,
        target: Arc<ModelSchema>,
        integrity: Integrity,
    },
}

/// A detected divergence between declared and live schema
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub message: String,
    /// Statement the adapter would run, when it has a textual form
    pub query: Option<String>,
    /// Safe to leave unapplied; never run without an explicit opt-in
    pub ignorable: bool,
    pub operation: SchemaOperation,
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.ignorable {
            write!(f, " (ignorable)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    pub include_ignorable: bool,
}

impl ApplyOptions {
    pub fn with_ignorable() -> Self {
        Self {
            include_ignorable: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<SchemaChange>,
    pub skipped: Vec<SchemaChange>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaPlan {
    pub changes: Vec<SchemaChange>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn messages(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.message.as_str()).collect()
    }

    /// Changes that must run to keep the models usable
    pub fn required(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| !c.ignorable)
    }

    /// Run the plan in order; the first failing change aborts the rest
    pub async fn apply<A: Adapter + ?Sized>(self, adapter: &A, options: ApplyOptions) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for change in self.changes {
            if change.ignorable && !options.include_ignorable {
                debug!("Skipping ignorable change: {}", change.message);
                report.skipped.push(change);
                continue;
            }

            if run_operation(adapter, &change).await? {
                info!("Applied schema change: {}", change.message);
                report.applied.push(change);
            } else {
                warn!("No statement for schema change on {:?}: {}", adapter.kind(), change.message);
                report.skipped.push(change);
            }
        }

        Ok(report)
    }
}

/// Returns false when the adapter has no way to express the change
async fn run_operation<A: Adapter + ?Sized>(adapter: &A, change: &SchemaChange) -> Result<bool> {
    match &change.operation {
        SchemaOperation::AddTable(model) => adapter.create_table(model).await?,
        SchemaOperation::AddColumn { model, column } => adapter.add_column(model, column).await?,
        SchemaOperation::AddIndex { model, index } => adapter.create_index(model, index).await?,
        SchemaOperation::AddForeignKey {
            model,
            column,
            target,
            integrity,
        } => adapter.create_foreign_key(model, column, target, *integrity).await?,
        SchemaOperation::DropTable(table) => adapter.drop_table(table).await?,
        SchemaOperation::DropIndex { table, index } => adapter.drop_index(table, index).await?,
        SchemaOperation::AlterColumn { .. }
        | SchemaOperation::UpdateColumnDescription { .. }
        | SchemaOperation::DropColumn { .. }
        | SchemaOperation::UpdateTableDescription(_) => match &change.query {
            Some(statement) => adapter.run_schema_statement(statement).await?,
            None => return Ok(false),
        },
    }
    Ok(true)
}

struct Planner<'a, A: Adapter + ?Sized> {
    adapter: &'a A,
    changes: Vec<SchemaChange>,
}

impl<A: Adapter + ?Sized> Planner<'_, A> {
    fn push(&mut self, message: String, ignorable: bool, operation: SchemaOperation) {
        let query = self.adapter.render_change_query(&operation);
        self.changes.push(SchemaChange {
            message,
            query,
            ignorable,
            operation,
        });
    }
}

/// Diff the registered models against the live schema
pub fn plan<A: Adapter + ?Sized>(registry: &ModelRegistry, live: &Schemas, adapter: &A) -> Result<SchemaPlan> {
    let capabilities = adapter.capabilities();
    let mut planner = Planner {
        adapter,
        changes: Vec::new(),
    };

    // tables and their columns
    for model in registry.iter() {
        match live.table(&model.table_name) {
            None => planner.push(
                format!("Add table {}", model.table_name),
                false,
                SchemaOperation::AddTable(model.clone()),
            ),
            Some(TableSnapshot::NoSchema) => {}
            Some(TableSnapshot::Columns(table)) => {
                for column in model.columns().filter(|c| !c.primary_key) {
                    let Some(existing) = table.columns.get(&column.dbname_us) else {
                        planner.push(
                            format!("Add column {}.{}", model.table_name, column.dbname_us),
                            false,
                            SchemaOperation::AddColumn {
                                model: model.clone(),
                                column: column.clone(),
                            },
                        );
                        continue;
                    };

                    let type_string = adapter.type_string(column)?;
                    let type_changed = type_string != existing.adapter_type_string;
                    if type_changed {
                        planner.push(
                            format!(
                                "Change type of column {}.{} from {} to {}",
                                model.table_name, column.dbname_us, existing.adapter_type_string, type_string
                            ),
                            true,
                            SchemaOperation::AlterColumn {
                                model: model.clone(),
                                column: column.clone(),
                            },
                        );
                    } else if column.required != existing.required {
                        planner.push(
                            format!(
                                "Make column {}.{} {}",
                                model.table_name,
                                column.dbname_us,
                                if column.required { "required" } else { "optional" }
                            ),
                            true,
                            SchemaOperation::AlterColumn {
                                model: model.clone(),
                                column: column.clone(),
                            },
                        );
                    }

                    // a type change rewrites the column, description included
                    if capabilities.descriptions && !type_changed && column.description != existing.description {
                        planner.push(
                            format!("Change description of column {}.{}", model.table_name, column.dbname_us),
                            true,
                            SchemaOperation::UpdateColumnDescription {
                                model: model.clone(),
                                column: column.clone(),
                            },
                        );
                    }
                }

                for name in table.columns.keys() {
                    if model.get_by_storage(name).is_none() {
                        planner.push(
                            format!("Remove column {}.{}", model.table_name, name),
                            true,
                            SchemaOperation::DropColumn {
                                table: model.table_name.clone(),
                                column: name.clone(),
                            },
                        );
                    }
                }

                if capabilities.descriptions && model.description != table.description {
                    planner.push(
                        format!("Change description of table {}", model.table_name),
                        true,
                        SchemaOperation::UpdateTableDescription(model.clone()),
                    );
                }
            }
        }
    }

    let declared: HashSet<&str> = registry.iter().map(|m| m.table_name.as_str()).collect();
    for table in live.tables.keys().filter(|t| !declared.contains(t.as_str())) {
        planner.push(
            format!("Remove table {}", table),
            true,
            SchemaOperation::DropTable(table.clone()),
        );
    }

    if adapter.kind() != AdapterKind::KeyValueStore {
        for model in registry.iter() {
            plan_indexes(&mut planner, model, live)?;
        }
    }

    if capabilities.native_integrity {
        for model in registry.iter() {
            for (target, foreign_key, integrity) in model.belongs_to_targets() {
                if integrity == Integrity::Ignore {
                    continue;
                }
                let column = model
                    .get(foreign_key)
                    .ok_or_else(|| QueryError::UnknownColumn(format!("{}.{}", model.name, foreign_key)))?;
                if live.foreign_key(&model.table_name, &column.dbname_us).is_some() {
                    continue;
                }
                let target = registry.get(target)?;
                planner.push(
                    format!(
                        "Add foreign key {}.{} referencing {}",
                        model.table_name, column.dbname_us, target.table_name
                    ),
                    false,
                    SchemaOperation::AddForeignKey {
                        model: model.clone(),
                        column: foreign_key.to_string(),
                        target,
                        integrity,
                    },
                );
            }
        }
    }

    debug!("Schema plan has {} changes", planner.changes.len());
    Ok(SchemaPlan {
        changes: planner.changes,
    })
}

fn plan_indexes<A: Adapter + ?Sized>(planner: &mut Planner<'_, A>, model: &Arc<ModelSchema>, live: &Schemas) -> Result<()> {
    let declared = model.declared_indexes();
    for index in &declared {
        if live.index(&model.table_name, &index.name).is_none() {
            planner.push(
                format!("Add index {} on {}", index.name, model.table_name),
                false,
                SchemaOperation::AddIndex {
                    model: model.clone(),
                    index: index.clone(),
                },
            );
        }
    }

    // engines index foreign key columns on their own
    let foreign_keys: Vec<&str> = model
        .belongs_to_targets()
        .filter(|(_, _, integrity)| *integrity != Integrity::Ignore)
        .filter_map(|(_, fk, _)| model.get(fk).map(|c| c.dbname_us.as_str()))
        .collect();

    if let Some(indexes) = live.indexes.get(&model.table_name) {
        for (name, index) in indexes {
            if declared.iter().any(|d| &d.name == name) {
                continue;
            }
            if matches!(index.columns.as_slice(), [column] if foreign_keys.contains(&column.as_str())) {
                continue;
            }
            planner.push(
                format!("Remove index {} on {}", name, model.table_name),
                true,
                SchemaOperation::DropIndex {
                    table: model.table_name.clone(),
                    index: name.clone(),
                },
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::schema::TypeClass;
    use crate::snapshot::{ColumnSnapshot, SchemasTable};
    use crate::sql_adapter::SqlAdapter;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry
            .register(
                ModelSchema::new("Order")
                    .column(ColumnProperty::new("customer", TypeClass::String).required())
                    .column(ColumnProperty::new("price", TypeClass::Number))
                    .index(IndexDef::new(vec!["customer"])),
            )
            .unwrap();
        registry
    }

    fn orders_table() -> SchemasTable {
        SchemasTable::new()
            .column("id", ColumnSnapshot::new("INTEGER", true))
            .column("customer", ColumnSnapshot::new("TEXT", true))
            .column("price", ColumnSnapshot::new("REAL", false))
    }

    #[test]
    fn test_plan_empty_database() {
        let adapter = SqlAdapter::new(MockBackend::sqlite());
        let plan = plan(&registry(), &Schemas::new(), &adapter).unwrap();
        assert_eq!(plan.messages(), vec!["Add table orders", "Add index orders_customer on orders"]);
        assert!(plan.changes.iter().all(|c| !c.ignorable));
        assert_eq!(
            plan.changes[0].query.as_deref(),
            Some("CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, customer TEXT NOT NULL, price REAL)")
        );
    }

    #[test]
    fn test_plan_in_sync() {
        let adapter = SqlAdapter::new(MockBackend::sqlite());
        let live = Schemas::new()
            .with_table("orders", orders_table())
            .with_index("orders", "orders_customer", vec!["customer"], false);
        assert!(plan(&registry(), &live, &adapter).unwrap().is_empty());
    }

    #[test]
    fn test_plan_column_drift() {
        let adapter = SqlAdapter::new(MockBackend::sqlite());
        let live = Schemas::new()
            .with_table(
                "orders",
                SchemasTable::new()
                    .column("id", ColumnSnapshot::new("INTEGER", true))
                    .column("customer", ColumnSnapshot::new("TEXT", false))
                    .column("legacy", ColumnSnapshot::new("TEXT", false)),
            )
            .with_index("orders", "orders_customer", vec!["customer"], false);

        let plan = plan(&registry(), &live, &adapter).unwrap();
        let summary: Vec<(&str, bool)> = plan.changes.iter().map(|c| (c.message.as_str(), c.ignorable)).collect();
        assert_eq!(
            summary,
            vec![
                ("Make column orders.customer required", true),
                ("Add column orders.price", false),
                ("Remove column orders.legacy", true),
            ]
        );
        assert_eq!(plan.changes[1].query.as_deref(), Some("ALTER TABLE orders ADD COLUMN price REAL"));
        // SQLite cannot alter a column in place
        assert_eq!(plan.changes[0].query, None);
        assert_eq!(plan.required().count(), 1);
    }

    #[test]
    fn test_plan_type_change_masks_description() {
        let adapter = SqlAdapter::new(MockBackend::postgres());
        let mut registry = ModelRegistry::new();
        registry
            .register(
                ModelSchema::new("Order")
                    .column(ColumnProperty::new("price", TypeClass::Number).description("Unit price")),
            )
            .unwrap();

        let live = Schemas::new().with_table(
            "orders",
            SchemasTable::new()
                .column("id", ColumnSnapshot::new("INTEGER", true))
                .column("price", ColumnSnapshot::new("INTEGER", false)),
        );
        let plan = plan(&registry, &live, &adapter).unwrap();
        assert_eq!(
            plan.messages(),
            vec!["Change type of column orders.price from INTEGER to DOUBLE PRECISION"]
        );
        assert!(plan.changes[0].ignorable);

        let live = Schemas::new().with_table(
            "orders",
            SchemasTable::new()
                .column("id", ColumnSnapshot::new("INTEGER", true))
                .column("price", ColumnSnapshot::new("DOUBLE PRECISION", false)),
        );
        let plan = super::plan(&registry, &live, &adapter).unwrap();
        assert_eq!(plan.messages(), vec!["Change description of column orders.price"]);
        assert_eq!(
            plan.changes[0].query.as_deref(),
            Some("COMMENT ON COLUMN orders.price IS 'Unit price'")
        );
    }

    #[test]
    fn test_plan_extra_table_and_index() {
        let adapter = SqlAdapter::new(MockBackend::sqlite());
        let live = Schemas::new()
            .with_table("orders", orders_table())
            .with_table("sessions", SchemasTable::new())
            .with_index("orders", "orders_customer", vec!["customer"], false)
            .with_index("orders", "orders_old", vec!["price"], false);

        let plan = plan(&registry(), &live, &adapter).unwrap();
        assert_eq!(plan.messages(), vec!["Remove table sessions", "Remove index orders_old on orders"]);
        assert!(plan.changes.iter().all(|c| c.ignorable));
    }

    #[test]
    fn test_plan_foreign_keys() {
        let adapter = SqlAdapter::new(MockBackend::mysql());
        let mut registry = ModelRegistry::new();
        registry.register(ModelSchema::new("User")).unwrap();
        registry
            .register(ModelSchema::new("Post").belongs_to("User", Integrity::Cascade))
            .unwrap();

        let live = Schemas::new()
            .with_table("users", SchemasTable::new().column("id", ColumnSnapshot::new("INT", true)))
            .with_table(
                "posts",
                SchemasTable::new()
                    .column("id", ColumnSnapshot::new("INT", true))
                    .column("user_id", ColumnSnapshot::new("INT", false)),
            )
            // created by MySQL along with the constraint
            .with_index("posts", "fk_posts_user_id", vec!["user_id"], false);

        let plan = plan(&registry, &live, &adapter).unwrap();
        assert_eq!(plan.messages(), vec!["Add foreign key posts.user_id referencing users"]);
        assert_eq!(
            plan.changes[0].query.as_deref(),
            Some("ALTER TABLE posts ADD CONSTRAINT fk_posts_user_id FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE")
        );

        let live = live.with_foreign_key("posts", "user_id", "users");
        assert!(super::plan(&registry, &live, &adapter).unwrap().is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let adapter = SqlAdapter::new(MockBackend::sqlite());
        let live = Schemas::new().with_table("legacy", SchemasTable::new());
        let first = plan(&registry(), &live, &adapter).unwrap();
        let second = plan(&registry(), &live, &adapter).unwrap();
        assert_eq!(first.messages(), second.messages());
    }

    #[tokio::test]
    async fn test_apply_skips_ignorable() {
        let backend = MockBackend::sqlite();
        let adapter = SqlAdapter::new(backend.clone());
        let live = Schemas::new()
            .with_table(
                "orders",
                orders_table().column("legacy", ColumnSnapshot::new("TEXT", false)),
            )
            .with_index("orders", "orders_customer", vec!["customer"], false);
        let registry = {
            let mut registry = registry();
            registry
                .register(ModelSchema::new("Tag").column(ColumnProperty::new("label", TypeClass::String)))
                .unwrap();
            registry
        };

        let report = plan(&registry, &live, &adapter)
            .unwrap()
            .apply(&adapter, ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            backend.statements(),
            vec!["CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)"]
        );

        let report = plan(&registry, &live, &adapter)
            .unwrap()
            .apply(&adapter, ApplyOptions::with_ignorable())
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert!(backend
            .statements()
            .contains(&"ALTER TABLE orders DROP COLUMN legacy".to_string()));
    }
}
