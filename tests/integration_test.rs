use polyquery::prelude::*;
use serde_json::{json, Value};

fn record(value: Value) -> Record {
    Record::from_value(value).unwrap()
}

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use super::*;
    use futures::TryStreamExt;

    type SqliteConnection = Connection<SqliteAdapter>;

    async fn connect() -> SqliteConnection {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Connection::<SqliteAdapter>::connect(ConnectionConfig::default()).await.unwrap()
    }

    async fn orders() -> SqliteConnection {
        let connection = connect().await;
        connection
            .register(
                ModelSchema::new("Order")
                    .column(ColumnProperty::new("customer", TypeClass::String))
                    .column(ColumnProperty::new("price", TypeClass::Number))
                    .column(ColumnProperty::new("quantity", TypeClass::Integer))
                    .column(ColumnProperty::new("note", TypeClass::String)),
            )
            .unwrap();
        connection.apply_schemas().await.unwrap();

        connection
            .create_bulk(
                "Order",
                vec![
                    record(json!({ "customer": "A", "price": 5, "quantity": 1, "note": "50%_off deal" })),
                    record(json!({ "customer": "A", "price": 7, "quantity": 2, "note": "5000 off" })),
                    record(json!({ "customer": "B", "price": 3, "quantity": 3 })),
                ],
                None,
            )
            .await
            .unwrap();
        connection
    }

    async fn count(connection: &SqliteConnection, condition: Value) -> u64 {
        connection
            .query("Order")
            .unwrap()
            .where_json(condition)
            .unwrap()
            .count()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_total_and_keyed_groups() {
        let connection = orders().await;

        let totals = connection
            .query("Order")
            .unwrap()
            .where_json(json!({ "price": { "$lt": 10 } }))
            .unwrap()
            .group_json(polyquery::GroupBy::none(), &json!({ "count": { "$sum": 1 }, "total": { "$sum": "$price" } }))
            .unwrap()
            .exec()
            .await
            .unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].get_i64("count"), Some(3));
        assert_eq!(totals[0].get_f64("total"), Some(15.0));

        let per_customer = connection
            .query("Order")
            .unwrap()
            .where_json(json!({ "price": { "$lt": 10 } }))
            .unwrap()
            .group_json("customer", &json!({ "count": { "$sum": 1 } }))
            .unwrap()
            .order("customer")
            .exec()
            .await
            .unwrap();
        let rows: Vec<(Option<String>, Option<i64>)> = per_customer
            .iter()
            .map(|r| (r.get_string("customer"), r.get_i64("count")))
            .collect();
        assert_eq!(
            rows,
            vec![(Some("A".to_string()), Some(2)), (Some("B".to_string()), Some(1))]
        );
    }

    #[tokio::test]
    async fn test_condition_after_group_filters_groups() {
        let connection = orders().await;

        let rows = connection
            .query("Order")
            .unwrap()
            .group_json("customer", &json!({ "total": { "$sum": "$price" } }))
            .unwrap()
            .where_json(json!({ "total": { "$gte": 10 } }))
            .unwrap()
            .exec()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_string("customer"), Some("A".to_string()));
        assert_eq!(rows[0].get_f64("total"), Some(12.0));
    }

    #[tokio::test]
    async fn test_condition_semantics() {
        let connection = orders().await;

        // unparseable numbers compare against the sentinel
        assert_eq!(count(&connection, json!({ "quantity": { "$gt": "not-a-number" } })).await, 3);

        assert_eq!(count(&connection, json!({ "customer": [] })).await, 0);
        assert_eq!(count(&connection, json!({ "customer": { "$in": [] } })).await, 0);
        assert_eq!(count(&connection, json!({ "customer": { "$not": [] } })).await, 3);

        assert_eq!(count(&connection, json!({ "note": { "$contains": "50%_off" } })).await, 1);
        assert_eq!(count(&connection, json!({ "note": { "$startswith": "50" } })).await, 2);

        assert_eq!(count(&connection, json!({ "customer": { "$not": { "$not": "A" } } })).await, 2);
        assert_eq!(count(&connection, json!({ "note": null })).await, 1);
        assert_eq!(count(&connection, json!({ "note": { "$not": null } })).await, 2);
        assert_eq!(count(&connection, json!({ "note": { "$not": { "$not": null } } })).await, 1);

        let nested = count(
            &connection,
            json!({ "$and": [{ "$and": [{ "customer": "A" }, { "price": { "$gt": 4 } }] }, { "quantity": 2 }] }),
        )
        .await;
        let flat = count(
            &connection,
            json!({ "$and": [{ "customer": "A" }, { "price": { "$gt": 4 } }, { "quantity": 2 }] }),
        )
        .await;
        assert_eq!((nested, flat), (1, 1));

        assert_eq!(count(&connection, json!({ "$or": [{ "customer": "B" }, { "price": 7 }] })).await, 2);
        assert_eq!(count(&connection, json!({ "price": { "$cgt": "quantity" } })).await, 2);

        let unknown = connection.query("Order").unwrap().where_json(json!({ "colour": "red" })).unwrap().exec().await;
        assert!(matches!(unknown, Err(QueryError::UnknownColumn(_))));
    }

    #[tokio::test]
    async fn test_order_window_and_projection() {
        let connection = orders().await;

        let rows = connection
            .query("Order")
            .unwrap()
            .select("customer")
            .order("-price unknown_column")
            .skip(1)
            .exec()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_string("customer"), Some("A".to_string()));
        assert_eq!(rows[1].get_string("customer"), Some("B".to_string()));
        assert!(rows[0].id().is_some());
        assert!(!rows[0].contains("price"));
    }

    #[tokio::test]
    async fn test_update_upsert_and_delete() {
        let connection = orders().await;

        let updated = connection
            .query("Order")
            .unwrap()
            .where_json(json!({ "customer": "A" }))
            .unwrap()
            .update(record(json!({ "quantity": { "$inc": 10 } })))
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(count(&connection, json!({ "quantity": { "$gte": 11 } })).await, 2);

        connection
            .query("Order")
            .unwrap()
            .where_json(json!({ "customer": "C" }))
            .unwrap()
            .upsert(record(json!({ "price": 9, "quantity": { "$inc": 4 } })))
            .await
            .unwrap();
        let inserted = connection
            .query("Order")
            .unwrap()
            .where_json(json!({ "customer": "C" }))
            .unwrap()
            .first()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inserted.get_i64("quantity"), Some(4));
        assert_eq!(inserted.get_f64("price"), Some(9.0));

        let deleted = connection
            .query("Order")
            .unwrap()
            .order("-price")
            .limit(1)
            .delete()
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(count(&connection, json!({ "customer": "C" })).await, 0);
        assert_eq!(count(&connection, json!({})).await, 3);
    }

    #[tokio::test]
    async fn test_full_update_clears_omitted_columns() {
        let connection = orders().await;
        let first = connection.query("Order").unwrap().order("id").first().await.unwrap().unwrap();
        let id = first.id().cloned().unwrap();

        connection
            .update("Order", record(json!({ "id": id.clone(), "customer": "Z" })), None)
            .await
            .unwrap();
        let reloaded = connection.find("Order", id).await.unwrap();
        assert_eq!(reloaded.get_string("customer"), Some("Z".to_string()));
        assert_eq!(reloaded.get_value("price"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_blob_survives_read_and_resave() {
        let connection = connect().await;
        connection
            .register(
                ModelSchema::new("Attachment")
                    .column(ColumnProperty::new("name", TypeClass::String))
                    .column(ColumnProperty::new("data", TypeClass::Blob)),
            )
            .unwrap();
        connection.apply_schemas().await.unwrap();

        let id = connection
            .create("Attachment", record(json!({ "name": "greeting", "data": "aGVsbG8=" })), None)
            .await
            .unwrap();
        let loaded = connection.find("Attachment", id.clone()).await.unwrap();
        assert_eq!(loaded.get_string("data"), Some("aGVsbG8=".to_string()));

        connection.update("Attachment", loaded.clone(), None).await.unwrap();
        let resaved = connection.find("Attachment", id.clone()).await.unwrap();
        assert_eq!(resaved.get_string("data"), Some("aGVsbG8=".to_string()));

        let from_bytes = connection
            .create("Attachment", record(json!({ "name": "raw", "data": [104, 105] })), None)
            .await
            .unwrap();
        let loaded = connection.find("Attachment", from_bytes).await.unwrap();
        assert_eq!(loaded.get_string("data"), Some("aGk=".to_string()));

        let out_of_range = connection
            .create("Attachment", record(json!({ "name": "bad", "data": [104, 361] })), None)
            .await;
        assert!(matches!(out_of_range, Err(QueryError::Serialization(_))));
        let not_base64 = connection
            .create("Attachment", record(json!({ "name": "bad", "data": "hello" })), None)
            .await;
        assert!(matches!(not_base64, Err(QueryError::Serialization(_))));
        assert_eq!(connection.query("Attachment").unwrap().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_not_found_and_duplicate_key() {
        let connection = connect().await;
        connection
            .register(ModelSchema::new("User").column(ColumnProperty::new("email", TypeClass::String).unique()))
            .unwrap();
        connection.apply_schemas().await.unwrap();

        let missing = connection.find("User", 999).await;
        assert!(matches!(missing, Err(QueryError::NotFound(_))));

        connection
            .create("User", record(json!({ "email": "ann@example.com" })), None)
            .await
            .unwrap();
        let duplicate = connection
            .create("User", record(json!({ "email": "ann@example.com" })), None)
            .await;
        match duplicate {
            Err(QueryError::DuplicateKey { column, .. }) => assert_eq!(column.as_deref(), Some("email")),
            other => panic!("expected duplicate key, got {:?}", other),
        }

        let many = connection.query("User").unwrap().find_many(vec![json!(1), json!(2)]).exec().await;
        assert!(matches!(many, Err(QueryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_nested_paths_round_trip() {
        let connection = connect().await;
        connection
            .register(
                ModelSchema::new("Shop")
                    .column(ColumnProperty::new("address.city", TypeClass::String))
                    .column(ColumnProperty::new("tags", TypeClass::String).array())
                    .column(ColumnProperty::new("open", TypeClass::Boolean)),
            )
            .unwrap();
        connection.apply_schemas().await.unwrap();

        let id = connection
            .create(
                "Shop",
                record(json!({ "address": { "city": "Lyon" }, "tags": ["books", "cafe"], "open": true })),
                None,
            )
            .await
            .unwrap();

        let shop = connection
            .query("Shop")
            .unwrap()
            .where_json(json!({ "address.city": "Lyon" }))
            .unwrap()
            .first()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shop.id(), Some(&id));
        assert_eq!(shop.get_path("address.city"), Some(&json!("Lyon")));
        assert_eq!(shop.get_value("tags"), Some(&json!(["books", "cafe"])));
        assert_eq!(shop.get_bool("open"), Some(true));
    }

    #[tokio::test]
    async fn test_join_qualified_conditions() {
        let connection = connect().await;
        connection
            .register(
                ModelSchema::new("User")
                    .column(ColumnProperty::new("name", TypeClass::String))
                    .has_many("Post"),
            )
            .unwrap();
        connection
            .register(
                ModelSchema::new("Post")
                    .column(ColumnProperty::new("name", TypeClass::String))
                    .belongs_to("User", Integrity::Ignore),
            )
            .unwrap();
        connection.apply_schemas().await.unwrap();

        let ann = connection.create("User", record(json!({ "name": "Ann" })), None).await.unwrap();
        let bob = connection.create("User", record(json!({ "name": "Bob" })), None).await.unwrap();
        for (title, author) in [("first", &ann), ("second", &ann), ("third", &bob)] {
            connection
                .create("Post", record(json!({ "name": title, "user_id": author })), None)
                .await
                .unwrap();
        }

        let posts = connection
            .query("Post")
            .unwrap()
            .join("User")
            .unwrap()
            .where_json(json!({ "User.name": "Ann" }))
            .unwrap()
            .order("name")
            .exec()
            .await
            .unwrap();
        let titles: Vec<Option<String>> = posts.iter().map(|p| p.get_string("name")).collect();
        assert_eq!(titles, vec![Some("first".to_string()), Some("second".to_string())]);

        let unknown = connection
            .query("Post")
            .unwrap()
            .join("User")
            .unwrap()
            .where_json(json!({ "User.title": "x" }))
            .unwrap()
            .exec()
            .await;
        assert!(matches!(unknown, Err(QueryError::UnknownColumn(_))));
    }

    async fn family(posts: Integrity, likes: Integrity) -> (SqliteConnection, Value) {
        let connection = connect().await;
        connection
            .register(ModelSchema::new("User").column(ColumnProperty::new("name", TypeClass::String)))
            .unwrap();
        connection.register(ModelSchema::new("Post").belongs_to("User", posts)).unwrap();
        connection.register(ModelSchema::new("Like").belongs_to("User", likes)).unwrap();
        connection.apply_schemas().await.unwrap();

        let user = connection.create("User", record(json!({ "name": "Ann" })), None).await.unwrap();
        connection.create("Post", record(json!({ "user_id": user })), None).await.unwrap();
        connection.create("Like", record(json!({ "user_id": user })), None).await.unwrap();
        (connection, user)
    }

    #[tokio::test]
    async fn test_emulated_integrity() {
        let (connection, user) = family(Integrity::Restrict, Integrity::Cascade).await;
        let blocked = connection.query("User").unwrap().find(user.clone()).delete().await;
        assert!(matches!(blocked, Err(QueryError::IntegrityViolation(_))));
        assert_eq!(connection.query("Like").unwrap().count().await.unwrap(), 1);

        let (connection, user) = family(Integrity::Cascade, Integrity::Nullify).await;
        assert_eq!(connection.query("User").unwrap().find(user).delete().await.unwrap(), 1);
        assert_eq!(connection.query("Post").unwrap().count().await.unwrap(), 0);
        let like = connection.query("Like").unwrap().first().await.unwrap().unwrap();
        assert_eq!(like.get_value("user_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_transactions() {
        let connection = orders().await;

        let mut transaction = connection.transaction(None).await.unwrap();
        connection
            .create("Order", record(json!({ "customer": "T", "price": 1 })), Some(&transaction))
            .await
            .unwrap();
        let inside = connection
            .query("Order")
            .unwrap()
            .transaction(&transaction)
            .where_json(json!({ "customer": "T" }))
            .unwrap()
            .count()
            .await
            .unwrap();
        assert_eq!(inside, 1);
        connection.rollback(&mut transaction).await.unwrap();
        assert_eq!(count(&connection, json!({ "customer": "T" })).await, 0);

        let finished = connection.query("Order").unwrap().transaction(&transaction).count().await;
        assert!(matches!(finished, Err(QueryError::TransactionFinished)));

        let mut transaction = connection.transaction(Some(IsolationLevel::Serializable)).await.unwrap();
        connection
            .create("Order", record(json!({ "customer": "T", "price": 1 })), Some(&transaction))
            .await
            .unwrap();
        connection.commit(&mut transaction).await.unwrap();
        assert_eq!(count(&connection, json!({ "customer": "T" })).await, 1);
        assert!(matches!(
            connection.commit(&mut transaction).await,
            Err(QueryError::TransactionFinished)
        ));
    }

    #[tokio::test]
    async fn test_stream_records() {
        let connection = orders().await;
        let stream = connection
            .query("Order")
            .unwrap()
            .order("price")
            .stream()
            .await
            .unwrap();
        let prices: Vec<Option<f64>> = stream
            .map_ok(|record| record.get_f64("price"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(prices, vec![Some(3.0), Some(5.0), Some(7.0)]);
    }

    #[tokio::test]
    async fn test_schema_diff_is_stable_and_safe() {
        let connection = connect().await;
        connection
            .adapter()
            .run_schema_statement("CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, customer TEXT, legacy TEXT)")
            .await
            .unwrap();
        connection
            .register(
                ModelSchema::new("Order")
                    .column(ColumnProperty::new("customer", TypeClass::String))
                    .column(ColumnProperty::new("price", TypeClass::Number)),
            )
            .unwrap();

        let first = connection.get_schema_changes().await.unwrap();
        let second = connection.get_schema_changes().await.unwrap();
        assert_eq!(first.messages(), second.messages());

        let add = first.required().find(|c| c.message.contains("orders.price"));
        assert!(add.is_some());
        let remove = first.messages().into_iter().find(|m| m.contains("orders.legacy"));
        assert!(remove.is_some());
        assert!(first.required().all(|c| !c.message.contains("legacy")));

        let report = connection.apply_schemas().await.unwrap();
        assert!(report.skipped.iter().any(|c| c.message.contains("legacy")));

        let after = connection.get_schema_changes().await.unwrap();
        assert_eq!(after.required().count(), 0);
        assert!(after.messages().iter().any(|m| m.contains("legacy")));
    }
}

#[cfg(feature = "postgres")]
mod postgres_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_group_and_having() {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://postgres@localhost/polyquery".to_string());
        let connection = Connection::<PostgresAdapter>::connect(ConnectionConfig::new(url)).await.unwrap();
        connection
            .register(
                ModelSchema::new("Order")
                    .column(ColumnProperty::new("customer", TypeClass::String))
                    .column(ColumnProperty::new("price", TypeClass::Number)),
            )
            .unwrap();
        connection.adapter().drop_table("orders").await.ok();
        connection.apply_schemas().await.unwrap();

        for (customer, price) in [("A", 5), ("A", 7), ("B", 3)] {
            connection
                .create("Order", record(json!({ "customer": customer, "price": price })), None)
                .await
                .unwrap();
        }
        let rows = connection
            .query("Order")
            .unwrap()
            .group_json("customer", &json!({ "total": { "$sum": "$price" } }))
            .unwrap()
            .where_json(json!({ "total": { "$gte": 10 } }))
            .unwrap()
            .exec()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_f64("total"), Some(12.0));
    }
}
