//! Catalog and executor behaviour against a real (in-memory) SQLite database.

use std::sync::Arc;

use nl2sql::{
    CatalogOptions, DatabaseConfig, DatabaseErrorKind, Error, ExecutorOptions, QueryExecutor,
    SchemaCatalog, SqlDatabase, SqlxDatabase, ToolRegistry, ToolResult, DESCRIBE_TABLE,
    LIST_TABLES, RUN_QUERY,
};

mod common;
use common::CountingDatabase;

#[tokio::test]
async fn snapshot_is_cached_until_refresh() {
    let db = Arc::new(CountingDatabase::new(common::products_db().await));
    let catalog = SchemaCatalog::new(db.clone());

    let first = catalog.snapshot().await.unwrap();
    let after_first = db.metadata_queries();
    // one table list plus one column query per table
    assert_eq!(after_first, 3);

    let second = catalog.snapshot().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(db.metadata_queries(), after_first);
    assert_eq!(first.table_names(), ["products", "suppliers"]);

    let refreshed = catalog.refresh().await.unwrap();
    assert_eq!(*refreshed, *first);
    assert_eq!(db.metadata_queries(), after_first * 2);
}

#[tokio::test]
async fn describe_reports_columns_or_unknown_table() {
    let catalog = SchemaCatalog::new(common::products_db().await);

    let columns = catalog.describe("products").await.unwrap();
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "name", "category", "price", "rating"]);
    assert_eq!(columns[3].data_type, "REAL");
    assert_eq!(columns[4].nullable, Some(true));

    match catalog.describe("orders").await {
        Err(Error::UnknownTable { table, available }) => {
            assert_eq!(table, "orders");
            assert_eq!(available, ["products", "suppliers"]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn include_tables_limits_the_snapshot() {
    let catalog = SchemaCatalog::with_options(
        common::products_db().await,
        CatalogOptions::default().with_include_tables(["PRODUCTS"]),
    );
    let snapshot = catalog.snapshot().await.unwrap();
    assert_eq!(snapshot.table_names(), ["products"]);
}

#[tokio::test]
async fn table_info_renders_schema_and_samples() {
    let catalog = SchemaCatalog::with_options(
        common::products_db().await,
        CatalogOptions::default().with_sample_rows(2),
    );

    let info = catalog.table_info(&["products".to_string()]).await.unwrap();
    assert!(info.starts_with(
        "CREATE TABLE products (\n\tid INTEGER,\n\tname TEXT NOT NULL,\n\tcategory TEXT NOT NULL,\n\tprice REAL NOT NULL,\n\trating REAL\n)"
    ));
    assert!(info.contains("/*\n2 rows from products table:\nid\tname\tcategory\tprice\trating\n1\tProduct 1\t"));
    assert!(info.ends_with("*/"));

    let all = catalog.table_info(&[]).await.unwrap();
    assert!(all.contains("CREATE TABLE suppliers"));

    let none = SchemaCatalog::with_options(
        common::products_db().await,
        CatalogOptions::default().with_sample_rows(0),
    );
    assert!(!none
        .table_info(&["products".to_string()])
        .await
        .unwrap()
        .contains("/*"));
}

#[tokio::test]
async fn executor_limits_rows_and_flags_truncation() {
    let exec = QueryExecutor::new(
        common::products_db().await,
        ExecutorOptions::default().with_row_limit(5),
    );

    match exec.execute("SELECT id, rating FROM products ORDER BY id").await {
        ToolResult::Rows {
            columns,
            rows,
            truncated,
        } => {
            assert_eq!(columns, ["id", "rating"]);
            assert_eq!(rows.len(), 5);
            assert!(truncated);
            assert_eq!(rows[0]["id"], 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    match exec.execute("SELECT rating FROM products WHERE id = 7").await {
        ToolResult::Rows {
            rows, truncated, ..
        } => {
            assert!(!truncated);
            assert_eq!(rows[0]["rating"], serde_json::Value::Null);
        }
        other => panic!("unexpected {other:?}"),
    }

    let empty = exec.execute("SELECT id FROM products WHERE id < 0").await;
    assert_eq!(empty.render(), "[]");
}

#[tokio::test]
async fn executor_read_only_blocks_writes() {
    let db = common::products_db().await;
    let exec = QueryExecutor::new(db.clone(), ExecutorOptions::default().with_read_only(true));

    for sql in [
        "DELETE FROM products",
        "UPDATE products SET price = 0",
        "DROP TABLE products",
        "SELECT 1; DELETE FROM products",
    ] {
        let result = exec.execute(sql).await;
        assert!(result.is_error(), "{sql} was not rejected");
        assert!(!result.is_retryable());
    }

    let count = exec.execute("SELECT COUNT(*) AS n FROM products").await;
    assert_eq!(count.render(), r#"{"n":42}"#);
}

#[tokio::test]
async fn executor_allows_writes_when_not_read_only() {
    let exec = QueryExecutor::new(common::products_db().await, ExecutorOptions::default());

    let deleted = exec.execute("DELETE FROM products WHERE id > 40").await;
    assert_eq!(deleted.render(), "[]");
    let count = exec.execute("SELECT COUNT(*) AS n FROM products").await;
    assert_eq!(count.render(), r#"{"n":40}"#);
}

#[tokio::test]
async fn check_query_uses_explain() {
    let exec = QueryExecutor::new(common::products_db().await, ExecutorOptions::default());

    assert_eq!(
        exec.check("```sql\nSELECT name FROM products;\n```").await,
        ToolResult::text("OK")
    );
    let bad = exec.check("SELECT nope FROM products").await;
    assert!(bad.is_retryable());
    assert!(bad.render().contains("no such column"), "{}", bad.render());
}

#[tokio::test]
async fn check_query_rejects_batches_without_running_them() {
    let exec = QueryExecutor::new(common::products_db().await, ExecutorOptions::default());

    let checked = exec.check("SELECT 1; DELETE FROM products").await;
    assert!(checked.is_error());
    assert!(checked.is_retryable());

    let count = exec.execute("SELECT COUNT(*) AS n FROM products").await;
    assert_eq!(count.render(), r#"{"n":42}"#);
}

#[tokio::test]
async fn registry_dispatches_sql_tools() {
    let db = common::products_db().await;
    let catalog = Arc::new(SchemaCatalog::new(db.clone()));
    let exec = Arc::new(QueryExecutor::new(db, ExecutorOptions::default()));
    let registry = ToolRegistry::sql_tools(catalog, exec);

    let listed = registry.dispatch(LIST_TABLES, "").await;
    assert_eq!(listed.result, ToolResult::text("products, suppliers"));

    let described = registry.dispatch(DESCRIBE_TABLE, " products , suppliers ").await;
    let text = described.result.render();
    assert!(text.contains("CREATE TABLE products"));
    assert!(text.contains("CREATE TABLE suppliers"));

    let ran = registry
        .dispatch(&format!(" {RUN_QUERY} "), "SELECT MAX(price) AS top FROM products")
        .await;
    assert_eq!(ran.tool_name, RUN_QUERY);
    assert_eq!(ran.result.render(), r#"{"top":210.0}"#);

    let unknown = registry.dispatch("drop_database", "").await;
    assert!(unknown.is_protocol_violation);
    assert!(!unknown.result.is_retryable());
}

#[tokio::test]
async fn connects_to_sqlite_urls_and_rejects_others() {
    let db = SqlxDatabase::connect(&DatabaseConfig::new("sqlite::memory:"))
        .await
        .expect("sqlite connect");
    db.ping().await.unwrap();
    assert_eq!(db.backend(), "sqlite");
    assert!(db.list_tables().await.unwrap().is_empty());

    db.close().await;
    let err = db.ping().await.unwrap_err();
    assert_eq!(err.kind, DatabaseErrorKind::Connection);

    let err = SqlxDatabase::connect(&DatabaseConfig::new("mysql://localhost/db"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, DatabaseErrorKind::Unsupported);
}
