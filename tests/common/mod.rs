//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use nl2sql::{
    BoxFuture, ColumnInfo, Completion, CompletionRequest, DatabaseError, LanguageModel, RowSet,
    SqlDatabase, SqlxDatabase,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub const PRODUCT_COUNT: usize = 42;

const CATEGORIES: [&str; 3] = ["electronics", "kitchen", "garden"];

/// In-memory SQLite pool with a `products` table of 42 rows and an empty
/// `suppliers` table.
pub async fn products_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    sqlx::query(
        "CREATE TABLE products (\
           id INTEGER PRIMARY KEY, \
           name TEXT NOT NULL, \
           category TEXT NOT NULL, \
           price REAL NOT NULL, \
           rating REAL)",
    )
    .execute(&pool)
    .await
    .expect("create products");
    sqlx::query("CREATE TABLE suppliers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .execute(&pool)
        .await
        .expect("create suppliers");

    for i in 1..=PRODUCT_COUNT {
        sqlx::query("INSERT INTO products (name, category, price, rating) VALUES (?1, ?2, ?3, ?4)")
            .bind(format!("Product {i}"))
            .bind(CATEGORIES[i % CATEGORIES.len()])
            .bind(i as f64 * 5.0)
            .bind(if i % 7 == 0 { None } else { Some(3.5) })
            .execute(&pool)
            .await
            .expect("insert product");
    }
    pool
}

pub async fn products_db() -> Arc<dyn SqlDatabase> {
    Arc::new(SqlxDatabase::from_sqlite_pool(products_pool().await))
}

/// Counts calls per method before delegating.
pub struct CountingDatabase {
    inner: Arc<dyn SqlDatabase>,
    pub list_calls: AtomicUsize,
    pub column_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl CountingDatabase {
    pub fn new(inner: Arc<dyn SqlDatabase>) -> Self {
        Self {
            inner,
            list_calls: AtomicUsize::new(0),
            column_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_queries(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.column_calls.load(Ordering::SeqCst)
    }
}

impl SqlDatabase for CountingDatabase {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, DatabaseError>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_tables()
    }

    fn table_columns<'a>(
        &'a self,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>, DatabaseError>> {
        self.column_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.table_columns(table)
    }

    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<RowSet, DatabaseError>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_rows(sql, limit)
    }

    fn explain<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DatabaseError>> {
        self.inner.explain(sql)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        self.inner.ping()
    }
}

/// Serves metadata normally but fails every query after the first
/// `healthy_fetches`, as if the connection dropped.
pub struct FlakyDatabase {
    inner: Arc<dyn SqlDatabase>,
    healthy_fetches: usize,
    fetches: AtomicUsize,
}

impl FlakyDatabase {
    pub fn new(inner: Arc<dyn SqlDatabase>, healthy_fetches: usize) -> Self {
        Self {
            inner,
            healthy_fetches,
            fetches: AtomicUsize::new(0),
        }
    }
}

impl SqlDatabase for FlakyDatabase {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn list_tables(&self) -> BoxFuture<'_, Result<Vec<String>, DatabaseError>> {
        self.inner.list_tables()
    }

    fn table_columns<'a>(
        &'a self,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>, DatabaseError>> {
        self.inner.table_columns(table)
    }

    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<RowSet, DatabaseError>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if n >= self.healthy_fetches {
            return Box::pin(async {
                Err(DatabaseError::connection("server closed the connection unexpectedly"))
            });
        }
        self.inner.fetch_rows(sql, limit)
    }

    fn explain<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DatabaseError>> {
        self.inner.explain(sql)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        self.inner.ping()
    }
}

/// A model whose calls never complete; only cancellation ends them.
#[derive(Default)]
pub struct StallingModel {
    pub calls: AtomicUsize,
}

impl LanguageModel for StallingModel {
    fn complete<'a>(
        &'a self,
        _request: &'a CompletionRequest,
    ) -> BoxFuture<'a, nl2sql::Result<Completion>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures::future::pending())
    }
}

pub fn tool_call(name: &str, input: &str) -> String {
    format!("Thought: I should use {name}.\nAction: {name}\nAction Input: {input}")
}

pub fn final_answer(text: &str) -> String {
    format!("Thought: I now know the final answer\nFinal Answer: {text}")
}
