use std::{sync::Arc, time::Instant};

use crate::{
    database::SqlDatabase,
    statement::{classify, clean_sql, statement_count},
    tools::ToolResult,
};

/// Default maximum number of rows returned to the model per query.
pub const DEFAULT_ROW_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Reject anything that is not a query before it reaches the database.
    pub read_only: bool,
    pub row_limit: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            row_limit: DEFAULT_ROW_LIMIT,
        }
    }
}

impl ExecutorOptions {
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit.max(1);
        self
    }
}

/// Runs model-written SQL against the database, one statement per call.
///
/// Stateless across calls; share it behind an `Arc`.
pub struct QueryExecutor {
    db: Arc<dyn SqlDatabase>,
    options: ExecutorOptions,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("backend", &self.db.backend())
            .field("options", &self.options)
            .finish()
    }
}

impl QueryExecutor {
    pub fn new(db: Arc<dyn SqlDatabase>, options: ExecutorOptions) -> Self {
        Self { db, options }
    }

    pub fn options(&self) -> ExecutorOptions {
        self.options
    }

    /// Executes `sql` and returns at most `row_limit` rows.
    ///
    /// Never fails: database problems come back as
    /// [`ToolResult::ExecutionError`] so the model can react to them.
    pub async fn execute(&self, sql: &str) -> ToolResult {
        let sql = match self.prepare(sql) {
            Ok(sql) => sql,
            Err(rejected) => return rejected,
        };

        let limit = self.options.row_limit;
        let start = Instant::now();
        match self.db.fetch_rows(&sql, limit.saturating_add(1)).await {
            Ok(mut set) => {
                let truncated = set.rows.len() > limit;
                set.rows.truncate(limit);
                tracing::debug!(
                    rows = set.rows.len(),
                    truncated,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query executed"
                );
                ToolResult::Rows {
                    columns: set.columns,
                    rows: set.rows,
                    truncated,
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "query failed");
                ToolResult::error(err.to_string(), err.is_retryable())
            }
        }
    }

    /// Dry-runs `sql` with `EXPLAIN`. Returns `Text("OK")` when the database
    /// accepts the statement. Batches are rejected before the database sees
    /// them, since `EXPLAIN` only covers the first statement of a batch.
    pub async fn check(&self, sql: &str) -> ToolResult {
        let sql = match self.prepare(sql) {
            Ok(sql) => sql,
            Err(rejected) => return rejected,
        };
        match self.db.explain(&sql).await {
            Ok(()) => ToolResult::text("OK"),
            Err(err) => ToolResult::error(err.to_string(), err.is_retryable()),
        }
    }

    fn prepare(&self, raw: &str) -> Result<String, ToolResult> {
        let sql = clean_sql(raw);
        if sql.is_empty() {
            return Err(ToolResult::error(
                "empty SQL query; provide a single SQL statement",
                true,
            ));
        }
        if self.options.read_only {
            let kind = classify(&sql);
            if !kind.is_read_only() {
                tracing::warn!(?kind, "rejected non-query statement in read-only mode");
                return Err(ToolResult::error(
                    "only read-only queries (SELECT, WITH, VALUES, EXPLAIN, SHOW) are allowed",
                    false,
                ));
            }
        }
        match statement_count(&sql) {
            Ok(1) => Ok(sql),
            Ok(n) => Err(ToolResult::error(
                format!("expected exactly one SQL statement, got {n}"),
                true,
            )),
            Err(reason) => Err(ToolResult::error(format!("could not read SQL: {reason}"), true)),
        }
    }
}
