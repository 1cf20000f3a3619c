//! Fixed SQL tools the reasoning loop can dispatch to.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::{
    catalog::SchemaCatalog, database::SqlRow, errors::Error, executor::QueryExecutor,
};

/// Lists the tables the model may query.
pub const LIST_TABLES: &str = "list_tables";
/// Shows columns and sample rows for one or more tables.
pub const DESCRIBE_TABLE: &str = "describe_table";
/// Dry-runs a query with `EXPLAIN`.
pub const CHECK_QUERY: &str = "check_query";
/// Executes a query and returns its rows.
pub const RUN_QUERY: &str = "run_query";

/// A boxed future type for async tool handlers and trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one tool invocation, as seen by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Rows {
        columns: Vec<String>,
        rows: Vec<SqlRow>,
        truncated: bool,
    },
    Text(String),
    ExecutionError {
        message: String,
        /// True when the model can reasonably recover (fix the SQL, pick
        /// another table, try again later).
        is_retryable: bool,
    },
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult::Text(text.into())
    }

    pub fn error(message: impl Into<String>, is_retryable: bool) -> Self {
        ToolResult::ExecutionError {
            message: message.into(),
            is_retryable,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::ExecutionError { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolResult::ExecutionError {
                is_retryable: true,
                ..
            }
        )
    }

    /// Text the model reads as the observation for this result.
    ///
    /// Rows render one JSON object per line, followed by a truncation marker
    /// when the row limit cut the result short.
    pub fn render(&self) -> String {
        match self {
            ToolResult::Rows {
                rows, truncated, ..
            } => {
                if rows.is_empty() {
                    return "[]".to_string();
                }
                let mut out = rows
                    .iter()
                    .map(|row| {
                        serde_json::to_string(row).unwrap_or_else(|_| format!("{row:?}"))
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if *truncated {
                    out.push_str(&format!("\n... (truncated to {} rows)", rows.len()));
                }
                out
            }
            ToolResult::Text(text) => text.clone(),
            ToolResult::ExecutionError { message, .. } => format!("Error: {message}"),
        }
    }
}

/// Shorthand for [`ToolResult::render`].
pub fn render_observation(result: &ToolResult) -> String {
    result.render()
}

/// Name, description and argument hint of a tool, embedded in the system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Handler function type for tool execution.
/// Receives the raw `Action Input` text and resolves to a [`ToolResult`].
pub type ToolHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// Result of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub tool_name: String,
    pub result: ToolResult,
    /// True when the model named a tool that is not registered.
    pub is_protocol_violation: bool,
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// Ordered registry mapping tool names to handlers.
///
/// Registration order is the order tools are listed in the system prompt.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any existing tool with the same name.
    pub fn register(mut self, spec: ToolSpec, handler: ToolHandler) -> Self {
        self.tools.retain(|t| t.spec.name != spec.name);
        self.tools.push(RegisteredTool { spec, handler });
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.spec.name == name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec.name.clone()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The four SQL tools over a shared catalog and executor.
    pub fn sql_tools(catalog: Arc<SchemaCatalog>, executor: Arc<QueryExecutor>) -> Self {
        let list_catalog = Arc::clone(&catalog);
        let list: ToolHandler = Arc::new(move |_input: String| {
            let catalog = Arc::clone(&list_catalog);
            Box::pin(async move {
                match catalog.snapshot().await {
                    Ok(snapshot) => ToolResult::Text(snapshot.table_names().join(", ")),
                    Err(err) => ToolResult::error(err.to_string(), true),
                }
            })
        });

        let describe_catalog = catalog;
        let describe: ToolHandler = Arc::new(move |input: String| {
            let catalog = Arc::clone(&describe_catalog);
            Box::pin(async move {
                let tables: Vec<String> = input
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                if tables.is_empty() {
                    return ToolResult::error(
                        format!("expected a table name; call {LIST_TABLES} to see them"),
                        true,
                    );
                }
                match catalog.table_info(&tables).await {
                    Ok(info) => ToolResult::Text(info),
                    Err(Error::UnknownTable { table, available }) => ToolResult::error(
                        format!(
                            "unknown table '{table}'. Available tables: {}",
                            available.join(", ")
                        ),
                        true,
                    ),
                    Err(err) => ToolResult::error(err.to_string(), true),
                }
            })
        });

        let check_executor = Arc::clone(&executor);
        let check: ToolHandler = Arc::new(move |input: String| {
            let executor = Arc::clone(&check_executor);
            Box::pin(async move { executor.check(&input).await })
        });

        let run_executor = executor;
        let run: ToolHandler = Arc::new(move |input: String| {
            let executor = Arc::clone(&run_executor);
            Box::pin(async move { executor.execute(&input).await })
        });

        Self::new()
            .register(
                ToolSpec::new(
                    LIST_TABLES,
                    "Input is an empty string, output is a comma-separated list of tables in the database.",
                ),
                list,
            )
            .register(
                ToolSpec::new(
                    DESCRIBE_TABLE,
                    format!(
                        "Input is a comma-separated list of tables, output is the schema and sample rows for those tables. \
                         Be sure that the tables actually exist by calling {LIST_TABLES} first! \
                         Example Input: table1, table2, table3"
                    ),
                ),
                describe,
            )
            .register(
                ToolSpec::new(
                    CHECK_QUERY,
                    format!(
                        "Use this tool to double check if your query is correct before executing it. \
                         Input is a SQL query, output is OK or the database error. \
                         Always use this tool before executing a query with {RUN_QUERY}!"
                    ),
                ),
                check,
            )
            .register(
                ToolSpec::new(
                    RUN_QUERY,
                    format!(
                        "Input to this tool is a detailed and correct SQL query, output is a result from the database. \
                         If the query is not correct, an error message will be returned. \
                         If an error is returned, rewrite the query, check the query, and try again. \
                         If you encounter an issue with Unknown column 'xxxx' in 'field list', use {DESCRIBE_TABLE} to query the correct table fields."
                    ),
                ),
                run,
            )
    }

    /// Dispatches one tool call by name.
    ///
    /// Unknown names yield a non-retryable error listing the available tools
    /// and are flagged as protocol violations.
    pub async fn dispatch(&self, name: &str, input: &str) -> ToolExecutionResult {
        let name = name.trim();
        let Some(tool) = self.tools.iter().find(|t| t.spec.name == name) else {
            let err = Error::ProtocolViolation {
                tool: name.to_string(),
                available: self.tool_names(),
            };
            return ToolExecutionResult {
                tool_name: name.to_string(),
                result: ToolResult::error(err.to_string(), false),
                is_protocol_violation: true,
            };
        };

        let result = (tool.handler)(input.to_string()).await;
        ToolExecutionResult {
            tool_name: tool.spec.name.clone(),
            result,
            is_protocol_violation: false,
        }
    }
}

/// Creates a tool handler from a synchronous function.
pub fn sync_handler<F>(f: F) -> ToolHandler
where
    F: Fn(&str) -> ToolResult + Send + Sync + 'static,
{
    Arc::new(move |input: String| {
        let result = f(&input);
        Box::pin(async move { result })
    })
}

/// Renders a JSON value the way observations show scalar cells.
pub(crate) fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> SqlRow {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = ToolRegistry::new()
            .register(ToolSpec::new("b", "second"), sync_handler(|_| ToolResult::text("b")))
            .register(ToolSpec::new("a", "first"), sync_handler(|_| ToolResult::text("a")));

        assert_eq!(registry.tool_names(), vec!["b", "a"]);
        assert!(registry.has("a"));
        assert!(!registry.has("c"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registering_same_name_replaces() {
        let registry = ToolRegistry::new()
            .register(ToolSpec::new("a", "old"), sync_handler(|_| ToolResult::text("old")))
            .register(ToolSpec::new("a", "new"), sync_handler(|_| ToolResult::text("new")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.specs()[0].description, "new");
    }

    #[tokio::test]
    async fn dispatch_passes_input_through() {
        let registry = ToolRegistry::new().register(
            ToolSpec::new("echo", "echoes"),
            sync_handler(|input| ToolResult::text(input.to_uppercase())),
        );
        let out = registry.dispatch(" echo ", "hello").await;
        assert!(!out.is_protocol_violation);
        assert_eq!(out.tool_name, "echo");
        assert_eq!(out.result, ToolResult::text("HELLO"));
    }

    #[tokio::test]
    async fn unknown_tool_is_protocol_violation() {
        let registry = ToolRegistry::new()
            .register(ToolSpec::new(RUN_QUERY, "runs"), sync_handler(|_| ToolResult::text("")));
        let out = registry.dispatch("drop_database", "").await;
        assert!(out.is_protocol_violation);
        assert!(out.result.is_error());
        assert!(!out.result.is_retryable());
        let rendered = out.result.render();
        assert!(rendered.contains("drop_database"));
        assert!(rendered.contains(RUN_QUERY));
    }

    #[test]
    fn rows_render_one_object_per_line() {
        let result = ToolResult::Rows {
            columns: vec!["name".into(), "price".into()],
            rows: vec![
                row(json!({"name": "lamp", "price": 19.5})),
                row(json!({"name": "desk", "price": null})),
            ],
            truncated: false,
        };
        assert_eq!(
            result.render(),
            "{\"name\":\"lamp\",\"price\":19.5}\n{\"name\":\"desk\",\"price\":null}"
        );
    }

    #[test]
    fn truncated_rows_carry_marker() {
        let result = ToolResult::Rows {
            columns: vec!["n".into()],
            rows: vec![row(json!({"n": 1})), row(json!({"n": 2}))],
            truncated: true,
        };
        assert!(result.render().ends_with("... (truncated to 2 rows)"));
    }

    #[test]
    fn empty_rows_and_errors_render() {
        let empty = ToolResult::Rows {
            columns: vec![],
            rows: vec![],
            truncated: false,
        };
        assert_eq!(render_observation(&empty), "[]");
        assert_eq!(
            ToolResult::error("no such table: prods", true).render(),
            "Error: no such table: prods"
        );
    }

    #[test]
    fn cells_render_null_and_strings_bare() {
        assert_eq!(value_to_cell(&Value::Null), "NULL");
        assert_eq!(value_to_cell(&json!("lamp")), "lamp");
        assert_eq!(value_to_cell(&json!(3.5)), "3.5");
    }
}
