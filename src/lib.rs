//! Answer natural-language questions about a SQL database.
//!
//! A [`SqlAgent`] drives a bounded conversation with a language model. Each
//! turn the model either calls one of a fixed set of SQL tools (list tables,
//! describe a table, check a query, run a query) or produces a final answer.
//! Tool failures are fed back to the model as observations; the loop itself
//! stops on a turn budget, a run of unparseable output, upstream failure, or
//! cancellation, and always hands the caller either an answer or a short
//! failure reason.
// Allow large error types - the error envelope carries raw bodies for debugging
#![allow(clippy::result_large_err)]

/// Default OpenAI-compatible API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Default User-Agent header value.
pub(crate) const DEFAULT_CLIENT_HEADER: &str = concat!("nl2sql-rust/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// HTTP header name for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

mod agent;
mod catalog;
mod client;
mod config;
mod conversation;
pub mod database;
mod errors;
mod executor;
mod http;
mod mock;
mod parser;
mod prompt;
mod statement;
mod telemetry;
pub mod tools;
mod types;

pub use agent::{
    AgentUsage, AnswerResponse, FailureReason, LoopConfig, LoopOutcome, LoopState, SqlAgent,
    DEFAULT_MAX_OBSERVATION_CHARS, DEFAULT_MAX_TURNS, DEFAULT_PARSE_RETRY_LIMIT,
    DEFAULT_ROW_LIMIT,
};
pub use catalog::{CatalogOptions, SchemaCatalog, SchemaSnapshot};
pub use client::{Client, Config, LanguageModel};
pub use config::Settings;
pub use conversation::{Conversation, Turn, FORMAT_ERROR_TOOL};
pub use database::{
    ColumnInfo, DatabaseConfig, DatabaseError, DatabaseErrorKind, RowSet, SqlDatabase, SqlRow,
    SqlxDatabase,
};
pub use errors::{APIError, Error, Result, RetryMetadata, TransportError, TransportErrorKind};
pub use errors::ValidationError;
pub use executor::{ExecutorOptions, QueryExecutor};
pub use http::RetryConfig;
pub use mock::MockModel;
pub use parser::{parse_action, strip_observation, ParsedAction, FINAL_ANSWER_PREFIX};
pub use statement::{clean_sql, is_read_only, StatementKind};
pub use telemetry::{LoopCallbacks, ModelCallMetrics, StateTransition, ToolDispatchMetrics};
pub use tools::{
    sync_handler, BoxFuture, ToolExecutionResult, ToolHandler, ToolRegistry, ToolResult,
    ToolSpec, CHECK_QUERY, DESCRIBE_TABLE, LIST_TABLES, RUN_QUERY,
};
pub use types::{ChatMessage, Completion, CompletionRequest, MessageRole, Usage};
