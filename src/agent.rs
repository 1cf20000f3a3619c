//! The bounded reasoning loop.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    catalog::{CatalogOptions, SchemaCatalog, DEFAULT_SAMPLE_ROWS},
    client::LanguageModel,
    conversation::Conversation,
    database::SqlDatabase,
    errors::{Error, RetryMetadata, ValidationError},
    executor::{ExecutorOptions, QueryExecutor},
    http::RetryConfig,
    parser::{parse_action, ParsedAction, OBSERVATION_PREFIX},
    prompt::{format_correction, system_prompt, PromptOptions},
    statement::clean_sql,
    telemetry::{LoopCallbacks, ModelCallMetrics, StateTransition, Telemetry, ToolDispatchMetrics},
    tools::{ToolRegistry, RUN_QUERY},
    types::{Completion, CompletionRequest},
};

pub use crate::executor::DEFAULT_ROW_LIMIT;

/// Default maximum number of model calls per question.
pub const DEFAULT_MAX_TURNS: usize = 15;

/// Default number of consecutive unparseable replies tolerated.
pub const DEFAULT_PARSE_RETRY_LIMIT: usize = 3;

/// Default cap on observation text sent back to the model.
pub const DEFAULT_MAX_OBSERVATION_CHARS: usize = 4000;

/// Usage tracking across one loop run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUsage {
    /// Total input tokens consumed (when the model reports usage).
    pub input_tokens: u64,
    /// Total output tokens generated.
    pub output_tokens: u64,
    /// Total tokens (input + output).
    pub total_tokens: u64,
    /// Number of language model attempts, retries included.
    pub llm_calls: usize,
    /// Number of tool dispatches.
    pub tool_calls: usize,
}

impl AgentUsage {
    fn record(&mut self, completion: &Completion) {
        if let Some(usage) = &completion.usage {
            self.input_tokens += usage.prompt_tokens;
            self.output_tokens += usage.completion_tokens;
            self.total_tokens += usage.total_tokens;
        }
    }
}

/// Loop behaviour knobs, passed explicitly to [`SqlAgent::new`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Model calls allowed per question.
    pub max_turns: usize,
    pub model_temperature: f32,
    /// Consecutive unparseable replies (or unknown tool names) tolerated
    /// before the loop gives up.
    pub parse_retry_limit: usize,
    /// Reject non-query SQL before it reaches the database.
    pub read_only: bool,
    pub row_limit: usize,
    /// Retry policy for `UpstreamUnavailable` / `UpstreamRateLimited`.
    pub upstream_retry: RetryConfig,
    pub sample_rows_in_table_info: usize,
    /// Appended to the system prompt.
    pub extra_instructions: Option<String>,
    pub max_observation_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            model_temperature: 0.0,
            parse_retry_limit: DEFAULT_PARSE_RETRY_LIMIT,
            read_only: false,
            row_limit: DEFAULT_ROW_LIMIT,
            upstream_retry: RetryConfig::default(),
            sample_rows_in_table_info: DEFAULT_SAMPLE_ROWS,
            extra_instructions: None,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
        }
    }
}

impl LoopConfig {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.model_temperature = temperature;
        self
    }

    pub fn with_parse_retry_limit(mut self, limit: usize) -> Self {
        self.parse_retry_limit = limit;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit.max(1);
        self
    }

    pub fn with_upstream_retry(mut self, retry: RetryConfig) -> Self {
        self.upstream_retry = retry;
        self
    }

    /// Total attempts per model call, first attempt included.
    pub fn with_upstream_attempts(mut self, attempts: u32) -> Self {
        self.upstream_retry.max_attempts = attempts.max(1);
        self
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows_in_table_info = sample_rows;
        self
    }

    pub fn with_extra_instructions(mut self, text: impl Into<String>) -> Self {
        self.extra_instructions = Some(text.into());
        self
    }

    pub fn with_max_observation_chars(mut self, max_chars: usize) -> Self {
        self.max_observation_chars = max_chars.max(1);
        self
    }

    pub fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions::default().with_sample_rows(self.sample_rows_in_table_info)
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
            .with_read_only(self.read_only)
            .with_row_limit(self.row_limit)
    }
}

/// Why a run ended without an answer. Each reason maps to a short, stable string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnparseableOutput,
    TurnLimitExceeded,
    UpstreamUnavailable,
    UpstreamRateLimited,
    /// The model endpoint rejected the request outright (bad model, bad key format...).
    ModelRequestFailed,
    Cancelled,
    EmptyQuestion,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnparseableOutput => "unparseable output exceeded retry limit",
            FailureReason::TurnLimitExceeded => "turn limit exceeded",
            FailureReason::UpstreamUnavailable => "language model unavailable",
            FailureReason::UpstreamRateLimited => "language model rate limited",
            FailureReason::ModelRequestFailed => "language model request failed",
            FailureReason::Cancelled => "cancelled",
            FailureReason::EmptyQuestion => "question is empty",
        }
    }

    fn from_model_error(err: &Error) -> Self {
        match err {
            Error::UpstreamUnavailable { .. } => FailureReason::UpstreamUnavailable,
            Error::UpstreamRateLimited { .. } => FailureReason::UpstreamRateLimited,
            Error::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::ModelRequestFailed,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the reasoning loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel,
    Dispatching { name: String, argument: String },
    Done(String),
    Failed(FailureReason),
}

impl LoopState {
    pub fn label(&self) -> &'static str {
        match self {
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::Dispatching { .. } => "dispatching",
            LoopState::Done(_) => "done",
            LoopState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Done(_) | LoopState::Failed(_))
    }
}

/// Caller-facing answer, serialized as `{"answer": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerResponse {
    Answer { answer: String },
    Error { error: String },
}

impl AnswerResponse {
    pub fn is_answer(&self) -> bool {
        matches!(self, AnswerResponse::Answer { .. })
    }
}

/// Terminal state of one run plus what it cost.
#[derive(Debug)]
pub struct LoopOutcome {
    pub run_id: Uuid,
    /// Always `Done` or `Failed`.
    pub state: LoopState,
    pub usage: AgentUsage,
    /// Model calls that consumed turn budget.
    pub turns_used: usize,
    /// Turn budget the run was configured with.
    pub max_turns: usize,
    /// Turns recorded in the conversation when the run ended.
    pub conversation_len: usize,
    /// Last SQL passed to `run_query`, after cleanup.
    pub last_sql: Option<String>,
    /// Underlying error for failed runs; never shown to end users as-is.
    pub error: Option<Error>,
}

impl LoopOutcome {
    pub fn answer(&self) -> Option<&str> {
        match &self.state {
            LoopState::Done(answer) => Some(answer),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match &self.state {
            LoopState::Failed(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn into_response(self) -> AnswerResponse {
        match self.state {
            LoopState::Done(answer) => AnswerResponse::Answer { answer },
            LoopState::Failed(reason) => AnswerResponse::Error {
                error: reason.as_str().to_string(),
            },
            // Not reachable from `SqlAgent::run`; kept total for hand-built outcomes.
            other => AnswerResponse::Error {
                error: format!("run ended in state {}", other.label()),
            },
        }
    }

    /// Converts to a `Result`, surfacing the underlying error on failure.
    pub fn into_result(self) -> Result<String, Error> {
        let max_turns = self.max_turns;
        match self.state {
            LoopState::Done(answer) => Ok(answer),
            LoopState::Failed(reason) => Err(self.error.unwrap_or(match reason {
                FailureReason::TurnLimitExceeded => Error::TurnLimitExceeded { max_turns },
                FailureReason::Cancelled => Error::Cancelled,
                other => Error::Validation(ValidationError::new(other.as_str())),
            })),
            other => Err(Error::Validation(ValidationError::new(format!(
                "run ended in state {}",
                other.label()
            )))),
        }
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    run_id: Uuid,
    usage: AgentUsage,
    turns_used: usize,
    parse_failures: usize,
    last_sql: Option<String>,
    error: Option<Error>,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            usage: AgentUsage::default(),
            turns_used: 0,
            parse_failures: 0,
            last_sql: None,
            error: None,
        }
    }

    fn fail(&mut self, reason: FailureReason, error: Error) -> LoopState {
        self.error = Some(error);
        LoopState::Failed(reason)
    }

    fn finish(
        self,
        state: LoopState,
        conversation: &Conversation,
        max_turns: usize,
    ) -> LoopOutcome {
        LoopOutcome {
            run_id: self.run_id,
            state,
            usage: self.usage,
            turns_used: self.turns_used,
            max_turns,
            conversation_len: conversation.len(),
            last_sql: self.last_sql,
            error: self.error,
        }
    }
}

/// Answers natural-language questions with a bounded model/tool loop.
///
/// One `SqlAgent` can serve many questions concurrently; each call to
/// [`run`](Self::run) owns its own conversation.
pub struct SqlAgent {
    model: Arc<dyn LanguageModel>,
    catalog: Arc<SchemaCatalog>,
    registry: Arc<ToolRegistry>,
    config: LoopConfig,
    telemetry: Telemetry,
}

impl fmt::Debug for SqlAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlAgent")
            .field("catalog", &self.catalog)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl SqlAgent {
    /// Builds an agent with the four SQL tools over `catalog`'s database.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        catalog: Arc<SchemaCatalog>,
        config: LoopConfig,
    ) -> Self {
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(catalog.database()),
            config.executor_options(),
        ));
        let registry = ToolRegistry::sql_tools(Arc::clone(&catalog), executor);
        Self {
            model,
            catalog,
            registry: Arc::new(registry),
            config,
            telemetry: Telemetry::default(),
        }
    }

    /// Builds the catalog from `db` using the config's sample-row setting.
    pub fn from_database(
        model: Arc<dyn LanguageModel>,
        db: Arc<dyn SqlDatabase>,
        config: LoopConfig,
    ) -> Self {
        let catalog = Arc::new(SchemaCatalog::with_options(db, config.catalog_options()));
        Self::new(model, catalog, config)
    }

    /// Replaces the tool set.
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_callbacks(mut self, callbacks: LoopCallbacks) -> Self {
        self.telemetry = Telemetry::new(Some(callbacks));
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs the loop to completion and returns `{answer}` or `{error}`.
    pub async fn answer_question(&self, question: &str) -> AnswerResponse {
        self.run(question, CancellationToken::new())
            .await
            .into_response()
    }

    /// Like [`run`](Self::run), but cancels the run once `timeout` elapses.
    pub async fn answer_question_with_timeout(
        &self,
        question: &str,
        timeout: Duration,
    ) -> LoopOutcome {
        let cancel = CancellationToken::new();
        let run = self.run(question, cancel.clone());
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => return outcome,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "deadline elapsed; cancelling run");
                cancel.cancel();
            }
        }
        run.await
    }

    /// Drives one question through the state machine.
    ///
    /// Cancelling `cancel` aborts at the next model call, tool call or backoff
    /// sleep and ends the run as `Failed(Cancelled)`.
    pub async fn run(&self, question: &str, cancel: CancellationToken) -> LoopOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "nl2sql.agent",
            %run_id,
            question_len = question.len(),
            max_turns = self.config.max_turns
        );
        self.run_inner(question.trim(), cancel, run_id)
            .instrument(span)
            .await
    }

    async fn run_inner(&self, question: &str, cancel: CancellationToken, run_id: Uuid) -> LoopOutcome {
        let mut run = RunState::new(run_id);
        let mut conversation = Conversation::new(self.system_prompt(), question);

        let mut state = if question.is_empty() {
            run.fail(
                FailureReason::EmptyQuestion,
                Error::Validation(ValidationError::new("question is required").with_field("question")),
            )
        } else {
            LoopState::AwaitingModel
        };

        loop {
            let from = state.label();
            let next = match state {
                LoopState::AwaitingModel => {
                    self.await_model(&mut run, &mut conversation, &cancel).await
                }
                LoopState::Dispatching { name, argument } => {
                    self.dispatch(&mut run, &mut conversation, &cancel, name, argument)
                        .await
                }
                terminal => {
                    match &terminal {
                        LoopState::Failed(reason) => tracing::info!(
                            turns = run.turns_used,
                            reason = reason.as_str(),
                            "run failed"
                        ),
                        _ => tracing::info!(turns = run.turns_used, "run answered"),
                    }
                    return run.finish(terminal, &conversation, self.config.max_turns);
                }
            };
            self.telemetry.record_transition(StateTransition {
                run_id,
                turn: run.turns_used,
                from,
                to: next.label(),
            });
            state = next;
        }
    }

    async fn await_model(
        &self,
        run: &mut RunState,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> LoopState {
        if cancel.is_cancelled() {
            return run.fail(FailureReason::Cancelled, Error::Cancelled);
        }
        if run.turns_used >= self.config.max_turns {
            tracing::warn!(max_turns = self.config.max_turns, "turn limit reached without an answer");
            return run.fail(
                FailureReason::TurnLimitExceeded,
                Error::TurnLimitExceeded {
                    max_turns: self.config.max_turns,
                },
            );
        }
        run.turns_used += 1;
        tracing::debug!(
            turn = run.turns_used,
            parse_failures = run.parse_failures,
            "awaiting model"
        );

        let request = CompletionRequest::new(conversation.to_messages(self.config.max_observation_chars))
            .with_temperature(self.config.model_temperature)
            .with_stop([format!("\n{OBSERVATION_PREFIX}")]);

        let completion = match self.call_model(run, &request, cancel).await {
            Ok(completion) => completion,
            Err(err) => {
                let reason = FailureReason::from_model_error(&err);
                if reason != FailureReason::Cancelled {
                    tracing::warn!(error = %err, "language model call failed");
                }
                return run.fail(reason, err);
            }
        };
        run.usage.record(&completion);

        let parsed = parse_action(&completion.text);
        conversation.push_model_output(completion.text, parsed.clone());
        match parsed {
            ParsedAction::ToolCall { name, argument } => LoopState::Dispatching { name, argument },
            ParsedAction::FinalAnswer { text } => LoopState::Done(text),
            ParsedAction::Unparseable { reason, .. } => {
                run.parse_failures += 1;
                tracing::warn!(
                    failures = run.parse_failures,
                    limit = self.config.parse_retry_limit,
                    %reason,
                    "unparseable model output"
                );
                if run.parse_failures > self.config.parse_retry_limit {
                    return run.fail(FailureReason::UnparseableOutput, Error::Unparseable { reason });
                }
                conversation.push_format_error(format_correction(&reason));
                LoopState::AwaitingModel
            }
        }
    }

    async fn dispatch(
        &self,
        run: &mut RunState,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
        name: String,
        argument: String,
    ) -> LoopState {
        let start = Instant::now();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return run.fail(FailureReason::Cancelled, Error::Cancelled);
            }
            executed = self.registry.dispatch(&name, &argument) => executed,
        };
        run.usage.tool_calls += 1;
        self.telemetry.record_tool_dispatch(ToolDispatchMetrics {
            run_id: run.run_id,
            turn: run.turns_used,
            tool: executed.tool_name.clone(),
            latency: start.elapsed(),
            is_error: executed.result.is_error(),
            is_retryable: executed.result.is_retryable(),
        });
        tracing::debug!(
            tool = %executed.tool_name,
            is_error = executed.result.is_error(),
            "tool dispatched"
        );

        if executed.is_protocol_violation {
            run.parse_failures += 1;
            tracing::warn!(
                tool = %name,
                failures = run.parse_failures,
                "model named an unknown tool"
            );
            if run.parse_failures > self.config.parse_retry_limit {
                return run.fail(
                    FailureReason::UnparseableOutput,
                    Error::ProtocolViolation {
                        tool: name,
                        available: self.registry.tool_names(),
                    },
                );
            }
        } else {
            run.parse_failures = 0;
            if executed.tool_name == RUN_QUERY {
                run.last_sql = Some(clean_sql(&argument));
            }
        }
        conversation.push_observation(executed.tool_name, executed.result);
        LoopState::AwaitingModel
    }

    /// One model turn, retrying upstream failures without consuming turns.
    async fn call_model(
        &self,
        run: &mut RunState,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, Error> {
        let retry = &self.config.upstream_retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt: u32 = 0;
        let mut previous_error: Option<String> = None;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.model.complete(request) => result,
            };
            run.usage.llm_calls += 1;
            let error = result.as_ref().err().map(|e| e.to_string());
            self.telemetry.record_model_call(ModelCallMetrics {
                run_id: run.run_id,
                turn: run.turns_used,
                attempt,
                latency: start.elapsed(),
                usage: result.as_ref().ok().and_then(|c| c.usage.clone()),
                error: error.clone(),
                retries: (attempt > 1).then(|| RetryMetadata {
                    attempts: attempt,
                    last_status: None,
                    last_error: previous_error.take(),
                }),
            });
            previous_error = error;

            match result {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_upstream_retryable() && attempt < max_attempts => {
                    let delay = retry.delay_for(attempt, err.retry_after());
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying language model call"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(with_retry_metadata(err, attempt)),
            }
        }
    }

    fn system_prompt(&self) -> String {
        system_prompt(
            &self.registry.specs(),
            &PromptOptions {
                dialect: self.catalog.database().backend(),
                top_k: self.config.row_limit,
                read_only: self.config.read_only,
                extra: self.config.extra_instructions.as_deref(),
            },
        )
    }
}

fn with_retry_metadata(err: Error, attempts: u32) -> Error {
    if attempts <= 1 {
        return err;
    }
    let meta = |message: &str| {
        Some(RetryMetadata {
            attempts,
            last_status: None,
            last_error: Some(message.to_string()),
        })
    };
    match err {
        Error::UpstreamUnavailable { message, .. } => Error::UpstreamUnavailable {
            retries: meta(&message),
            message,
        },
        Error::UpstreamRateLimited {
            message,
            retry_after,
            ..
        } => Error::UpstreamRateLimited {
            retries: meta(&message),
            message,
            retry_after,
        },
        other => other,
    }
}
