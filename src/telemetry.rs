use std::{fmt, sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{types::Usage, RetryMetadata};

/// User-provided callbacks for observing the reasoning loop without taking on
/// a tracing subscriber.
#[derive(Clone, Default)]
pub struct LoopCallbacks {
    pub model_call: Option<Arc<dyn Fn(ModelCallMetrics) + Send + Sync>>,
    pub tool_dispatch: Option<Arc<dyn Fn(ToolDispatchMetrics) + Send + Sync>>,
    pub state_transition: Option<Arc<dyn Fn(StateTransition) + Send + Sync>>,
}

impl LoopCallbacks {
    pub fn on_model_call(mut self, f: impl Fn(ModelCallMetrics) + Send + Sync + 'static) -> Self {
        self.model_call = Some(Arc::new(f));
        self
    }

    pub fn on_tool_dispatch(
        mut self,
        f: impl Fn(ToolDispatchMetrics) + Send + Sync + 'static,
    ) -> Self {
        self.tool_dispatch = Some(Arc::new(f));
        self
    }

    pub fn on_state_transition(
        mut self,
        f: impl Fn(StateTransition) + Send + Sync + 'static,
    ) -> Self {
        self.state_transition = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for LoopCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopCallbacks")
            .field("model_call", &self.model_call.as_ref().map(|_| "callback"))
            .field(
                "tool_dispatch",
                &self.tool_dispatch.as_ref().map(|_| "callback"),
            )
            .field(
                "state_transition",
                &self.state_transition.as_ref().map(|_| "callback"),
            )
            .finish()
    }
}

/// Latency and outcome of one language model attempt.
#[derive(Clone, Debug)]
pub struct ModelCallMetrics {
    pub run_id: Uuid,
    pub turn: usize,
    /// 1-indexed attempt within the turn.
    pub attempt: u32,
    pub latency: Duration,
    pub usage: Option<Usage>,
    pub error: Option<String>,
    /// Set on retried attempts; `last_error` is the failure that caused the retry.
    pub retries: Option<RetryMetadata>,
}

/// Latency and outcome of one tool dispatch.
#[derive(Clone, Debug)]
pub struct ToolDispatchMetrics {
    pub run_id: Uuid,
    pub turn: usize,
    pub tool: String,
    pub latency: Duration,
    pub is_error: bool,
    pub is_retryable: bool,
}

/// A move of the loop state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub turn: usize,
    pub from: &'static str,
    pub to: &'static str,
}

/// Internal helper that owns the registered callbacks (if any).
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: LoopCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<LoopCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn record_model_call(&self, metrics: ModelCallMetrics) {
        if let Some(cb) = &self.callbacks.model_call {
            cb(metrics);
        }
    }

    pub fn record_tool_dispatch(&self, metrics: ToolDispatchMetrics) {
        if let Some(cb) = &self.callbacks.tool_dispatch {
            cb(metrics);
        }
    }

    pub fn record_transition(&self, transition: StateTransition) {
        tracing::trace!(
            run_id = %transition.run_id,
            turn = transition.turn,
            from = transition.from,
            to = transition.to,
            "state transition"
        );
        if let Some(cb) = &self.callbacks.state_transition {
            cb(transition);
        }
    }
}
