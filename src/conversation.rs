use crate::{
    parser::{strip_observation, ParsedAction, OBSERVATION_PREFIX},
    tools::ToolResult,
    types::ChatMessage,
};

/// Reserved tool name for format-correction observations after unparseable output.
pub const FORMAT_ERROR_TOOL: &str = "format_error";

const OBSERVATION_TRUNCATED: &str = "\n... (observation truncated)";

/// One step of a conversation after the system prompt and question.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    ModelOutput {
        raw_text: String,
        parsed_action: ParsedAction,
    },
    Observation {
        tool_name: String,
        result: ToolResult,
    },
}

/// The messages exchanged while answering one question.
///
/// Owned by a single loop invocation and dropped when it ends.
#[derive(Debug, Clone)]
pub struct Conversation {
    system_prompt: String,
    question: String,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            question: question.into(),
            turns: Vec::new(),
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_model_output(&mut self, raw_text: impl Into<String>, parsed_action: ParsedAction) {
        self.turns.push(Turn::ModelOutput {
            raw_text: raw_text.into(),
            parsed_action,
        });
    }

    pub fn push_observation(&mut self, tool_name: impl Into<String>, result: ToolResult) {
        self.turns.push(Turn::Observation {
            tool_name: tool_name.into(),
            result,
        });
    }

    /// Appends the correction shown to the model after unparseable output.
    pub fn push_format_error(&mut self, correction: impl Into<String>) {
        self.push_observation(FORMAT_ERROR_TOOL, ToolResult::Text(correction.into()));
    }

    /// Renders the conversation as chat messages.
    ///
    /// Model output becomes assistant messages (minus any observation the
    /// model wrote itself); observations become user messages prefixed with
    /// `Observation:` and cut to `max_observation_chars`.
    pub fn to_messages(&self, max_observation_chars: usize) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.push(ChatMessage::user(format!("Question: {}", self.question)));
        for turn in &self.turns {
            match turn {
                Turn::ModelOutput { raw_text, .. } => {
                    messages.push(ChatMessage::assistant(strip_observation(raw_text).trim_end()));
                }
                Turn::Observation { result, .. } => {
                    let text = truncate_observation(&result.render(), max_observation_chars);
                    messages.push(ChatMessage::user(format!("{OBSERVATION_PREFIX} {text}")));
                }
            }
        }
        messages
    }
}

fn truncate_observation(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{OBSERVATION_TRUNCATED}", &text[..idx]),
        None => text.to_string(),
    }
}
