//! Strict parser for ReAct-style model output.
//!
//! The model is asked to answer in one of two shapes:
//!
//! ```text
//! Thought: I should look at the tables.
//! Action: list_tables
//! Action Input:
//! ```
//!
//! or
//!
//! ```text
//! Thought: I now know the final answer.
//! Final Answer: There are 42 products.
//! ```
//!
//! Anything else (including a reply that contains both an action and a final
//! answer) is [`ParsedAction::Unparseable`].

use std::sync::OnceLock;

use regex::Regex;

/// Marker that introduces the final answer.
pub const FINAL_ANSWER_PREFIX: &str = "Final Answer:";

/// Marker the model must not write itself; observations come from tools.
pub const OBSERVATION_PREFIX: &str = "Observation:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAction {
    ToolCall { name: String, argument: String },
    FinalAnswer { text: String },
    Unparseable { raw_text: String, reason: String },
}

impl ParsedAction {
    pub fn is_unparseable(&self) -> bool {
        matches!(self, ParsedAction::Unparseable { .. })
    }

    fn unparseable(raw_text: &str, reason: impl Into<String>) -> Self {
        ParsedAction::Unparseable {
            raw_text: raw_text.to_string(),
            reason: reason.into(),
        }
    }
}

fn action_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Action\s*\d*\s*:[\s]*(.*?)[\s]*Action\s*\d*\s*Input\s*\d*\s*:[\s]*(.*)")
            .unwrap_or_else(|err| panic!("invalid action regex: {err}"))
    })
}

fn action_only_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Action\s*\d*\s*:").unwrap_or_else(|err| panic!("invalid regex: {err}"))
    })
}

/// Cuts a reply at the first observation the model invented for itself.
pub fn strip_observation(text: &str) -> &str {
    let cut = text
        .find(&format!("\n{OBSERVATION_PREFIX}"))
        .or_else(|| text.starts_with(OBSERVATION_PREFIX).then_some(0));
    match cut {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// Parses one raw model reply.
pub fn parse_action(raw: &str) -> ParsedAction {
    let text = strip_observation(raw);
    let has_final = text.contains(FINAL_ANSWER_PREFIX);

    if let Some(caps) = action_regex().captures(text) {
        if has_final {
            return ParsedAction::unparseable(
                raw,
                "output contains both an action and a final answer",
            );
        }
        let name = caps
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .trim()
            .trim_matches(|c: char| c == '`' || c == '[' || c == ']')
            .trim();
        if name.is_empty() {
            return ParsedAction::unparseable(raw, "action name is empty");
        }
        let argument = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .trim()
            .trim_matches('"')
            .to_string();
        return ParsedAction::ToolCall {
            name: name.to_string(),
            argument,
        };
    }

    if has_final {
        let answer = text
            .rsplit(FINAL_ANSWER_PREFIX)
            .next()
            .unwrap_or_default()
            .trim();
        if answer.is_empty() {
            return ParsedAction::unparseable(raw, "final answer is empty");
        }
        return ParsedAction::FinalAnswer {
            text: answer.to_string(),
        };
    }

    if !action_only_regex().is_match(text) {
        ParsedAction::unparseable(raw, "missing 'Action:' after 'Thought:'")
    } else {
        ParsedAction::unparseable(raw, "missing 'Action Input:' after 'Action:'")
    }
}
