use crate::{parser::FINAL_ANSWER_PREFIX, tools::ToolSpec};

/// Inputs that shape the system prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptOptions<'a> {
    /// Backend label, e.g. "postgres" or "sqlite".
    pub dialect: &'a str,
    /// Default row cap the model should put on its queries.
    pub top_k: usize,
    pub read_only: bool,
    pub extra: Option<&'a str>,
}

/// Builds the system prompt: role, SQL rules, tool list and output format.
pub fn system_prompt(tools: &[ToolSpec], opts: &PromptOptions<'_>) -> String {
    let names = tools
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![
        "You are an agent designed to interact with a SQL database.".to_string(),
        format!(
            "Given an input question, create a syntactically correct {} query to run, then look at the results of the query and return the answer.",
            dialect_name(opts.dialect)
        ),
        format!(
            "Unless the user asks for a specific number of examples, always limit your query to at most {} results.",
            opts.top_k
        ),
        "You can order the results by a relevant column to return the most interesting examples in the database.".to_string(),
        "Never query for all the columns from a specific table, only ask for the relevant columns given the question.".to_string(),
        "Only use the tools below, and only use the information they return to construct your final answer.".to_string(),
        "Double check your query before executing it. If you get an error while executing a query, rewrite the query and try again.".to_string(),
    ];
    if opts.read_only {
        lines.push(String::new());
        lines.push(
            "DO NOT make any DML statements (INSERT, UPDATE, DELETE, DROP etc.) to the database; they will be rejected."
                .to_string(),
        );
    }
    lines.push(String::new());
    lines.push(
        "If the question does not seem related to the database, just return \"I don't know\" as the answer."
            .to_string(),
    );

    lines.push(String::new());
    lines.push("Tools:".to_string());
    for tool in tools {
        lines.push(format!("{}: {}", tool.name, tool.description));
    }

    lines.push(String::new());
    lines.push("Use the following format:".to_string());
    lines.push(String::new());
    lines.push("Question: the input question you must answer".to_string());
    lines.push("Thought: you should always think about what to do".to_string());
    lines.push(format!("Action: the action to take, should be one of [{names}]"));
    lines.push("Action Input: the input to the action".to_string());
    lines.push("Observation: the result of the action".to_string());
    lines.push("... (this Thought/Action/Action Input/Observation can repeat N times)".to_string());
    lines.push("Thought: I now know the final answer".to_string());
    lines.push(format!(
        "{FINAL_ANSWER_PREFIX} the final answer to the original input question"
    ));
    lines.push(String::new());
    lines.push(
        "Write exactly one Action per reply and stop; the Observation is provided to you. \
         Start by looking at the tables in the database, then query the schema of the most relevant tables."
            .to_string(),
    );

    if let Some(extra) = opts.extra {
        if !extra.trim().is_empty() {
            lines.push(String::new());
            lines.push(extra.trim().to_string());
        }
    }
    lines.join("\n")
}

/// Observation sent back after output that could not be parsed.
pub fn format_correction(reason: &str) -> String {
    format!(
        "Invalid Format: {reason}. Reply with a Thought followed by either an `Action:` line and an \
         `Action Input:` line, or a `{FINAL_ANSWER_PREFIX}` line. Never both."
    )
}

fn dialect_name(backend: &str) -> &str {
    match backend {
        "postgres" => "PostgreSQL",
        "sqlite" => "SQLite",
        "" => "SQL",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("list_tables", "lists tables"),
            ToolSpec::new("run_query", "runs sql"),
        ]
    }

    #[test]
    fn prompt_lists_tools_and_format() {
        let prompt = system_prompt(
            &tools(),
            &PromptOptions {
                dialect: "sqlite",
                top_k: 10,
                read_only: true,
                extra: Some("  Prices are in cents.  "),
            },
        );
        assert!(prompt.contains("syntactically correct SQLite query"));
        assert!(prompt.contains("at most 10 results"));
        assert!(prompt.contains("list_tables: lists tables"));
        assert!(prompt.contains("should be one of [list_tables, run_query]"));
        assert!(prompt.contains("Final Answer: the final answer"));
        assert!(prompt.contains("DO NOT make any DML statements"));
        assert!(prompt.ends_with("Prices are in cents."));
    }

    #[test]
    fn prompt_omits_dml_warning_when_writes_allowed() {
        let prompt = system_prompt(
            &tools(),
            &PromptOptions {
                dialect: "postgres",
                top_k: 5,
                ..Default::default()
            },
        );
        assert!(prompt.contains("PostgreSQL"));
        assert!(!prompt.contains("DML"));
    }

    #[test]
    fn correction_names_the_problem() {
        let text = format_correction("missing 'Action:' after 'Thought:'");
        assert!(text.starts_with("Invalid Format: missing 'Action:'"));
        assert!(text.contains("Final Answer:"));
    }
}
