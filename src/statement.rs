//! SQL text cleanup and read-only classification.

use sqlparser::{
    ast::{Query, SetExpr, Statement},
    dialect::GenericDialect,
    parser::Parser,
    tokenizer::{Token, Tokenizer},
};

const READ_KEYWORDS: &[&str] = &["select", "with", "values", "explain", "show", "table"];

// Rejected anywhere inside a segment that starts with a read keyword, e.g.
// `WITH x AS (DELETE ...)`, `EXPLAIN ANALYZE UPDATE ...` or `SELECT ... INTO`.
const MODIFYING_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "upsert", "create", "alter", "drop", "truncate",
    "grant", "revoke", "attach", "detach", "into",
];

/// Coarse classification of a SQL statement (or batch of statements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, WITH ... SELECT, VALUES, TABLE.
    Query,
    /// EXPLAIN of a read-only statement.
    Explain,
    /// SHOW TABLES / SHOW COLUMNS and similar.
    Show,
    /// Anything that may modify data or schema.
    Write,
    Empty,
}

impl StatementKind {
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            StatementKind::Query | StatementKind::Explain | StatementKind::Show
        )
    }
}

/// Strips markdown code fences, wrapping quotes and trailing semicolons from
/// model-produced SQL.
pub fn clean_sql(raw: &str) -> String {
    let mut sql = raw.trim();

    if let Some(rest) = sql.strip_prefix("```") {
        // Drop an optional language tag on the opening fence.
        let rest = match rest.find('\n') {
            Some(idx) if is_fence_tag(&rest[..idx]) => &rest[idx + 1..],
            _ => rest,
        };
        sql = rest.trim();
        if let Some(body) = sql.strip_suffix("```") {
            sql = body.trim();
        }
    }

    for quote in ['"', '\'', '`'] {
        if sql.len() >= 2 && sql.starts_with(quote) && sql.ends_with(quote) {
            let inner = &sql[1..sql.len() - 1];
            // Only unwrap when the quotes enclose a whole statement, not an identifier.
            if inner.trim_start().split_whitespace().count() > 1 && !inner.contains(quote) {
                sql = inner.trim();
            }
        }
    }

    sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

fn is_fence_tag(line: &str) -> bool {
    let tag = line.trim();
    tag.is_empty()
        || ["sql", "postgresql", "postgres", "psql", "sqlite"]
            .iter()
            .any(|t| tag.eq_ignore_ascii_case(t))
}

/// Classifies already-cleaned SQL text. A batch is only as permissive as its
/// least permissive statement.
pub fn classify(sql: &str) -> StatementKind {
    let sql = sql.trim();
    if sql.is_empty() {
        return StatementKind::Empty;
    }
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) if statements.is_empty() => StatementKind::Empty,
        Ok(statements) => statements
            .iter()
            .map(classify_statement)
            .find(|kind| !kind.is_read_only())
            .unwrap_or_else(|| classify_statement(&statements[0])),
        Err(err) => {
            tracing::debug!(error = %err, "sql did not parse; classifying by keywords");
            classify_by_keywords(sql)
        }
    }
}

/// Counts the statements in `sql`.
///
/// Falls back to counting `;`-separated token groups when the SQL uses syntax
/// the generic parser does not know. Errors only when the text cannot even be
/// tokenized, e.g. an unterminated string literal.
pub fn statement_count(sql: &str) -> Result<usize, String> {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => Ok(statements.len()),
        Err(_) => {
            let tokens = Tokenizer::new(&dialect, sql)
                .tokenize()
                .map_err(|err| err.to_string())?;
            let count = tokens
                .split(|token| *token == Token::SemiColon)
                .filter(|group| {
                    group
                        .iter()
                        .any(|token| !matches!(token, Token::Whitespace(_) | Token::EOF))
                })
                .count();
            Ok(count)
        }
    }
}

/// True when `sql` (after [`clean_sql`]) only reads data.
pub fn is_read_only(sql: &str) -> bool {
    classify(&clean_sql(sql)).is_read_only()
}

fn classify_statement(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(query) if query_is_read_only(query) => StatementKind::Query,
        Statement::Explain { statement, .. } => {
            if classify_statement(statement).is_read_only() {
                StatementKind::Explain
            } else {
                StatementKind::Write
            }
        }
        Statement::ExplainTable { .. } => StatementKind::Explain,
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCollation { .. } => StatementKind::Show,
        _ => StatementKind::Write,
    }
}

fn query_is_read_only(query: &Query) -> bool {
    let ctes_ok = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)));
    ctes_ok && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(expr: &SetExpr) -> bool {
    match expr {
        // SELECT ... INTO creates a table.
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

// Every `;`-separated segment must lead with a read keyword and must not
// contain a data-modifying one. Quoted literals are blanked first so neither
// their words nor their semicolons count.
fn classify_by_keywords(sql: &str) -> StatementKind {
    let lowered = blank_string_literals(&sql.to_ascii_lowercase());
    let mut kind = StatementKind::Empty;

    for segment in lowered.split(';') {
        let mut words = segment
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty());
        let Some(first) = words.next() else {
            continue;
        };
        if !READ_KEYWORDS.contains(&first) || words.any(|w| MODIFYING_KEYWORDS.contains(&w)) {
            return StatementKind::Write;
        }
        if kind == StatementKind::Empty {
            kind = match first {
                "explain" => StatementKind::Explain,
                "show" => StatementKind::Show,
                _ => StatementKind::Query,
            };
        }
    }
    kind
}

fn blank_string_literals(sql: &str) -> String {
    let mut in_literal = false;
    sql.chars()
        .map(|c| {
            if c == '\'' {
                in_literal = !in_literal;
                ' '
            } else if in_literal {
                ' '
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_sql_strips_fences_and_semicolons() {
        assert_eq!(
            clean_sql("```sql\nSELECT COUNT(*) FROM products;\n```"),
            "SELECT COUNT(*) FROM products"
        );
        assert_eq!(clean_sql("```SELECT 1```"), "SELECT 1");
        assert_eq!(clean_sql("  SELECT 1 ;;  "), "SELECT 1");
        assert_eq!(clean_sql("\"SELECT name FROM products\""), "SELECT name FROM products");
        assert_eq!(clean_sql("\"products\""), "\"products\"");
    }

    #[test]
    fn queries_are_read_only() {
        for sql in [
            "SELECT COUNT(*) FROM products",
            "select * from products where price > 10 order by price desc limit 5",
            "WITH cheap AS (SELECT * FROM products WHERE price < 5) SELECT COUNT(*) FROM cheap",
            "SELECT a FROM t UNION SELECT b FROM u",
            "VALUES (1), (2)",
            "EXPLAIN SELECT * FROM products",
            "SHOW TABLES",
        ] {
            assert!(is_read_only(sql), "{sql} should be read-only");
        }
    }

    #[test]
    fn writes_are_rejected() {
        for sql in [
            "DELETE FROM products",
            "UPDATE products SET price = 0",
            "INSERT INTO products (name) VALUES ('x')",
            "DROP TABLE products",
            "CREATE TABLE t (id INT)",
            "SELECT * INTO backup FROM products",
            "EXPLAIN ANALYZE DELETE FROM products",
            "SELECT 1; DROP TABLE products",
        ] {
            assert!(!is_read_only(sql), "{sql} should be rejected");
        }
    }

    #[test]
    fn classify_reports_kinds() {
        assert_eq!(classify("SELECT 1"), StatementKind::Query);
        assert_eq!(classify("EXPLAIN SELECT 1"), StatementKind::Explain);
        assert_eq!(classify("   "), StatementKind::Empty);
        assert_eq!(classify("TRUNCATE products"), StatementKind::Write);
    }

    #[test]
    fn unparseable_sql_falls_back_to_keywords() {
        assert_eq!(
            classify_by_keywords("SELECT name FROM products WHERE name ~~* 'lamp'"),
            StatementKind::Query
        );
        assert_eq!(
            classify_by_keywords("SELECT replace(name,'a','b') FROM products WHERE name ~~* 'x'"),
            StatementKind::Query
        );
        assert_eq!(
            classify_by_keywords("select name from products where note = 'drop; delete'"),
            StatementKind::Query
        );
        assert_eq!(classify_by_keywords("show tables;"), StatementKind::Show);
        assert_eq!(
            classify_by_keywords("with gone as (delete from products returning id) select 1"),
            StatementKind::Write
        );
        assert_eq!(
            classify_by_keywords("explain analyze update products set price = 0"),
            StatementKind::Write
        );
        assert_eq!(
            classify_by_keywords("select 1 ; delete from products"),
            StatementKind::Write
        );
        assert_eq!(classify_by_keywords("vacuum"), StatementKind::Write);
    }

    #[test]
    fn counts_statements() {
        assert_eq!(statement_count("SELECT 1"), Ok(1));
        assert_eq!(statement_count("SELECT 1; DELETE FROM products"), Ok(2));
        assert_eq!(
            statement_count("SELECT name FROM products WHERE name ~~* 'x'; DELETE FROM products"),
            Ok(2)
        );
        assert_eq!(statement_count("SELECT name FROM products WHERE name ~~* 'a;b'"), Ok(1));
        assert!(statement_count("SELECT 'unterminated").is_err());
    }
}
