//! The read-only gate every statement passes before it reaches the database.
//!
//! Two layers run in order. The lexical layer is a fixed keyword deny-list and pattern list
//! checked against the raw text. The token layer then lexes the statement and rejects
//! anything that hides structure from those patterns: comments, stacked statements,
//! unbalanced parentheses and calls to side-effecting server functions. Both layers only
//! ever reject; the statement text is never rewritten beyond trimming the trailing
//! separator.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::db::SchemaSource;
use crate::error::Result;
use crate::sql::lexer::{tokenize, Token, TokenKind};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "ALTER", "DROP", "TRUNCATE", "CREATE", "REPLACE", "INSERT", "UPDATE", "DELETE", "MERGE",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "ANALYZE", "EXPLAIN", "DESCRIBE", "SHOW", "SET",
    "USE", "PRAGMA", "CALL", "HANDLER", "LOAD", "OUTFILE", "INFILE", "INTO", "LOCK", "UNLOCK",
    "KILL", "FLUSH", "SHUTDOWN", "PREPARE", "EXECUTE", "DEALLOCATE", "COPY", "VACUUM",
    "REINDEX", "NOTIFY", "LISTEN", "DISCARD",
];

const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "lo_unlink",
    "lo_from_bytea",
    "dblink",
    "dblink_exec",
    "set_config",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_advisory_lock",
    "pg_advisory_xact_lock",
    "nextval",
    "setval",
    "txid_current",
    "query_to_xml",
];

/// Functions whose argument list legitimately contains `FROM`.
const FROM_IN_ARGUMENTS: &[&str] = &["extract", "substring", "trim", "position", "overlay"];

/// Words that end a `FROM a x, b y` list item instead of aliasing it.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "ON", "USING",
    "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT", "WINDOW",
    "FETCH", "FOR",
];

lazy_static! {
    static ref SELECT_PREFIX: Regex = Regex::new(r"(?i)^\s*SELECT\s").unwrap();
    static ref STACKED_STATEMENT: Regex = Regex::new(r";\s*\S").unwrap();
    static ref KEYWORD_PATTERNS: Vec<(&'static str, Regex)> = FORBIDDEN_KEYWORDS
        .iter()
        .map(|kw| (*kw, Regex::new(&format!(r"(?i)\b{}\b", kw)).unwrap()))
        .collect();
    static ref FORBIDDEN_PATTERNS: Vec<Regex> = [
        r"/\*!",
        r"--\s",
        r"#",
        r";\s*\w",
        r"(?i)\bxp_\w+",
        r"(?i)\bsp_\w+",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<String>,
    /// Input with the trailing separator removed, echoed whether or not it passed.
    pub sanitized_sql: String,
}

impl ValidationOutcome {
    fn accept(sql: &str) -> Self {
        Self {
            valid: true,
            error: None,
            sanitized_sql: sql.to_string(),
        }
    }

    fn reject(message: impl Into<String>, sql: &str) -> Self {
        Self {
            valid: false,
            error: Some(message.into()),
            sanitized_sql: sql.to_string(),
        }
    }
}

/// Trim whitespace and trailing statement separators.
pub fn sanitize(sql: &str) -> &str {
    sql.trim()
        .trim_end_matches(|c: char| c == ';' || c == '\0' || c.is_whitespace())
}

/// Lexical and token checks. Needs no database access.
pub fn check_statement(sql: &str) -> ValidationOutcome {
    let trimmed = sql.trim();
    let sanitized = sanitize(trimmed);

    if trimmed.is_empty() {
        return ValidationOutcome::reject("SQL query is empty", sanitized);
    }
    if !SELECT_PREFIX.is_match(trimmed) {
        return ValidationOutcome::reject("Only SELECT queries are allowed", sanitized);
    }
    if STACKED_STATEMENT.is_match(trimmed) {
        return ValidationOutcome::reject("Multiple statements are not allowed", sanitized);
    }

    for (keyword, pattern) in KEYWORD_PATTERNS.iter() {
        if pattern.is_match(sanitized) {
            return ValidationOutcome::reject(
                format!("Forbidden keyword detected: {}", keyword),
                sanitized,
            );
        }
    }
    if FORBIDDEN_PATTERNS.iter().any(|p| p.is_match(sanitized)) {
        return ValidationOutcome::reject("Forbidden SQL pattern detected", sanitized);
    }

    let tokens = match tokenize(sanitized) {
        Ok(tokens) => tokens,
        Err(err) => {
            debug!(error = %err, "statement failed to lex");
            return ValidationOutcome::reject(
                "Unterminated string, identifier or comment",
                sanitized,
            );
        }
    };
    if let Some(message) = check_tokens(sanitized, &tokens) {
        return ValidationOutcome::reject(message, sanitized);
    }

    ValidationOutcome::accept(sanitized)
}

fn check_tokens(sql: &str, tokens: &[Token]) -> Option<String> {
    if tokens.iter().any(Token::is_comment) {
        return Some("Comments are not allowed".into());
    }
    if !tokens.first().is_some_and(|t| t.is_keyword(sql, "SELECT")) {
        return Some("Only SELECT queries are allowed".into());
    }
    if tokens.iter().any(|t| t.kind == TokenKind::Semicolon) {
        return Some("Multiple statements are not allowed".into());
    }

    let mut depth = 0i32;
    for token in tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Some("Unbalanced parentheses".into());
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Some("Unbalanced parentheses".into());
    }

    for pair in tokens.windows(2) {
        if pair[1].kind != TokenKind::LParen {
            continue;
        }
        if let Some(name) = pair[0].identifier(sql) {
            if FORBIDDEN_FUNCTIONS.contains(&name.as_str()) {
                return Some(format!("Forbidden function detected: {}", name));
            }
        }
    }

    None
}

/// A table reference found after `FROM` or `JOIN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    fn display(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

fn is_name(token: &Token) -> bool {
    matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent)
}

/// Table references in a lexed statement. Derived tables, table functions and `FROM`
/// inside `EXTRACT(... FROM ...)`-style argument lists are skipped.
pub fn table_refs(sql: &str, tokens: &[Token]) -> Vec<TableRef> {
    let mut refs = Vec::new();
    let mut paren_takes_from: Vec<bool> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::LParen => {
                let takes_from = i > 0
                    && tokens[i - 1].kind == TokenKind::Word
                    && FROM_IN_ARGUMENTS
                        .iter()
                        .any(|f| tokens[i - 1].is_keyword(sql, f));
                paren_takes_from.push(takes_from);
            }
            TokenKind::RParen => {
                paren_takes_from.pop();
            }
            TokenKind::Word => {
                let after_distinct = i > 0 && tokens[i - 1].is_keyword(sql, "DISTINCT");
                let in_arguments = paren_takes_from.last().copied().unwrap_or(false);
                if token.is_keyword(sql, "FROM") && !after_distinct && !in_arguments {
                    i = read_table_list(sql, tokens, i + 1, true, &mut refs);
                    continue;
                }
                if token.is_keyword(sql, "JOIN") {
                    i = read_table_list(sql, tokens, i + 1, false, &mut refs);
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }

    refs
}

/// Reads one table reference (or a comma-separated list when `list` is set) starting at
/// `i`, returning the index scanning should resume from.
fn read_table_list(
    sql: &str,
    tokens: &[Token],
    mut i: usize,
    list: bool,
    refs: &mut Vec<TableRef>,
) -> usize {
    loop {
        while tokens
            .get(i)
            .is_some_and(|t| t.is_keyword(sql, "LATERAL") || t.is_keyword(sql, "ONLY"))
        {
            i += 1;
        }
        let Some(first) = tokens.get(i).filter(|t| is_name(t)) else {
            return i;
        };

        let mut parts: Vec<String> = first.identifier(sql).into_iter().collect();
        let mut j = i + 1;
        while tokens.get(j).is_some_and(|t| t.kind == TokenKind::Dot)
            && tokens.get(j + 1).is_some_and(is_name)
        {
            parts.extend(tokens[j + 1].identifier(sql));
            j += 2;
        }
        // Table function: the call is scanned by the caller.
        if tokens.get(j).is_some_and(|t| t.kind == TokenKind::LParen) {
            return j;
        }

        if let Some(name) = parts.pop() {
            refs.push(TableRef {
                schema: parts.pop(),
                name,
            });
        }
        i = j;

        if !list {
            return i;
        }
        if tokens.get(i).is_some_and(|t| t.is_keyword(sql, "AS")) {
            i += 1;
        }
        if tokens.get(i).is_some_and(|t| {
            t.kind == TokenKind::QuotedIdent
                || (t.kind == TokenKind::Word && !CLAUSE_WORDS.iter().any(|w| t.is_keyword(sql, w)))
        }) {
            i += 1;
        }
        if tokens.get(i).is_some_and(|t| t.kind == TokenKind::Comma) {
            i += 1;
            continue;
        }
        return i;
    }
}

pub struct SqlValidator {
    schema: Arc<dyn SchemaSource>,
}

impl SqlValidator {
    pub fn new(schema: Arc<dyn SchemaSource>) -> Self {
        Self { schema }
    }

    /// Run the full gate. With `check_schema`, every referenced table must exist in the
    /// introspected namespace; a catalog read failure is an error, not a rejection.
    pub async fn validate(&self, sql: &str, check_schema: bool) -> Result<ValidationOutcome> {
        let outcome = check_statement(sql);
        if !outcome.valid || !check_schema {
            if let Some(error) = &outcome.error {
                debug!(%error, "statement rejected");
            }
            return Ok(outcome);
        }

        let sanitized = outcome.sanitized_sql.as_str();
        let tokens = match tokenize(sanitized) {
            Ok(tokens) => tokens,
            Err(_) => return Ok(outcome),
        };
        let refs = table_refs(sanitized, &tokens);
        if refs.is_empty() {
            return Ok(outcome);
        }

        let known = self.schema.all_table_names().await?;
        let namespace = self.schema.namespace();
        for table in &refs {
            let in_namespace = table.schema.as_deref().map_or(true, |s| s == namespace);
            if !in_namespace || !known.iter().any(|t| t == &table.name) {
                let error = format!("Table '{}' does not exist", table.display());
                debug!(%error, "statement rejected");
                return Ok(ValidationOutcome::reject(error, sanitized));
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> String {
        let outcome = check_statement(sql);
        assert!(!outcome.valid, "expected rejection for {sql:?}");
        outcome.error.unwrap()
    }

    fn refs(sql: &str) -> Vec<String> {
        let tokens = tokenize(sql).unwrap();
        table_refs(sql, &tokens)
            .iter()
            .map(TableRef::display)
            .collect()
    }

    #[test]
    fn accepts_plain_selects() {
        for sql in [
            "SELECT 1",
            "select * from orders where id = 5",
            "SELECT o.id, c.email FROM `order` o JOIN customer c ON c.id = o.customer_id",
            "SELECT \"group\".name FROM \"group\" ORDER BY name DESC LIMIT 10",
            "SELECT encode(id, 'hex') AS id FROM product WHERE stock < 10",
        ] {
            let outcome = check_statement(sql);
            assert!(outcome.valid, "{sql:?}: {:?}", outcome.error);
            assert_eq!(outcome.error, None);
        }
    }

    #[test]
    fn strips_trailing_separator() {
        let outcome = check_statement("  SELECT * FROM t ;  \n");
        assert!(outcome.valid);
        assert_eq!(outcome.sanitized_sql, "SELECT * FROM t");
    }

    #[test]
    fn rejects_empty_and_non_select() {
        assert_eq!(rejected("   \n"), "SQL query is empty");
        assert_eq!(rejected("UPDATE t SET x=1"), "Only SELECT queries are allowed");
        assert_eq!(rejected("WITH x AS (SELECT 1) SELECT * FROM x"), "Only SELECT queries are allowed");
        assert_eq!(rejected("SELECT"), "Only SELECT queries are allowed");
        assert_eq!(rejected("(SELECT 1)"), "Only SELECT queries are allowed");
    }

    #[test]
    fn rejects_stacked_statements_even_when_both_select() {
        assert_eq!(
            rejected("SELECT 1; SELECT 2"),
            "Multiple statements are not allowed"
        );
        assert_eq!(
            rejected("SELECT 1;DROP TABLE t"),
            "Multiple statements are not allowed"
        );
        assert_eq!(rejected("SELECT 1; ;"), "Multiple statements are not allowed");
    }

    #[test]
    fn rejects_deny_listed_keywords_in_any_case() {
        assert_eq!(
            rejected("SELECT * FROM t WHERE x = 1 FOR UPDATE"),
            "Forbidden keyword detected: UPDATE"
        );
        assert_eq!(
            rejected("SeLeCt * InTo backup FROM t"),
            "Forbidden keyword detected: INTO"
        );
        assert_eq!(
            rejected("SELECT 1 FROM t WHERE a = 'drop'"),
            "Forbidden keyword detected: DROP"
        );
        assert_eq!(
            rejected("SELECT * FROM t UNION SELECT 1 FROM copy"),
            "Forbidden keyword detected: COPY"
        );
    }

    #[test]
    fn keywords_only_match_whole_words() {
        for sql in [
            "SELECT updated_at, created_by, offset_days FROM settings",
            "SELECT dropdown FROM widgets",
        ] {
            assert!(check_statement(sql).valid, "{sql:?}");
        }
    }

    #[test]
    fn first_listed_keyword_is_cited() {
        assert_eq!(
            rejected("SELECT 1 FROM t WHERE a = 'insert' AND b = 'alter'"),
            "Forbidden keyword detected: ALTER"
        );
    }

    #[test]
    fn rejects_comment_and_procedure_patterns() {
        assert_eq!(rejected("SELECT * FROM t -- comment"), "Forbidden SQL pattern detected");
        assert_eq!(rejected("SELECT * FROM t # note"), "Forbidden SQL pattern detected");
        assert_eq!(
            rejected("SELECT /*!50000 1 */ FROM t"),
            "Forbidden SQL pattern detected"
        );
        assert_eq!(rejected("SELECT xp_cmdshell FROM t"), "Forbidden SQL pattern detected");
        assert_eq!(rejected("SELECT * FROM sp_who"), "Forbidden SQL pattern detected");
    }

    #[test]
    fn token_layer_catches_what_patterns_miss() {
        assert_eq!(rejected("SELECT 1 /* hidden */ FROM t"), "Comments are not allowed");
        assert_eq!(rejected("SELECT 1 FROM t--"), "Comments are not allowed");
        assert_eq!(
            rejected("SELECT 'abc FROM t"),
            "Unterminated string, identifier or comment"
        );
        assert_eq!(rejected("SELECT (1 FROM t"), "Unbalanced parentheses");
        assert_eq!(rejected("SELECT 1) FROM (t"), "Unbalanced parentheses");
        assert_eq!(
            rejected("SELECT $$;$$ FROM t"),
            "Multiple statements are not allowed"
        );
    }

    #[test]
    fn rejects_side_effecting_functions() {
        assert_eq!(
            rejected("SELECT pg_sleep(10)"),
            "Forbidden function detected: pg_sleep"
        );
        assert_eq!(
            rejected("SELECT PG_CATALOG.PG_READ_FILE ('/etc/passwd')"),
            "Forbidden function detected: pg_read_file"
        );
        assert_eq!(
            rejected("SELECT \"nextval\"('seq')"),
            "Forbidden function detected: nextval"
        );
        assert!(check_statement("SELECT pg_sleep FROM t").valid);
    }

    #[test]
    fn extracts_table_references() {
        assert_eq!(
            refs("SELECT * FROM orders o JOIN customer c ON c.id = o.customer_id"),
            vec!["orders", "customer"]
        );
        assert_eq!(refs("SELECT * FROM `order`, public.Product p, \"Mixed\" m"),
            vec!["order", "public.product", "Mixed"]);
        assert_eq!(
            refs("SELECT EXTRACT(YEAR FROM created_at) FROM orders"),
            vec!["orders"]
        );
        assert_eq!(
            refs("SELECT * FROM (SELECT id FROM items) sub LEFT JOIN LATERAL unnest(tags) t ON true"),
            vec!["items"]
        );
        assert_eq!(
            refs("SELECT * FROM a WHERE x IS DISTINCT FROM y"),
            vec!["a"]
        );
        assert_eq!(refs("SELECT 1"), Vec::<String>::new());
    }
}
