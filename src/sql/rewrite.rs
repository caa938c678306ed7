//! Clause surgery used by the pagination wrapper.
//!
//! All edits act on top-level clauses only (paren depth 0): a `LIMIT` inside a subquery or
//! an `ORDER BY` inside `OVER (...)` belongs to that inner construct and is left alone.

use crate::error::{Error, Result};
use crate::sql::lexer::{tokenize, Token, TokenKind};

const PAGINATION_WORDS: [&str; 11] = [
    "LIMIT", "OFFSET", "ALL", "ROW", "ROWS", "FETCH", "FIRST", "NEXT", "ONLY", "WITH", "TIES",
];

/// Yields `(index, token)` pairs for tokens at paren depth 0.
fn top_level(tokens: &[Token]) -> impl Iterator<Item = (usize, &Token)> {
    let mut depth = 0i32;
    tokens.iter().enumerate().filter(move |(_, t)| match t.kind {
        TokenKind::LParen => {
            depth += 1;
            false
        }
        TokenKind::RParen => {
            depth -= 1;
            false
        }
        _ => depth == 0,
    })
}

/// Opens a row-limiting clause: `LIMIT`, `OFFSET` or the standard `FETCH {FIRST|NEXT}`.
fn starts_row_limit(sql: &str, token: &Token) -> bool {
    ["LIMIT", "OFFSET", "FETCH"]
        .iter()
        .any(|w| token.is_keyword(sql, w))
}

/// Byte offset where a trailing row-limiting tail begins, if the statement ends in one.
fn trailing_limit_start(sql: &str, tokens: &[Token]) -> Option<usize> {
    let (idx, first) = top_level(tokens).find(|(_, t)| starts_row_limit(sql, t))?;
    let tail_is_pagination = tokens[idx..].iter().all(|t| match t.kind {
        TokenKind::Number | TokenKind::Comma => true,
        TokenKind::Word => PAGINATION_WORDS.iter().any(|w| t.is_keyword(sql, w)),
        _ => false,
    });
    tail_is_pagination.then_some(first.start)
}

/// Span of the top-level `ORDER BY` clause: (start of `ORDER`, start of the expression
/// list, end of the clause).
fn order_by_span(sql: &str, tokens: &[Token]) -> Option<(usize, usize, usize)> {
    let mut order_at = None;
    let mut prev: Option<&Token> = None;
    for (idx, token) in top_level(tokens) {
        if token.is_keyword(sql, "BY") && prev.is_some_and(|p| p.is_keyword(sql, "ORDER")) {
            order_at = Some((idx, prev.map(|p| p.start)?, token.end));
            break;
        }
        prev = Some(token);
    }
    let (by_idx, start, body_start) = order_at?;

    let end = top_level(tokens)
        .find(|(idx, t)| *idx > by_idx && starts_row_limit(sql, t))
        .map(|(_, t)| t.start)
        .unwrap_or(sql.len());

    Some((start, body_start, end))
}

/// Strip a trailing `LIMIT`/`OFFSET`/`FETCH FIRST` clause. Applying it twice is the same
/// as applying it once.
pub fn remove_limit_offset(sql: &str) -> String {
    let trimmed = sql.trim();
    let Ok(tokens) = tokenize(trimmed) else {
        return trimmed.to_string();
    };
    match trailing_limit_start(trimmed, &tokens) {
        Some(cut) => trimmed[..cut].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// The expression list of the top-level `ORDER BY`, up to the row-limiting clause or the end.
pub fn extract_order_by(sql: &str) -> Option<String> {
    let tokens = tokenize(sql).ok()?;
    let (_, body_start, end) = order_by_span(sql, &tokens)?;
    let body = sql[body_start..end].trim();
    (!body.is_empty()).then(|| body.to_string())
}

/// Remove the top-level `ORDER BY` clause, keeping anything that follows it.
pub fn strip_order_by(sql: &str) -> String {
    let trimmed = sql.trim();
    let Ok(tokens) = tokenize(trimmed) else {
        return trimmed.to_string();
    };
    match order_by_span(trimmed, &tokens) {
        Some((start, _, end)) => {
            let before = trimmed[..start].trim_end();
            let after = trimmed[end..].trim_start();
            if after.is_empty() {
                before.to_string()
            } else {
                format!("{} {}", before, after)
            }
        }
        None => trimmed.to_string(),
    }
}

/// A caller-supplied ordering, restricted to column references and direction words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOverride(String);

impl SortOverride {
    /// `Ok(None)` for a blank override.
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }
        let invalid = || Error::validation("Invalid sort expression");

        let tokens = tokenize(input).map_err(|_| invalid())?;
        let mut items = Vec::new();
        for chunk in tokens.split(|t| t.kind == TokenKind::Comma) {
            items.push(parse_sort_item(input, chunk).ok_or_else(invalid)?);
        }
        Ok(Some(SortOverride(items.join(", "))))
    }

    pub fn as_sql(&self) -> &str {
        &self.0
    }
}

fn is_direction_word(sql: &str, token: &Token) -> bool {
    ["ASC", "DESC", "NULLS", "FIRST", "LAST"]
        .iter()
        .any(|w| token.is_keyword(sql, w))
}

fn parse_sort_item(sql: &str, tokens: &[Token]) -> Option<String> {
    let first = tokens.first()?;
    let mut i = 1;
    match first.kind {
        TokenKind::Number if first.text(sql).bytes().all(|b| b.is_ascii_digit()) => {}
        TokenKind::Word if !is_direction_word(sql, first) => {}
        TokenKind::QuotedIdent => {}
        _ => return None,
    }
    if first.kind != TokenKind::Number {
        while tokens.get(i).is_some_and(|t| t.kind == TokenKind::Dot)
            && tokens
                .get(i + 1)
                .is_some_and(|t| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent))
        {
            i += 2;
        }
    }

    let mut item = sql[first.start..tokens[i - 1].end].to_string();

    if let Some(dir) = tokens.get(i) {
        if dir.is_keyword(sql, "ASC") || dir.is_keyword(sql, "DESC") {
            item.push(' ');
            item.push_str(&dir.text(sql).to_uppercase());
            i += 1;
        }
    }

    if let Some(nulls) = tokens.get(i) {
        if !nulls.is_keyword(sql, "NULLS") {
            return None;
        }
        let position = tokens.get(i + 1)?;
        if !(position.is_keyword(sql, "FIRST") || position.is_keyword(sql, "LAST")) {
            return None;
        }
        item.push_str(" NULLS ");
        item.push_str(&position.text(sql).to_uppercase());
        i += 2;
    }

    (i == tokens.len()).then_some(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_trailing_limit_and_offset() {
        assert_eq!(
            remove_limit_offset("SELECT * FROM orders LIMIT 10 OFFSET 20"),
            "SELECT * FROM orders"
        );
        assert_eq!(
            remove_limit_offset("SELECT * FROM orders ORDER BY id DESC LIMIT 5, 10"),
            "SELECT * FROM orders ORDER BY id DESC"
        );
        assert_eq!(
            remove_limit_offset("SELECT * FROM orders OFFSET 3 ROWS"),
            "SELECT * FROM orders"
        );
        assert_eq!(
            remove_limit_offset("  SELECT 1  "),
            "SELECT 1"
        );
    }

    #[test]
    fn keeps_limits_inside_subqueries() {
        let sql = "SELECT * FROM (SELECT id FROM orders ORDER BY id LIMIT 1) latest";
        assert_eq!(remove_limit_offset(sql), sql);

        let sql = "SELECT * FROM (SELECT id FROM orders LIMIT 1) latest LIMIT 50";
        assert_eq!(
            remove_limit_offset(sql),
            "SELECT * FROM (SELECT id FROM orders LIMIT 1) latest"
        );
    }

    #[test]
    fn remove_limit_offset_is_idempotent() {
        let samples = [
            "SELECT * FROM t LIMIT 10 OFFSET 20",
            "SELECT * FROM t LIMIT 10",
            "SELECT * FROM t OFFSET 5",
            "SELECT * FROM t LIMIT ALL",
            "SELECT * FROM t LIMIT 5, 10",
            "SELECT * FROM t OFFSET 5 LIMIT 1",
            "SELECT * FROM t LIMIT x",
            "SELECT * FROM (SELECT 1 LIMIT 1) s",
            "SELECT 'unterminated",
            "  SELECT a FROM t   ",
            "",
        ];
        for sql in samples {
            let once = remove_limit_offset(sql);
            assert_eq!(remove_limit_offset(&once), once, "input: {sql:?}");
        }
    }

    #[test]
    fn removes_trailing_fetch_first() {
        assert_eq!(
            remove_limit_offset("SELECT * FROM t ORDER BY id FETCH FIRST 5 ROWS ONLY"),
            "SELECT * FROM t ORDER BY id"
        );
        assert_eq!(
            remove_limit_offset("SELECT * FROM t ORDER BY id OFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY"),
            "SELECT * FROM t ORDER BY id"
        );
        assert_eq!(
            remove_limit_offset("SELECT * FROM t ORDER BY score fetch first row with ties"),
            "SELECT * FROM t ORDER BY score"
        );

        let nested = "SELECT * FROM (SELECT id FROM t FETCH FIRST 1 ROW ONLY) s";
        assert_eq!(remove_limit_offset(nested), nested);

        let once = remove_limit_offset("SELECT * FROM t OFFSET 2 ROWS FETCH FIRST 3 ROWS ONLY");
        assert_eq!(once, "SELECT * FROM t");
        assert_eq!(remove_limit_offset(&once), once);
    }

    #[test]
    fn order_by_ends_at_fetch() {
        assert_eq!(
            extract_order_by("SELECT * FROM t ORDER BY a DESC FETCH FIRST 5 ROWS ONLY").as_deref(),
            Some("a DESC")
        );
        assert_eq!(
            strip_order_by("SELECT * FROM t ORDER BY a FETCH FIRST 5 ROWS ONLY"),
            "SELECT * FROM t FETCH FIRST 5 ROWS ONLY"
        );
    }

    #[test]
    fn non_literal_limit_is_left_in_place() {
        let sql = "SELECT * FROM t LIMIT x";
        assert_eq!(remove_limit_offset(sql), sql);
    }

    #[test]
    fn extracts_top_level_order_by() {
        assert_eq!(
            extract_order_by("SELECT * FROM t ORDER BY a DESC, b LIMIT 5").as_deref(),
            Some("a DESC, b")
        );
        assert_eq!(
            extract_order_by("SELECT * FROM t order by created_at").as_deref(),
            Some("created_at")
        );
        assert_eq!(extract_order_by("SELECT * FROM t"), None);
        assert_eq!(
            extract_order_by("SELECT ROW_NUMBER() OVER (ORDER BY id) FROM t"),
            None
        );
    }

    #[test]
    fn strips_top_level_order_by_only() {
        assert_eq!(
            strip_order_by("SELECT * FROM t ORDER BY a DESC"),
            "SELECT * FROM t"
        );
        assert_eq!(
            strip_order_by("SELECT * FROM t ORDER BY a LIMIT 5"),
            "SELECT * FROM t LIMIT 5"
        );
        let windowed = "SELECT ROW_NUMBER() OVER (ORDER BY id) AS n FROM t";
        assert_eq!(strip_order_by(windowed), windowed);
    }

    #[test]
    fn parses_sort_overrides() {
        let sort = SortOverride::parse("o.created_at desc, \"Total\" ASC NULLS last, 2")
            .unwrap()
            .unwrap();
        assert_eq!(sort.as_sql(), "o.created_at DESC, \"Total\" ASC NULLS LAST, 2");

        assert_eq!(SortOverride::parse("   ").unwrap(), None);
    }

    #[test]
    fn rejects_expressions_in_sort_overrides() {
        for bad in [
            "id; DROP TABLE x",
            "(SELECT 1)",
            "id DESC DESC",
            "id, ",
            "pg_sleep(10)",
            "id -- comment",
            "1.5",
            "DESC",
            "id NULLS",
        ] {
            let err = SortOverride::parse(bad).unwrap_err();
            assert_eq!(err.to_string(), "Invalid sort expression", "input: {bad:?}");
        }
    }
}
