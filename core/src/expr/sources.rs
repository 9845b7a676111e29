//! Table references and normalization of model queries.

use regex::Regex;
use std::sync::OnceLock;

use super::lexer::{tokenize, Token, TokenKind};

/// Keywords that end a table reference in a FROM list.
const CLAUSE_KEYWORDS: &[&str] = &[
    "where", "group", "order", "limit", "having", "join", "inner", "left", "right", "full",
    "cross", "outer", "natural", "on", "using", "union", "intersect", "except", "window",
    "offset", "as",
];

/// Tables named after `FROM`/`JOIN` (including comma lists), in order of
/// first appearance, without CTE names and subqueries. Schema qualifiers are
/// dropped. Text that does not tokenize yields no tables.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let Ok(tokens) = tokenize(sql) else {
        return Vec::new();
    };

    let ctes = cte_names(&tokens);
    let mut tables: Vec<String> = Vec::new();
    let mut push = |name: String| {
        let is_cte = ctes.iter().any(|c| c.eq_ignore_ascii_case(&name));
        if !is_cte && !tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            tables.push(name);
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        let from = tok.is_keyword("from");
        if !(from || tok.is_keyword("join")) {
            i += 1;
            continue;
        }
        i += 1;

        loop {
            let Some((name, next)) = table_name(&tokens, i) else {
                break;
            };
            push(name);
            i = skip_alias(&tokens, next);
            // comma lists only continue a FROM clause
            if from && tokens.get(i).map(|t| &t.kind) == Some(&TokenKind::Comma) {
                i += 1;
                continue;
            }
            break;
        }
    }

    tables
}

/// Names introduced by `WITH name AS (` and `, name AS (`.
fn cte_names(tokens: &[Token]) -> Vec<String> {
    let mut names = Vec::new();
    for (i, tok) in tokens.iter().enumerate() {
        let Some(name) = tok.ident() else { continue };
        let introduced = i > 0
            && (tokens[i - 1].is_keyword("with")
                || tokens[i - 1].is_keyword("recursive")
                || tokens[i - 1].kind == TokenKind::Comma);
        let defines = tokens.get(i + 1).is_some_and(|t| t.is_keyword("as"))
            && tokens.get(i + 2).map(|t| &t.kind) == Some(&TokenKind::LParen);
        if introduced && defines {
            names.push(name.to_string());
        }
    }
    names
}

/// Read `name` or `schema.name` at `i`; returns the name and the next index.
fn table_name(tokens: &[Token], mut i: usize) -> Option<(String, usize)> {
    let first = tokens.get(i)?;
    if matches!(first.kind, TokenKind::Ident(_)) && is_clause_keyword(first) {
        return None;
    }
    let mut name = first.ident()?.to_string();
    i += 1;
    while tokens.get(i).map(|t| &t.kind) == Some(&TokenKind::Dot) {
        match tokens.get(i + 1).and_then(Token::ident) {
            Some(part) => {
                name = part.to_string();
                i += 2;
            }
            None => break,
        }
    }
    Some((name, i))
}

fn skip_alias(tokens: &[Token], mut i: usize) -> usize {
    if tokens.get(i).is_some_and(|t| t.is_keyword("as")) {
        i += 1;
    }
    match tokens.get(i) {
        Some(t) if t.ident().is_some() && !is_clause_keyword(t) => i + 1,
        _ => i,
    }
}

fn is_clause_keyword(tok: &Token) -> bool {
    CLAUSE_KEYWORDS.iter().any(|k| tok.is_keyword(k))
}

static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
static WHITESPACE_REGEX: OnceLock<Regex> = OnceLock::new();

fn comment_re() -> &'static Regex {
    COMMENT_REGEX.get_or_init(|| {
        Regex::new(r"(?s)--[^\n]*|/\*.*?\*/").expect("COMMENT_REGEX is valid")
    })
}

fn whitespace_re() -> &'static Regex {
    WHITESPACE_REGEX.get_or_init(|| Regex::new(r"\s+").expect("WHITESPACE_REGEX is valid"))
}

/// Strip comments, collapse whitespace and drop trailing semicolons so the
/// query can be embedded as a subquery.
pub fn sanitize_query(sql: &str) -> String {
    let without_comments = comment_re().replace_all(sql, " ");
    let collapsed = whitespace_re().replace_all(&without_comments, " ");
    collapsed
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_and_join() {
        assert_eq!(
            referenced_tables("select * from orders o join users u on o.uid = u.id"),
            vec!["orders", "users"]
        );
    }

    #[test]
    fn test_comma_list_and_schema() {
        assert_eq!(
            referenced_tables("SELECT a FROM main.orders AS o, \"Line Items\" li WHERE 1"),
            vec!["orders", "Line Items"]
        );
    }

    #[test]
    fn test_ctes_and_subqueries_excluded() {
        let sql = "with recent as (select * from orders where ts > 0) \
                   select * from recent join (select * from users) u on 1";
        assert_eq!(referenced_tables(sql), vec!["orders", "users"]);
    }

    #[test]
    fn test_dedup_case_insensitive() {
        assert_eq!(
            referenced_tables("select * from Orders union select * from orders"),
            vec!["Orders"]
        );
    }

    #[test]
    fn test_unlexable_sql_has_no_tables() {
        assert!(referenced_tables("select 'unterminated from t").is_empty());
    }

    #[test]
    fn test_sanitize_query() {
        assert_eq!(
            sanitize_query("select a, -- the key\n  b\nfrom t /* all */ ;\n"),
            "select a, b from t"
        );
    }
}
