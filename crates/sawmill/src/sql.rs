// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lightweight analysis of reported SQL.
//!
//! Queries arrive as raw text. For grouping and searching, the sink keeps a
//! normalized form with every literal replaced by `?`, plus the tables and columns
//! the statement touches. This is a tokenizer with a few clause rules, not a SQL
//! parser: it understands `SELECT`, `INSERT`, `UPDATE` and `DELETE` well enough to
//! name what they read and write.

use thiserror::Error;

/// What a statement touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlAnalysis {
    /// The statement with literals replaced by `?` and whitespace collapsed.
    pub normalized: String,
    /// Tables read or written, in order of appearance.
    pub tables: Vec<String>,
    /// Columns selected, inserted or updated, in order of appearance.
    pub columns: Vec<String>,
}

/// Why a statement could not be analyzed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlParseError {
    /// Nothing but whitespace and comments.
    #[error("empty statement")]
    Empty,
    /// A string literal is not closed.
    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),
    /// A quoted identifier is not closed.
    #[error("unterminated quoted identifier at offset {0}")]
    UnterminatedIdentifier(usize),
    /// A block comment is not closed.
    #[error("unterminated comment at offset {0}")]
    UnterminatedComment(usize),
    /// Parentheses do not match.
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted { text: String, name: String },
    Literal,
    Punct(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    /// Identifier name, if this token can name a table or column.
    fn identifier(&self) -> Option<&str> {
        match self {
            Token::Word(word) if !is_reserved(word) => Some(word),
            Token::Quoted { name, .. } => Some(name),
            _ => None,
        }
    }
}

const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CONFLICT", "CROSS", "DELETE", "DESC",
    "DISTINCT", "DO", "ELSE", "END", "EXISTS", "FALSE", "FOR", "FROM", "FULL", "GROUP", "HAVING",
    "IN", "INNER", "INSERT", "INTO", "IS", "JOIN", "LEFT", "LIKE", "LIMIT", "NATURAL", "NOT",
    "NOTHING", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "RETURNING", "RIGHT", "SELECT",
    "SET", "THEN", "TRUE", "UNION", "UPDATE", "USING", "VALUES", "WHEN", "WHERE", "WITH",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|keyword| keyword.eq_ignore_ascii_case(word))
}

/// Analyze one statement.
pub fn analyze(raw: &str) -> Result<SqlAnalysis, SqlParseError> {
    let tokens = tokenize(raw)?;
    if tokens.is_empty() {
        return Err(SqlParseError::Empty);
    }
    check_parentheses(&tokens)?;

    let mut analysis = SqlAnalysis {
        normalized: render(&tokens),
        ..Default::default()
    };
    collect_tables(&tokens, &mut analysis.tables);
    collect_columns(&tokens, &mut analysis.columns);
    Ok(analysis)
}

// ============================================================================
// Tokenizer
// ============================================================================

fn tokenize(raw: &str) -> Result<Vec<Token>, SqlParseError> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = i;
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(SqlParseError::UnterminatedComment(start));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '\'' => {
                i = skip_quoted(&chars, i, '\'')
                    .ok_or(SqlParseError::UnterminatedString(i))?;
                tokens.push(Token::Literal);
            }
            '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                let end = skip_quoted(&chars, i, close)
                    .ok_or(SqlParseError::UnterminatedIdentifier(i))?;
                let text: String = chars[i..end].iter().collect();
                let name: String = chars[i + 1..end - 1].iter().collect();
                tokens.push(Token::Quoted { text, name });
                i = end;
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Literal);
            }
            '?' | '$' | ':' | '@'
                if chars
                    .get(i + 1)
                    .is_some_and(|next| next.is_alphanumeric() || *next == '_')
                    || c == '?' =>
            {
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Literal);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            c => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// Index just past the closing quote; a doubled quote is an escaped quote.
fn skip_quoted(chars: &[char], start: usize, close: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == close {
            if chars.get(i + 1) == Some(&close) && close != ']' {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn check_parentheses(tokens: &[Token]) -> Result<(), SqlParseError> {
    let mut depth = 0i32;
    for token in tokens {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth < 0 {
                    return Err(SqlParseError::UnbalancedParentheses);
                }
            }
            _ => {}
        }
    }
    if depth == 0 {
        Ok(())
    } else {
        Err(SqlParseError::UnbalancedParentheses)
    }
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut previous: Option<&Token> = None;
    for token in tokens {
        let text = match token {
            Token::Word(word) => word.as_str(),
            Token::Quoted { text, .. } => text.as_str(),
            Token::Literal => "?",
            Token::Punct(c) => {
                // Function calls keep their parenthesis: COUNT(*).
                let call = *c == '('
                    && matches!(previous, Some(Token::Word(word)) if !is_reserved(word));
                let glued = call
                    || matches!(c, ',' | ')' | '.' | ';')
                    || matches!(previous, Some(Token::Punct('(' | '.')));
                if !glued && !out.is_empty() {
                    out.push(' ');
                }
                out.push(*c);
                previous = Some(token);
                continue;
            }
        };
        if !out.is_empty() && !matches!(previous, Some(Token::Punct('(' | '.'))) {
            out.push(' ');
        }
        out.push_str(text);
        previous = Some(token);
    }
    out
}

// ============================================================================
// Clause rules
// ============================================================================

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|existing| existing == name) {
        names.push(name.to_string());
    }
}

/// Qualified name starting at `i`: returns the last segment and the index after it.
fn qualified_name(tokens: &[Token], mut i: usize) -> Option<(String, usize)> {
    let mut name = tokens.get(i)?.identifier()?.to_string();
    i += 1;
    while tokens.get(i) == Some(&Token::Punct('.')) {
        match tokens.get(i + 1) {
            Some(token) => match token.identifier() {
                Some(segment) => name = segment.to_string(),
                None if *token == Token::Punct('*') => name = "*".to_string(),
                None => break,
            },
            None => break,
        }
        i += 2;
    }
    Some((name, i))
}

fn collect_tables(tokens: &[Token], tables: &mut Vec<String>) {
    for (i, token) in tokens.iter().enumerate() {
        let is_from = token.is_keyword("FROM");
        if !(is_from
            || token.is_keyword("JOIN")
            || token.is_keyword("INTO")
            || token.is_keyword("UPDATE"))
        {
            continue;
        }

        let mut next = i + 1;
        while let Some((table, after)) = qualified_name(tokens, next) {
            push_unique(tables, &table);
            if !is_from {
                break;
            }
            // FROM a [AS] x, b [AS] y
            next = after;
            if tokens.get(next).is_some_and(|t| t.is_keyword("AS")) {
                next += 1;
            }
            if tokens.get(next).and_then(Token::identifier).is_some() {
                next += 1;
            }
            if tokens.get(next) != Some(&Token::Punct(',')) {
                break;
            }
            next += 1;
        }
    }
}

fn collect_columns(tokens: &[Token], columns: &mut Vec<String>) {
    for (i, token) in tokens.iter().enumerate() {
        if token.is_keyword("SELECT") {
            select_columns(tokens, i + 1, columns);
        } else if token.is_keyword("INTO") {
            insert_columns(tokens, i + 1, columns);
        } else if token.is_keyword("SET") {
            update_columns(tokens, i + 1, columns);
        }
    }
}

fn select_columns(tokens: &[Token], mut i: usize, columns: &mut Vec<String>) {
    if tokens
        .get(i)
        .is_some_and(|t| t.is_keyword("DISTINCT") || t.is_keyword("ALL"))
    {
        i += 1;
    }

    let mut depth = 0;
    let mut in_alias = false;
    while let Some(token) = tokens.get(i) {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') if depth == 0 => return,
            Token::Punct(')') => depth -= 1,
            Token::Punct(',') if depth == 0 => in_alias = false,
            Token::Punct('*') if depth == 0 && !in_alias => push_unique(columns, "*"),
            Token::Word(_) if depth == 0 && token.is_keyword("FROM") => return,
            Token::Word(_) if token.is_keyword("AS") => in_alias = true,
            _ if in_alias => {}
            _ => {
                if let Some((name, after)) = qualified_name(tokens, i) {
                    let is_call = tokens.get(after) == Some(&Token::Punct('('));
                    if !is_call {
                        push_unique(columns, &name);
                    }
                    i = after;
                    continue;
                }
            }
        }
        i += 1;
    }
}

fn insert_columns(tokens: &[Token], i: usize, columns: &mut Vec<String>) {
    let Some((_, mut i)) = qualified_name(tokens, i) else {
        return;
    };
    if tokens.get(i) != Some(&Token::Punct('(')) {
        return;
    }
    i += 1;
    while let Some(token) = tokens.get(i) {
        match token {
            Token::Punct(')') => return,
            token => {
                if let Some(name) = token.identifier() {
                    push_unique(columns, name);
                }
            }
        }
        i += 1;
    }
}

fn update_columns(tokens: &[Token], mut i: usize, columns: &mut Vec<String>) {
    let mut depth = 0;
    while let Some(token) = tokens.get(i) {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => depth -= 1,
            Token::Word(_)
                if depth == 0 && (token.is_keyword("WHERE") || token.is_keyword("RETURNING")) =>
            {
                return;
            }
            _ if depth == 0 => {
                if let Some((name, after)) = qualified_name(tokens, i) {
                    if tokens.get(after) == Some(&Token::Punct('=')) {
                        push_unique(columns, &name);
                    }
                    i = after;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_is_normalized() {
        let analysis = analyze(
            "SELECT e.id, e.target_type AS kind, COUNT(*)\n  FROM events e JOIN errors r ON r.id = e.id\n WHERE e.action_details = 'it''s' AND e.id > 42",
        )
        .unwrap();

        assert_eq!(
            analysis.normalized,
            "SELECT e.id, e.target_type AS kind, COUNT(*) FROM events e JOIN errors r ON r.id = e.id WHERE e.action_details = ? AND e.id > ?"
        );
        assert_eq!(analysis.tables, vec!["events", "errors"]);
        assert_eq!(analysis.columns, vec!["id", "target_type"]);
    }

    #[test]
    fn test_insert_columns_and_table() {
        let analysis =
            analyze("INSERT INTO \"grpc_calls\" (caller_id, called_id) VALUES ($1, $2)").unwrap();

        assert_eq!(analysis.tables, vec!["grpc_calls"]);
        assert_eq!(analysis.columns, vec!["caller_id", "called_id"]);
        assert_eq!(
            analysis.normalized,
            "INSERT INTO \"grpc_calls\" (caller_id, called_id) VALUES (?, ?)"
        );
    }

    #[test]
    fn test_update_set_columns() {
        let analysis =
            analyze("UPDATE http_requests SET child_duration_nanos = ?, version = version + 1 WHERE id = ?")
                .unwrap();

        assert_eq!(analysis.tables, vec!["http_requests"]);
        assert_eq!(analysis.columns, vec!["child_duration_nanos", "version"]);
    }

    #[test]
    fn test_from_list_with_aliases() {
        let analysis = analyze("select a.x from alpha as a, beta b -- trailing").unwrap();

        assert_eq!(analysis.tables, vec!["alpha", "beta"]);
        assert_eq!(analysis.columns, vec!["x"]);
    }

    #[test]
    fn test_unterminated_string_fails() {
        assert_eq!(
            analyze("SELECT * FROM t WHERE a = 'oops"),
            Err(SqlParseError::UnterminatedString(26))
        );
        assert_eq!(analyze("  -- nothing"), Err(SqlParseError::Empty));
        assert_eq!(
            analyze("SELECT (1"),
            Err(SqlParseError::UnbalancedParentheses)
        );
    }
}
