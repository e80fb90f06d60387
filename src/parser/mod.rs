//! SQL analysis feeding the batch strategy decision.
//!
//! The batch engine needs three things from a statement's text: whether it
//! is a simple INSERT ... VALUES eligible for multi-values rewriting, where
//! the parameter placeholders sit, and how a multi-statement string splits
//! into individual statements.

use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Shape of an INSERT statement eligible for multi-values rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertShape {
    /// Everything up to and including `VALUES `
    pub prefix: String,
    /// The single parenthesized values group, placeholders included
    pub values_group: String,
    /// Trailing clause after the values group (normally empty)
    pub suffix: String,
    /// Placeholder count in the values group
    pub placeholders: usize,
}

/// Analyze a statement for the rewrite strategy. Returns None when the
/// statement is not a rewrite-safe single-table INSERT ... VALUES with one
/// values group.
pub fn analyze_insert(sql: &str) -> Option<InsertShape> {
    let statements = Parser::parse_sql(&MySqlDialect {}, sql).ok()?;
    if statements.len() != 1 {
        return None;
    }

    let Statement::Insert(insert) = &statements[0] else {
        return None;
    };
    // ON DUPLICATE KEY UPDATE and RETURNING change per-row semantics;
    // those batches go through the classic path
    if insert.on.is_some() || insert.returning.is_some() {
        return None;
    }
    let source = insert.source.as_ref()?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return None;
    };
    if values.rows.len() != 1 {
        return None;
    }

    let (prefix, group, suffix) = split_at_values(sql)?;
    let placeholders = count_placeholders(&group);

    debug!(
        placeholders = placeholders,
        "INSERT eligible for multi-values rewrite"
    );

    Some(InsertShape {
        prefix,
        values_group: group,
        suffix,
        placeholders,
    })
}

/// Split a multi-statement string on semicolons, respecting string
/// literals, quoted identifiers and comments. Empty trailing statements
/// are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b';' => {
                let stmt = sql[start..i].trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }

    let tail = sql[start..].trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

/// Count `?` placeholders outside literals and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'?' => {
                count += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    count
}

/// Substitute each `?` placeholder with the corresponding rendered literal.
/// Returns None when the counts do not line up.
pub fn substitute_placeholders(template: &str, literals: &[String]) -> Option<String> {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(
        template.len() + literals.iter().map(String::len).sum::<usize>(),
    );
    let mut next = 0;
    let mut segment_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'?' => {
                out.push_str(&template[segment_start..i]);
                out.push_str(literals.get(next)?);
                next += 1;
                i += 1;
                segment_start = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&template[segment_start..]);

    if next == literals.len() {
        Some(out)
    } else {
        None
    }
}

/// Skip a quoted region starting at `start`, handling doubled quotes and
/// backslash escapes. Returns the index just past the closing quote.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            // Doubled quote is an escaped quote inside the literal
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Textually split an INSERT at its VALUES keyword into
/// (prefix incl. "VALUES ", group, suffix).
fn split_at_values(sql: &str) -> Option<(String, String, String)> {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let values_pos = loop {
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'v' | b'V' => {
                let end = i + 6;
                if end <= bytes.len()
                    && sql[i..end].eq_ignore_ascii_case("values")
                    && (i == 0 || !bytes[i - 1].is_ascii_alphanumeric())
                    && (end == bytes.len() || !bytes[end].is_ascii_alphanumeric())
                {
                    break i;
                }
                i += 1;
            }
            _ => i += 1,
        }
    };

    let after_values = values_pos + 6;
    let group_start = sql[after_values..]
        .find('(')
        .map(|p| after_values + p)?;

    // Walk the parenthesized group, respecting nested parens and quotes
    let mut depth = 0i32;
    let mut j = group_start;
    let group_end = loop {
        if j >= bytes.len() {
            return None;
        }
        match bytes[j] {
            b'\'' | b'"' | b'`' => j = skip_quoted(bytes, j),
            b'(' => {
                depth += 1;
                j += 1;
            }
            b')' => {
                depth -= 1;
                j += 1;
                if depth == 0 {
                    break j;
                }
            }
            _ => j += 1,
        }
    };

    Some((
        sql[..group_start].to_string(),
        sql[group_start..group_end].to_string(),
        sql[group_end..].trim_end().to_string(),
    ))
}
