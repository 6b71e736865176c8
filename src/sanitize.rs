//! Allow-list sanitizer for raw SQL fragments (WHERE / HAVING clauses).
//!
//! Chart specs may carry free-form predicate text that is later embedded into
//! a generated query. The fragment must stay a single predicate expression:
//! statement separators, comments and DDL/DML keywords are rejected rather
//! than rewritten.

use regex::Regex;

use crate::error::VizError;

fn forbidden_keyword(clause: &str) -> Option<&'static str> {
    const KEYWORDS: [&str; 12] = [
        "insert", "update", "delete", "drop", "create", "alter", "grant", "revoke", "truncate",
        "attach", "detach", "merge",
    ];
    let re = Regex::new(r"(?i)\b([a-z]+)\b").unwrap();
    for caps in re.captures_iter(clause) {
        let word = caps[1].to_ascii_lowercase();
        if let Some(k) = KEYWORDS.iter().find(|k| **k == word) {
            return Some(k);
        }
    }
    None
}

/// Sanitize a raw predicate clause. Trailing semicolons and whitespace are
/// stripped; anything that could smuggle in a second statement fails.
pub fn sanitize_clause(clause: &str) -> Result<String, VizError> {
    let mut out = clause.trim().to_string();
    while out.ends_with(';') {
        out.pop();
        out = out.trim_end().to_string();
    }
    if out.contains(';') {
        return Err(VizError::validation("clause must be a single expression"));
    }
    if out.contains("--") || out.contains("/*") || out.contains("*/") {
        return Err(VizError::validation("comments are not allowed in clauses"));
    }
    if let Some(k) = forbidden_keyword(&out) {
        return Err(VizError::validation(format!("keyword not allowed in clause: {k}")));
    }
    Ok(out)
}
