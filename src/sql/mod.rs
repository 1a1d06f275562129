//! SQL text utilities: normalization for cache keys, reserved-word
//! identifier quoting per dialect, and structural probe eligibility.
//!
//! Everything here works on a small hand-rolled token scanner rather than
//! substring matching, so string literals, quoted identifiers, and comments
//! never produce false positives.

use sha2::{Digest, Sha256};

use crate::types::DatabaseType;

/// Reserved words that LLM-generated SQL keeps using as column names.
/// Quoting them before validation avoids a whole class of ORA-00904s.
pub const RESERVED_IDENTIFIERS: [&str; 7] =
    ["DATE", "USER", "LEVEL", "SIZE", "ACCESS", "FILE", "SESSION"];

/// One lexical token with its byte range in the source text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: keyword, identifier, or function name.
    Word,
    /// Numeric literal.
    Number,
    /// Single-quoted string literal (quotes included in the range).
    Str,
    /// Double-quoted or backtick-quoted identifier.
    QuotedIdent,
    /// Any other single character (punctuation, operators).
    Symbol,
}

/// Scan `sql` into tokens. Comments must already be stripped.
#[must_use]
pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c == '\'' {
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\'' {
                    // '' escapes a quote inside the literal
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Str,
                start,
                end: i,
            });
        } else if c == '"' || c == '`' {
            let quote = bytes[i];
            i += 1;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            i = (i + 1).min(bytes.len());
            tokens.push(Token {
                kind: TokenKind::QuotedIdent,
                start,
                end: i,
            });
        } else if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() {
                let w = bytes[i] as char;
                if w.is_ascii_alphanumeric() || w == '_' || w == '$' || w == '#' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Word,
                start,
                end: i,
            });
        } else if c.is_ascii_digit() {
            while i < bytes.len() {
                let d = bytes[i] as char;
                if d.is_ascii_digit() || d == '.' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                start,
                end: i,
            });
        } else {
            i += 1;
            tokens.push(Token {
                kind: TokenKind::Symbol,
                start,
                end: i,
            });
        }
    }
    tokens
}

/// Remove `--` line comments and `/* */` block comments, leaving string
/// literals untouched.
#[must_use]
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\'' {
            let start = i;
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\'' {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            out.push_str(&sql[start..i]);
        } else if c == '-' && i + 1 < bytes.len() && bytes[i + 1] == b'-' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            // Block comments act as token separators.
            out.push(' ');
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Lightweight SQL normalization for hashing and caching.
///
/// Removes comments, collapses whitespace to single spaces, and strips a
/// trailing semicolon. With `normalize_params`, date and compared numeric
/// literals in `WHERE`/`HAVING` are replaced with placeholders so the same
/// query shape hits the same cache entry. Idempotent:
/// `normalize_sql(normalize_sql(s, p), p) == normalize_sql(s, p)`.
#[must_use]
pub fn normalize_sql(sql: &str, normalize_params: bool) -> String {
    if sql.trim().is_empty() {
        return String::new();
    }
    let stripped = strip_comments(sql.trim());
    let mut s = if normalize_params {
        normalize_literals(&stripped)
    } else {
        stripped
    };
    s = collapse_whitespace(&s);
    if let Some(trimmed) = s.strip_suffix(';') {
        s = trimmed.trim_end().to_string();
    }
    s
}

/// Stable cache key for a (sql, backend) pair:
/// `sha256(database_type ":" normalize_sql(sql))` as lowercase hex.
#[must_use]
pub fn query_hash(sql: &str, database: DatabaseType) -> String {
    let normalized = normalize_sql(sql, false);
    let mut hasher = Sha256::new();
    hasher.update(database.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut last_was_space = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            // Toggle unless this is a doubled quote inside a literal.
            if in_string && chars.peek() == Some(&'\'') {
                out.push(c);
                out.push(chars.next().unwrap_or('\''));
                continue;
            }
            in_string = !in_string;
            out.push(c);
            last_was_space = false;
        } else if !in_string && c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Replace date and compared numeric literals with placeholders.
///
/// - `TO_DATE('…'` → `TO_DATE('<DATE>'`
/// - `WHERE col >= 42` → `WHERE col >= <NUM>` (also after AND/OR/HAVING)
fn normalize_literals(sql: &str) -> String {
    let tokens = tokenize(sql);
    let mut replacements: Vec<(usize, usize, &str)> = Vec::new();
    let mut in_predicate = false;

    for (idx, token) in tokens.iter().enumerate() {
        let text = &sql[token.start..token.end];
        if token.kind == TokenKind::Word {
            match text.to_ascii_uppercase().as_str() {
                "WHERE" | "HAVING" => in_predicate = true,
                "GROUP" | "ORDER" | "FETCH" | "UNION" | "SELECT" => in_predicate = false,
                "TO_DATE" => {
                    // TO_DATE ( 'literal'  →  replace the first literal
                    if let (Some(open), Some(lit)) = (tokens.get(idx + 1), tokens.get(idx + 2)) {
                        if sql[open.start..open.end].eq("(") && lit.kind == TokenKind::Str {
                            replacements.push((lit.start, lit.end, "'<DATE>'"));
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if in_predicate && token.kind == TokenKind::Number {
            // Only numbers on the right of a comparison operator.
            let preceded_by_op = idx
                .checked_sub(1)
                .and_then(|i| tokens.get(i))
                .is_some_and(|prev| {
                    prev.kind == TokenKind::Symbol
                        && matches!(&sql[prev.start..prev.end], "=" | "<" | ">" | "!")
                });
            if preceded_by_op {
                replacements.push((token.start, token.end, "<NUM>"));
            }
        }
    }

    splice(sql, replacements)
}

fn splice(sql: &str, replacements: Vec<(usize, usize, &str)>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (start, end, replacement) in replacements {
        if start < cursor {
            continue;
        }
        out.push_str(&sql[cursor..start]);
        out.push_str(replacement);
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Quote reserved-word identifiers for the target dialect: double quotes
/// for Oracle, backticks for Doris, untouched elsewhere. Already-quoted
/// identifiers and string literals are left alone.
#[must_use]
pub fn quote_reserved_identifiers(sql: &str, database: DatabaseType) -> String {
    let (open, close) = match database {
        DatabaseType::Oracle => ('"', '"'),
        DatabaseType::Doris => ('`', '`'),
        DatabaseType::Postgres => return sql.to_string(),
    };
    let tokens = tokenize(sql);
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    for token in &tokens {
        if token.kind != TokenKind::Word {
            continue;
        }
        let text = &sql[token.start..token.end];
        let upper = text.to_ascii_uppercase();
        if RESERVED_IDENTIFIERS.contains(&upper.as_str()) {
            replacements.push((token.start, token.end, format!("{open}{upper}{close}")));
        }
    }
    let borrowed: Vec<(usize, usize, &str)> = replacements
        .iter()
        .map(|(s, e, r)| (*s, *e, r.as_str()))
        .collect();
    splice(sql, borrowed)
}

/// Whether the structural probe may run for this query.
///
/// Probe is Oracle-only and skipped when the statement contains tokens that
/// break subquery wrapping: `GROUP BY`, `FETCH FIRST`, `OFFSET`, `UNION`.
/// The scan is token-based, so those words inside string literals or quoted
/// identifiers do not disqualify a query.
#[must_use]
pub fn probe_eligible(sql: &str, database: DatabaseType) -> bool {
    if database != DatabaseType::Oracle {
        return false;
    }
    let stripped = strip_comments(sql);
    let tokens = tokenize(&stripped);
    let words: Vec<String> = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| stripped[t.start..t.end].to_ascii_uppercase())
        .collect();
    for (idx, word) in words.iter().enumerate() {
        match word.as_str() {
            "OFFSET" | "UNION" => return false,
            "GROUP" if words.get(idx + 1).map(String::as_str) == Some("BY") => return false,
            "FETCH" if words.get(idx + 1).map(String::as_str) == Some("FIRST") => return false,
            _ => {}
        }
    }
    true
}

/// Wrap a query into a structural dry-run that fetches no rows.
#[must_use]
pub fn build_probe_sql(sql: &str) -> String {
    let inner = normalize_sql(sql, false);
    format!("SELECT COUNT(*) FROM ({inner}) WHERE 1 = 0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_comments_and_whitespace() {
        let sql = "SELECT *  -- trailing comment\nFROM /* block */  t\nWHERE x = 1;";
        assert_eq!(
            normalize_sql(sql, false),
            "SELECT * FROM t WHERE x = 1"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let sql = "SELECT a,\n  b FROM t WHERE x = 10;";
        let once = normalize_sql(sql, true);
        assert_eq!(normalize_sql(&once, true), once);
    }

    #[test]
    fn normalize_params_replaces_literals() {
        let sql = "SELECT * FROM t WHERE amount > 100 AND ts = TO_DATE('2025-01-01')";
        let normalized = normalize_sql(sql, true);
        assert!(normalized.contains("amount > <NUM>"), "{normalized}");
        assert!(normalized.contains("TO_DATE('<DATE>')"), "{normalized}");
    }

    #[test]
    fn normalize_leaves_select_list_numbers_alone() {
        let sql = "SELECT 1 FROM t WHERE x = 2";
        let normalized = normalize_sql(sql, true);
        assert!(normalized.starts_with("SELECT 1"), "{normalized}");
        assert!(normalized.ends_with("x = <NUM>"), "{normalized}");
    }

    #[test]
    fn hash_is_stable_under_formatting() {
        let a = query_hash("SELECT * FROM t;", DatabaseType::Oracle);
        let b = query_hash("SELECT   *\nFROM t", DatabaseType::Oracle);
        assert_eq!(a, b);
        let c = query_hash("SELECT * FROM t", DatabaseType::Doris);
        assert_ne!(a, c);
    }

    #[test]
    fn quotes_reserved_words_per_dialect() {
        let sql = "SELECT date, name FROM t";
        assert_eq!(
            quote_reserved_identifiers(sql, DatabaseType::Oracle),
            "SELECT \"DATE\", name FROM t"
        );
        assert_eq!(
            quote_reserved_identifiers(sql, DatabaseType::Doris),
            "SELECT `DATE`, name FROM t"
        );
        assert_eq!(
            quote_reserved_identifiers(sql, DatabaseType::Postgres),
            sql
        );
    }

    #[test]
    fn quoting_skips_string_literals_and_quoted_idents() {
        let sql = "SELECT \"DATE\", 'date' FROM t";
        assert_eq!(
            quote_reserved_identifiers(sql, DatabaseType::Oracle),
            sql
        );
    }

    #[test]
    fn probe_eligibility_rules() {
        assert!(probe_eligible("SELECT * FROM t", DatabaseType::Oracle));
        assert!(!probe_eligible("SELECT * FROM t", DatabaseType::Postgres));
        assert!(!probe_eligible(
            "SELECT a FROM t GROUP BY a",
            DatabaseType::Oracle
        ));
        assert!(!probe_eligible(
            "SELECT a FROM t FETCH FIRST 5 ROWS ONLY",
            DatabaseType::Oracle
        ));
        assert!(!probe_eligible(
            "SELECT a FROM t UNION SELECT b FROM u",
            DatabaseType::Oracle
        ));
        // Keywords inside string literals do not disqualify.
        assert!(probe_eligible(
            "SELECT * FROM t WHERE note = 'union offset group by'",
            DatabaseType::Oracle
        ));
    }

    #[test]
    fn probe_sql_wraps_query() {
        assert_eq!(
            build_probe_sql("SELECT a FROM t;"),
            "SELECT COUNT(*) FROM (SELECT a FROM t) WHERE 1 = 0"
        );
    }
}
