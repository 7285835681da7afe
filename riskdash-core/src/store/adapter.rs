//! Query dialect adapter.
//!
//! Callers write one portable vocabulary: `?` / `?N` placeholders plus
//! `INSERT OR REPLACE` and `INSERT OR IGNORE`. The adapter rewrites that
//! text for the live backend. It is a text rewriter, not a SQL parser, and
//! only understands a single-statement, single-table insert with an
//! explicit column list:
//!
//! ```text
//! INSERT OR {REPLACE|IGNORE} INTO <table> (<col>, ...) VALUES (...)[, (...)]
//! ```
//!
//! Anything else that asks for a conflict rewrite fails with
//! [`StoreError::Unsupported`] instead of being mis-rewritten.

use std::collections::HashMap;
use std::fmt;

use crate::datasets::Dataset;
use crate::error::StoreError;

/// SQL dialect of a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Embedded single-file engine. Understands the portable vocabulary natively.
    Sqlite,
    /// Client/server engine. Needs `$N` markers and `ON CONFLICT` clauses.
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        })
    }
}

/// Table name → key column, used as the conflict target for upserts.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: HashMap<String, String>,
}

impl KeyRegistry {
    /// Registry covering every raw table and every result cache table.
    pub fn from_datasets() -> Self {
        let mut registry = Self::default();
        for dataset in Dataset::ALL {
            let config = dataset.config();
            registry.register(config.table, config.key_field);
            for function in config.ai_functions {
                registry.register(&dataset.cache_table(function), config.key_field);
            }
        }
        registry
    }

    pub fn register(&mut self, table: &str, key_field: &str) {
        self.keys
            .insert(table.to_ascii_lowercase(), key_field.to_string());
    }

    pub fn key_for(&self, table: &str) -> Option<&str> {
        self.keys
            .get(&table.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Which conflict behaviour a portable insert asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    Replace,
    Ignore,
}

/// The pieces of a conflict-aware insert the rewrite needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInsert<'a> {
    pub mode: ConflictMode,
    /// Table name with any identifier quotes removed.
    pub table: &'a str,
    pub columns: Vec<&'a str>,
    /// Everything after `INTO`, starting at the table name.
    pub tail: &'a str,
}

/// Rewrites portable SQL into the dialect of one backend.
#[derive(Debug, Clone)]
pub struct QueryAdapter {
    dialect: Dialect,
    registry: KeyRegistry,
}

impl QueryAdapter {
    pub fn new(dialect: Dialect, registry: KeyRegistry) -> Self {
        Self { dialect, registry }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Adapt a statement and check it against the number of parameters
    /// the caller is about to bind.
    pub fn prepare(&self, sql: &str, param_count: usize) -> Result<String, StoreError> {
        let (adapted, expected) = self.adapt(sql)?;
        if expected != param_count {
            return Err(StoreError::ParameterCount {
                expected,
                got: param_count,
            });
        }
        Ok(adapted)
    }

    /// Rewrite conflict clauses, then translate placeholders. Returns the
    /// adapted text and the highest placeholder position.
    pub fn adapt(&self, sql: &str) -> Result<(String, usize), StoreError> {
        let statement = single_statement(sql)?;
        let rewritten = match parse_conflict_insert(statement)? {
            Some(insert) => self.rewrite_conflict(statement, &insert)?,
            None => statement.to_string(),
        };
        translate_placeholders(&rewritten, self.dialect)
    }

    fn rewrite_conflict(
        &self,
        statement: &str,
        insert: &ConflictInsert<'_>,
    ) -> Result<String, StoreError> {
        let key = self
            .registry
            .key_for(insert.table)
            .ok_or_else(|| StoreError::UnknownConflictTarget {
                table: insert.table.to_string(),
            })?;

        if self.dialect == Dialect::Sqlite {
            return Ok(statement.to_string());
        }

        let non_key: Vec<&str> = insert
            .columns
            .iter()
            .copied()
            .filter(|c| !unquote(c).eq_ignore_ascii_case(key))
            .collect();

        let action = match insert.mode {
            ConflictMode::Replace if !non_key.is_empty() => {
                let sets: Vec<String> = non_key
                    .iter()
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect();
                format!("DO UPDATE SET {}", sets.join(", "))
            }
            _ => "DO NOTHING".to_string(),
        };

        Ok(format!(
            "INSERT INTO {} ON CONFLICT ({key}) {action}",
            insert.tail
        ))
    }
}

/// Trim the statement and reject anything holding more than one.
fn single_statement(sql: &str) -> Result<&str, StoreError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(StoreError::Unsupported("empty statement".into()));
    }
    if find_unquoted(trimmed, ';').is_some() {
        return Err(StoreError::Unsupported(
            "multiple statements in one call".into(),
        ));
    }
    Ok(trimmed)
}

/// Recognise `INSERT OR REPLACE|IGNORE INTO`. Returns `None` for any
/// statement that does not ask for a conflict rewrite.
pub fn parse_conflict_insert(statement: &str) -> Result<Option<ConflictInsert<'_>>, StoreError> {
    let (first, rest) = next_word(statement);
    if !first.eq_ignore_ascii_case("INSERT") {
        if contains_keyword_pair(statement) {
            return Err(StoreError::Unsupported(
                "INSERT OR REPLACE/IGNORE must be the leading clause".into(),
            ));
        }
        return Ok(None);
    }
    let (second, rest) = next_word(rest);
    if !second.eq_ignore_ascii_case("OR") {
        return Ok(None);
    }
    let (third, rest) = next_word(rest);
    let mode = if third.eq_ignore_ascii_case("REPLACE") {
        ConflictMode::Replace
    } else if third.eq_ignore_ascii_case("IGNORE") {
        ConflictMode::Ignore
    } else {
        return Err(StoreError::Unsupported(format!(
            "unknown conflict mode 'INSERT OR {third}'"
        )));
    };
    let (fourth, rest) = next_word(rest);
    if !fourth.eq_ignore_ascii_case("INTO") {
        return Err(StoreError::Unsupported("expected INTO after conflict mode".into()));
    }

    let tail = rest.trim_start();
    let table_end = tail
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(tail.len());
    let table_token = &tail[..table_end];
    if table_token.is_empty() {
        return Err(StoreError::Unsupported("missing table name".into()));
    }

    let after_table = tail[table_end..].trim_start();
    if !after_table.starts_with('(') {
        return Err(StoreError::Unsupported(format!(
            "insert into {table_token} needs an explicit column list"
        )));
    }
    let close = after_table
        .find(')')
        .ok_or_else(|| StoreError::Unsupported("unterminated column list".into()))?;
    let columns: Vec<&str> = after_table[1..close].split(',').map(str::trim).collect();
    if columns.iter().any(|c| c.is_empty()) {
        return Err(StoreError::Unsupported("empty column name in column list".into()));
    }

    let after_columns = after_table[close + 1..].trim_start();
    let (values_kw, _) = next_word(after_columns);
    if !values_kw.eq_ignore_ascii_case("VALUES") {
        return Err(StoreError::Unsupported(
            "only INSERT ... VALUES is supported for conflict rewrites".into(),
        ));
    }

    let words = unquoted_words(after_columns);
    if words.windows(2).any(|w| w[0] == "ON" && w[1] == "CONFLICT") {
        return Err(StoreError::Unsupported(
            "ON CONFLICT is not supported in a conflict rewrite".into(),
        ));
    }
    for banned in ["RETURNING", "SELECT"] {
        if words.iter().any(|w| w == banned) {
            return Err(StoreError::Unsupported(format!(
                "{banned} is not supported in a conflict rewrite"
            )));
        }
    }

    Ok(Some(ConflictInsert {
        mode,
        table: unquote(table_token),
        columns,
        tail,
    }))
}

/// Translate portable placeholders for `dialect`.
///
/// A bare `?` takes the position one past the largest assigned so far; `?N`
/// names position `N` explicitly. Scanning is left to right and skips quoted
/// literals and identifiers. Returns the new text and the highest position.
pub fn translate_placeholders(sql: &str, dialect: Dialect) -> Result<(String, usize), StoreError> {
    let marker = match dialect {
        Dialect::Sqlite => '?',
        Dialect::Postgres => '$',
    };

    let mut out = String::with_capacity(sql.len() + 8);
    let mut highest = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), _) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '?') => {
                let mut digits = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let position = if digits.is_empty() {
                    highest + 1
                } else {
                    digits
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            StoreError::Unsupported(format!("invalid placeholder ?{digits}"))
                        })?
                };
                highest = highest.max(position);
                out.push(marker);
                out.push_str(&position.to_string());
            }
            (None, _) => out.push(c),
        }
    }

    if quote.is_some() {
        return Err(StoreError::Unsupported("unterminated quoted literal".into()));
    }
    Ok((out, highest))
}

/// Reject identifiers that could smuggle SQL into interpolated names.
pub fn ensure_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::Unsupported(format!("invalid identifier '{name}'")))
    }
}

fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    let end = s
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

fn unquote(name: &str) -> &str {
    name.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == needle => return Some(i),
            None => {}
        }
    }
    None
}

/// Upper-cased bare words, skipping quoted literals and identifiers.
fn unquoted_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c.is_ascii_alphanumeric() || c == '_' => {
                current.push(c.to_ascii_uppercase());
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn contains_keyword_pair(statement: &str) -> bool {
    unquoted_words(statement).windows(3).any(|w| {
        w[0] == "INSERT" && w[1] == "OR" && (w[2] == "REPLACE" || w[2] == "IGNORE")
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Explicitly numbered placeholders keep their positions in any order.
        #[test]
        fn numbered_positions_survive(order in proptest::collection::vec(1usize..=6, 0..12)) {
            let sql: String = order.iter().map(|n| format!("?{n} ")).collect();
            let (out, highest) = translate_placeholders(&sql, Dialect::Postgres).unwrap();
            let expected: String = order.iter().map(|n| format!("${n} ")).collect();
            prop_assert_eq!(out, expected);
            prop_assert_eq!(highest, order.iter().copied().max().unwrap_or(0));
        }

        /// Bare placeholders are numbered 1..=N left to right.
        #[test]
        fn bare_positions_are_sequential(n in 0usize..20) {
            let sql = vec!["?"; n].join(", ");
            let (out, highest) = translate_placeholders(&sql, Dialect::Postgres).unwrap();
            let expected = (1..=n).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
            prop_assert_eq!(out, expected);
            prop_assert_eq!(highest, n);
        }
    }
}
