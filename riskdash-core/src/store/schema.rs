//! Table layout for raw records and result caches.
//!
//! Every dataset gets one raw table keyed by its key field plus one cache
//! table per AI function:
//!
//! ```text
//! <table>            (<key> PK, title, category, risk_theme, risk_subtheme, raw_data, created_at)
//! <dataset>_<func>   (<key> PK, payload, created_at, FK <key> -> <table>)
//! ```

use std::fmt::Write as _;

use crate::datasets::Dataset;

use super::Dialect;
use super::adapter::ensure_identifier;
use super::StoreResult;

/// Pragmas applied to every embedded connection.
pub const SQLITE_PRAGMAS: &str = "
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -200000;
";

/// Generate idempotent DDL for every dataset in `dialect`.
pub fn schema_sql(dialect: Dialect) -> StoreResult<String> {
    // Payloads are stored as text on the embedded engine so JSON scalars
    // keep their exact text instead of picking up numeric affinity.
    let json_type = match dialect {
        Dialect::Sqlite => "TEXT",
        Dialect::Postgres => "JSONB",
    };

    let mut sql = String::new();
    for dataset in Dataset::ALL {
        let config = dataset.config();
        let table = ensure_identifier(config.table)?;
        let key = ensure_identifier(config.key_field)?;
        let name = dataset.as_str();

        let _ = write!(
            sql,
            "CREATE TABLE IF NOT EXISTS {table} (
    {key} TEXT PRIMARY KEY,
    title TEXT,
    category TEXT,
    risk_theme TEXT,
    risk_subtheme TEXT,
    raw_data {json_type},
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_{name}_risk_theme ON {table}(risk_theme);
CREATE INDEX IF NOT EXISTS idx_{name}_risk_subtheme ON {table}(risk_subtheme);
"
        );

        for function in config.ai_functions {
            let cache = dataset.cache_table(function);
            let cache = ensure_identifier(&cache)?;
            let _ = write!(
                sql,
                "CREATE TABLE IF NOT EXISTS {cache} (
    {key} TEXT PRIMARY KEY,
    payload {json_type},
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY ({key}) REFERENCES {table}({key})
);
"
            );
        }
    }
    Ok(sql)
}

/// Every table the schema creates, raw tables first.
pub fn all_tables() -> Vec<String> {
    let mut tables: Vec<String> = Dataset::ALL
        .iter()
        .map(|d| d.config().table.to_string())
        .collect();
    for dataset in Dataset::ALL {
        for function in dataset.config().ai_functions {
            tables.push(dataset.cache_table(function));
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_raw_and_cache_tables() {
        let sql = schema_sql(Dialect::Sqlite).unwrap();
        for table in all_tables() {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
        assert!(sql.contains("FOREIGN KEY (issue_id) REFERENCES issues_raw(issue_id)"));
        assert!(sql.contains("idx_controls_risk_theme"));
        assert!(!sql.contains("JSONB"));
    }

    #[test]
    fn postgres_uses_jsonb() {
        let sql = schema_sql(Dialect::Postgres).unwrap();
        assert!(sql.contains("payload JSONB"));
        assert!(sql.contains("raw_data JSONB"));
    }

    #[test]
    fn table_count() {
        assert_eq!(all_tables().len(), 20);
    }
}
