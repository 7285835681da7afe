use super::{Dialect, Row, SqlValue, StoreResult};

/// A connected storage engine.
///
/// Statements reaching a backend have already been adapted to its dialect
/// and checked against their parameter count by [`super::Database`].
#[async_trait::async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Run one statement. Returns the number of rows changed.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64>;

    /// Run one statement per parameter row inside a single transaction.
    async fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> StoreResult<u64>;

    /// Run a query and collect every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>>;

    /// Run parameterless statements separated by `;` (schema DDL).
    async fn execute_batch(&self, sql: &str) -> StoreResult<()>;

    /// Flush and release resources before the handle is dropped.
    async fn close(&self) -> StoreResult<()>;
}
