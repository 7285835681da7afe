use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use crate::config::redact_dsn;
use crate::error::StoreError;

use super::adapter::ensure_identifier;
use super::{Backend, Dialect, Row, SqlValue, StoreResult};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Client/server backend: a fixed pool of `tokio_postgres` clients.
///
/// Each client's connection future runs on its own spawned task. A
/// semaphore bounds concurrent use to the pool size; within a permit the
/// first idle client is taken, starting from a rotating offset.
pub struct PostgresBackend {
    clients: Vec<Mutex<Client>>,
    permits: Semaphore,
    next: AtomicUsize,
    schema: String,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool_size", &self.clients.len())
            .field("available", &self.permits.available_permits())
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// A client checked out of the pool. Dropping it returns the client.
struct PooledClient<'a> {
    client: MutexGuard<'a, Client>,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl PostgresBackend {
    /// Open `pool_size` connections, create `schema` if missing and point
    /// every connection's `search_path` at it.
    pub async fn connect(url: &str, schema: &str, pool_size: usize) -> StoreResult<Self> {
        let schema = ensure_identifier(schema)?.to_string();
        let pool_size = pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);

        for idx in 0..pool_size {
            let (client, connection) = tokio_postgres::connect(url, NoTls)
                .await
                .map_err(|e| StoreError::Connect(format!("{}: {e}", redact_dsn(url))))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(pool_slot = idx, "postgres connection error: {e}");
                }
            });
            clients.push(client);
        }

        if let Some(first) = clients.first() {
            first
                .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .await?;
        }
        for client in &clients {
            client
                .batch_execute(&format!("SET search_path TO {schema}"))
                .await?;
        }

        debug!(pool_size, %schema, "postgres pool ready");
        Ok(Self {
            clients: clients.into_iter().map(Mutex::new).collect(),
            permits: Semaphore::new(pool_size),
            next: AtomicUsize::new(0),
            schema,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn pool_size(&self) -> usize {
        self.clients.len()
    }

    async fn client(&self) -> StoreResult<PooledClient<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Connect("connection pool closed".into()))?;
        let n = self.clients.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            if let Ok(client) = self.clients[(start + offset) % n].try_lock() {
                return Ok(PooledClient {
                    client,
                    _permit: permit,
                });
            }
        }
        let client = self.clients[start % n].lock().await;
        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }
}

/// Convert one portable value into something bindable as `ty`.
fn to_param(value: &SqlValue, ty: &Type) -> StoreResult<BoxedParam> {
    let mismatch = || StoreError::Decode(format!("cannot bind {value:?} as {ty}"));
    let param: BoxedParam = match value {
        SqlValue::Null => match *ty {
            Type::INT8 => Box::new(Option::<i64>::None),
            Type::INT4 => Box::new(Option::<i32>::None),
            Type::FLOAT8 => Box::new(Option::<f64>::None),
            Type::BOOL => Box::new(Option::<bool>::None),
            Type::JSON | Type::JSONB => Box::new(Option::<serde_json::Value>::None),
            _ => Box::new(Option::<String>::None),
        },
        SqlValue::Integer(i) => match *ty {
            Type::INT8 => Box::new(*i),
            Type::INT4 => Box::new(i32::try_from(*i).map_err(|_| mismatch())?),
            Type::INT2 => Box::new(i16::try_from(*i).map_err(|_| mismatch())?),
            Type::FLOAT8 => Box::new(*i as f64),
            Type::BOOL => Box::new(*i != 0),
            Type::JSON | Type::JSONB => Box::new(serde_json::Value::from(*i)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::UNKNOWN => Box::new(i.to_string()),
            _ => return Err(mismatch()),
        },
        SqlValue::Real(f) => match *ty {
            Type::FLOAT8 => Box::new(*f),
            Type::JSON | Type::JSONB => Box::new(serde_json::Value::from(*f)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::UNKNOWN => Box::new(f.to_string()),
            _ => return Err(mismatch()),
        },
        SqlValue::Text(s) => match *ty {
            Type::JSON | Type::JSONB => Box::new(
                serde_json::from_str::<serde_json::Value>(s)
                    .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            ),
            Type::INT8 => Box::new(s.parse::<i64>().map_err(|_| mismatch())?),
            Type::INT4 => Box::new(s.parse::<i32>().map_err(|_| mismatch())?),
            _ => Box::new(s.clone()),
        },
        SqlValue::Json(v) => match *ty {
            Type::JSON | Type::JSONB => Box::new(v.clone()),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::UNKNOWN => Box::new(v.to_string()),
            _ => return Err(mismatch()),
        },
    };
    Ok(param)
}

fn bind(params: &[SqlValue], types: &[Type]) -> StoreResult<Vec<BoxedParam>> {
    if params.len() != types.len() {
        return Err(StoreError::ParameterCount {
            expected: types.len(),
            got: params.len(),
        });
    }
    params
        .iter()
        .zip(types)
        .map(|(value, ty)| to_param(value, ty))
        .collect()
}

fn as_refs(boxed: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn decode_row(row: &tokio_postgres::Row) -> StoreResult<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)?
                .map_or(SqlValue::Null, |b| SqlValue::Integer(i64::from(b))),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)?
                .map_or(SqlValue::Null, |i| SqlValue::Integer(i64::from(i))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)?
                .map_or(SqlValue::Null, |i| SqlValue::Integer(i64::from(i))),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Integer),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)?
                .map_or(SqlValue::Null, |f| SqlValue::Real(f64::from(f))),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Real),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Json),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .map_err(|_| {
                    StoreError::Decode(format!(
                        "unsupported column type {} for {}",
                        column.type_(),
                        column.name()
                    ))
                })?
                .map_or(SqlValue::Null, SqlValue::Text),
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

#[async_trait::async_trait]
impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let client = self.client().await?;
        let stmt = client.prepare(sql).await?;
        let boxed = bind(params, stmt.params())?;
        Ok(client.execute(&stmt, &as_refs(&boxed)).await?)
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> StoreResult<u64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(sql).await?;
        let mut changed = 0u64;
        for row in rows {
            let boxed = bind(row, stmt.params())?;
            changed += tx.execute(&stmt, &as_refs(&boxed)).await?;
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let client = self.client().await?;
        let stmt = client.prepare(sql).await?;
        let boxed = bind(params, stmt.params())?;
        client
            .query(&stmt, &as_refs(&boxed))
            .await?
            .iter()
            .map(decode_row)
            .collect()
    }

    async fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let client = self.client().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        // Connections shut down when their clients are dropped with the handle.
        debug!(schema = %self.schema, "closing postgres pool");
        self.permits.close();
        Ok(())
    }
}
