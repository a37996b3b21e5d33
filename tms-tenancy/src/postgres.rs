//! PostgreSQL session pool on top of `sqlx::PgPool`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgPoolOptions, PgTypeInfo};
use sqlx::{Encode, PgPool, Postgres, Type};
use tracing::{debug, warn};

use crate::error::{TenancyError, TenancyResult};
use crate::session::{PooledSession, Row, SessionPool, SqlValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl PoolConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Sessions backed by pooled PostgreSQL connections.
///
/// Connections are reset with `RESET search_path` on their way back into the
/// pool; a connection that cannot be reset is closed instead of reused.
#[derive(Clone)]
pub struct PgSessionPool {
    pool: PgPool,
}

impl PgSessionPool {
    pub async fn connect(config: &PoolConfig) -> TenancyResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    match sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("RESET search_path")).await {
                        Ok(_) => Ok(true),
                        Err(err) => {
                            warn!(error = %err, "could not reset search_path, closing connection");
                            Ok(false)
                        }
                    }
                })
            })
            .connect(&config.url)
            .await
            .map_err(|e| TenancyError::Acquisition(e.to_string()))?;

        debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "postgres pool connected"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool. Connections returned to it are not reset.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SessionPool for PgSessionPool {
    async fn acquire(&self) -> TenancyResult<Box<dyn PooledSession>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| TenancyError::Acquisition(e.to_string()))?;
        Ok(Box::new(PgPooledSession { conn }))
    }
}

struct PgPooledSession {
    conn: PoolConnection<Postgres>,
}

/// A NULL parameter sent without a type (oid 0), so the server infers it
/// from the column or expression it lands in.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

macro_rules! bind_all {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                SqlValue::Null => query.bind(UntypedNull),
                SqlValue::Bool(v) => query.bind(*v),
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Float(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Uuid(v) => query.bind(*v),
                SqlValue::Json(v) => query.bind(v.clone()),
                SqlValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }};
}

/// Rows come back as one JSON object each, built by the server, in the
/// order the inner query produced them.
///
/// The inner query sits on its own lines so a trailing `--` comment cannot
/// swallow the closing parenthesis.
fn wrap_for_json(sql: &str) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!(
        "WITH q AS MATERIALIZED (\n{inner}\n)\n\
         SELECT row_to_json(n.q) FROM (SELECT q, row_number() OVER () AS ord FROM q) n ORDER BY n.ord"
    )
}

#[async_trait]
impl PooledSession for PgPooledSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<u64> {
        let query = bind_all!(sqlx::query::<Postgres>(sql), params);
        let done = query.execute(&mut *self.conn).await?;
        Ok(done.rows_affected())
    }

    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>> {
        let wrapped = wrap_for_json(sql);
        let query = bind_all!(sqlx::query_scalar::<Postgres, Value>(&wrapped), params);
        let values = query.fetch_all(&mut *self.conn).await?;

        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(TenancyError::Query(format!("expected a row object, got {other}"))),
            })
            .collect()
    }

    async fn batch(&mut self, script: &str) -> TenancyResult<()> {
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(script)).await?;
        Ok(())
    }

    async fn release(self: Box<Self>) {
        drop(self.conn);
    }

    async fn discard(self: Box<Self>) {
        if let Err(err) = self.conn.close().await {
            debug!(error = %err, "error while closing discarded connection");
        }
    }
}
