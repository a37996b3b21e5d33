//! The seam between the session manager and the database driver.
//!
//! A [`SessionPool`] hands out [`PooledSession`]s: one physical connection
//! each, owned by exactly one caller until it is released or discarded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TenancyResult;

/// One result row, column name to JSON value.
pub type Row = Map<String, Value>;

/// A bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A single pooled connection.
#[async_trait]
pub trait PooledSession: Send {
    /// Run one parameterized statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<u64>;

    /// Run one parameterized query, returning its rows.
    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>>;

    /// Run a multi-statement script without parameters.
    async fn batch(&mut self, script: &str) -> TenancyResult<()>;

    /// Give the connection back to the pool.
    async fn release(self: Box<Self>);

    /// Close the connection instead of returning it; used when its state is unknown.
    async fn discard(self: Box<Self>);
}

/// Source of sessions. Shared by every request.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn acquire(&self) -> TenancyResult<Box<dyn PooledSession>>;
}
