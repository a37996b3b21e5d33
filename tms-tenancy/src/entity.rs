//! Tenant-scoped entity tables and the data handles that reach them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TenancyResult;
use crate::manager::TenantSessionManager;
use crate::session::{Row, SqlValue};

/// Business entities that live inside every tenant partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Order,
    Vehicle,
    Driver,
    Supplier,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Order,
        EntityKind::Vehicle,
        EntityKind::Driver,
        EntityKind::Supplier,
    ];

    /// Unqualified table name; resolved through the session's search_path.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Order => "orders",
            EntityKind::Vehicle => "vehicles",
            EntityKind::Driver => "drivers",
            EntityKind::Supplier => "suppliers",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Access to one entity table through the request's tenant session.
///
/// Cloning is cheap; every clone and every handle of the same request share
/// the one underlying session.
#[derive(Clone)]
pub struct DataHandle {
    manager: Arc<TenantSessionManager>,
    kind: EntityKind,
}

impl DataHandle {
    pub(crate) fn new(manager: Arc<TenantSessionManager>, kind: EntityKind) -> Self {
        Self { manager, kind }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub async fn find(&self, limit: i64, offset: i64) -> TenancyResult<Vec<Row>> {
        let sql = format!(
            "SELECT * FROM \"{}\" ORDER BY \"createdAt\" DESC LIMIT $1 OFFSET $2",
            self.kind.table()
        );
        self.manager
            .raw_query(&sql, &[limit.max(0).into(), offset.max(0).into()])
            .await
    }

    pub async fn get(&self, id: Uuid) -> TenancyResult<Option<Row>> {
        let sql = format!("SELECT * FROM \"{}\" WHERE \"id\" = $1", self.kind.table());
        let mut rows = self.manager.raw_query(&sql, &[id.into()]).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }

    pub async fn count(&self) -> TenancyResult<i64> {
        let sql = format!("SELECT COUNT(*) AS \"count\" FROM \"{}\"", self.kind.table());
        let rows = self.manager.raw_query(&sql, &[]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// Returns whether a row was deleted.
    pub async fn remove(&self, id: Uuid) -> TenancyResult<bool> {
        let sql = format!("DELETE FROM \"{}\" WHERE \"id\" = $1", self.kind.table());
        Ok(self.manager.execute(&sql, &[id.into()]).await? > 0)
    }

    /// `SELECT *` with a caller-supplied `WHERE` clause; values go in `params`.
    pub async fn query(&self, where_sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>> {
        let sql = format!("SELECT * FROM \"{}\" WHERE {}", self.kind.table(), where_sql);
        self.manager.raw_query(&sql, params).await
    }
}
