//! Tenant partition provisioning.
//!
//! A partition is a PostgreSQL schema named after the tenant's partition key.
//! Provisioning creates it, then migrates it through a dedicated session that
//! is scoped to the new partition and released however the run ends.

use std::sync::Arc;

use tms_core::{PartitionKey, RequestTenantContext};
use tracing::{error, info, instrument};

use crate::error::{TenancyError, TenancyResult};
use crate::manager::TenantSessionManager;
use crate::migrate::{MigrationReport, MigrationRunner, MigrationSet};
use crate::session::{SessionPool, SqlValue};

pub const SCHEMA_EXISTS_SQL: &str = "SELECT EXISTS (\
     SELECT 1 FROM information_schema.schemata WHERE schema_name = $1\
     ) AS \"exists\"";

#[derive(Clone)]
pub struct PartitionProvisioner {
    pool: Arc<dyn SessionPool>,
    runner: Arc<MigrationRunner>,
}

impl PartitionProvisioner {
    pub fn new(pool: Arc<dyn SessionPool>, migrations: MigrationSet) -> Self {
        Self {
            pool,
            runner: Arc::new(MigrationRunner::new(migrations)),
        }
    }

    /// Provisioner for tenant partitions, using the embedded tenant migrations.
    pub fn for_tenants(pool: Arc<dyn SessionPool>) -> Self {
        Self::new(pool, MigrationSet::tenant())
    }

    /// Create the partition if needed and apply every pending migration.
    ///
    /// Calling this again on a provisioned partition applies nothing; calling
    /// it after a failure resumes at the first unapplied migration.
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn provision_partition(&self, key: &PartitionKey) -> TenancyResult<MigrationReport> {
        ensure_provisionable(key)?;

        let create = format!("CREATE SCHEMA IF NOT EXISTS {}", key.quoted());
        self.scoped(PartitionKey::public(), |session| async move {
            session.execute(&create, &[]).await.map(|_| ())
        })
        .await
        .map_err(|source| TenancyError::Provisioning {
            partition: key.to_string(),
            migration: "schema creation".to_string(),
            source: Box::new(source),
        })?;

        let result = self.migrate(key).await;

        match &result {
            Ok(report) => info!(
                applied = report.applied.len(),
                already_applied = report.already_applied,
                "partition provisioned"
            ),
            Err(err) => error!(error = %err, "partition provisioning failed"),
        }
        result
    }

    /// Apply pending migrations to a partition that already exists. Used at
    /// boot for the shared partition, which is never provisioned.
    pub async fn migrate(&self, key: &PartitionKey) -> TenancyResult<MigrationReport> {
        let runner = Arc::clone(&self.runner);
        self.scoped(key.clone(), |session| async move { runner.run(&session).await })
            .await
    }

    pub async fn partition_exists(&self, key: &PartitionKey) -> TenancyResult<bool> {
        let name = key.to_string();
        let rows = self
            .scoped(PartitionKey::public(), |session| async move {
                session.raw_query(SCHEMA_EXISTS_SQL, &[SqlValue::Text(name)]).await
            })
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.get("exists"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Drop the partition and everything in it.
    #[instrument(skip(self), fields(partition = %key))]
    pub async fn drop_partition(&self, key: &PartitionKey) -> TenancyResult<()> {
        ensure_provisionable(key)?;

        let statement = format!("DROP SCHEMA IF EXISTS {} CASCADE", key.quoted());
        self.scoped(PartitionKey::public(), |session| async move {
            session.execute(&statement, &[]).await.map(|_| ())
        })
        .await?;

        info!("partition dropped");
        Ok(())
    }

    /// Run `f` on a fresh session scoped to `partition`, releasing it afterwards
    /// whether `f` succeeded or not.
    async fn scoped<T, F, Fut>(&self, partition: PartitionKey, f: F) -> TenancyResult<T>
    where
        F: FnOnce(Arc<TenantSessionManager>) -> Fut,
        Fut: std::future::Future<Output = TenancyResult<T>>,
    {
        let session = TenantSessionManager::new(
            RequestTenantContext::for_partition(partition),
            Arc::clone(&self.pool),
        );
        let result = f(Arc::clone(&session)).await;
        session.release().await;
        result
    }
}

fn ensure_provisionable(key: &PartitionKey) -> TenancyResult<()> {
    if key.is_reserved() {
        return Err(TenancyError::ReservedPartition(key.to_string()));
    }
    Ok(())
}
