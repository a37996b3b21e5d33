//! Ordered, versioned schema migrations, recorded per partition.
//!
//! Every partition carries its own `migrations` table. The runner reads the
//! highest recorded sequence number and applies every newer migration in
//! ascending order, recording each one as soon as it succeeds. A failure
//! stops the run; running again resumes at the first unapplied migration.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TenancyError, TenancyResult};
use crate::manager::TenantSessionManager;
use crate::session::SqlValue;

pub const MIGRATIONS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS migrations (\
     id SERIAL PRIMARY KEY, \
     sequence_number BIGINT NOT NULL UNIQUE, \
     name TEXT NOT NULL, \
     applied_at TIMESTAMPTZ NOT NULL DEFAULT now())";

pub const CURRENT_SEQUENCE_SQL: &str =
    "SELECT COALESCE(MAX(sequence_number), 0) AS current FROM migrations";

pub const RECORD_MIGRATION_SQL: &str =
    "INSERT INTO migrations (sequence_number, name) VALUES ($1, $2)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub sequence: i64,
    pub name: String,
    pub sql: String,
    /// Run inside `BEGIN … COMMIT` together with its record. Turn off for
    /// statements PostgreSQL refuses inside a transaction block.
    pub transactional: bool,
}

impl Migration {
    pub fn new(sequence: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            sequence,
            name: name.into(),
            sql: sql.into(),
            transactional: true,
        }
    }

    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// `0003_email_verification`
    pub fn label(&self) -> String {
        format!("{:04}_{}", self.sequence, self.name)
    }
}

const SHARED: [(i64, &str, &str); 3] = [
    (1, "initial", include_str!("../migrations/shared/0001_initial.sql")),
    (2, "user_roles", include_str!("../migrations/shared/0002_user_roles.sql")),
    (
        3,
        "email_verification",
        include_str!("../migrations/shared/0003_email_verification.sql"),
    ),
];

const TENANT: [(i64, &str, &str); 2] = [
    (1, "initial", include_str!("../migrations/tenant/0001_initial.sql")),
    (2, "indexes", include_str!("../migrations/tenant/0002_indexes.sql")),
];

/// A validated, strictly ascending list of migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(migrations: Vec<Migration>) -> TenancyResult<Self> {
        let mut previous = 0;
        for migration in &migrations {
            if migration.sequence <= 0 {
                return Err(TenancyError::InvalidMigrationSet(format!(
                    "sequence numbers must be positive, got {} for {}",
                    migration.sequence, migration.name
                )));
            }
            if migration.sequence <= previous {
                return Err(TenancyError::InvalidMigrationSet(format!(
                    "sequence {} ({}) does not follow {}",
                    migration.sequence, migration.name, previous
                )));
            }
            previous = migration.sequence;
        }
        Ok(Self { migrations })
    }

    /// Tables of the shared `public` partition.
    pub fn shared() -> Self {
        Self::embedded(&SHARED)
    }

    /// Business tables created in every tenant partition.
    pub fn tenant() -> Self {
        Self::embedded(&TENANT)
    }

    fn embedded(entries: &[(i64, &str, &str)]) -> Self {
        Self {
            migrations: entries
                .iter()
                .map(|(sequence, name, sql)| Migration::new(*sequence, *name, *sql))
                .collect(),
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest(&self) -> i64 {
        self.migrations.last().map(|m| m.sequence).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Sequence numbers applied by this run, ascending.
    pub applied: Vec<i64>,
    /// Highest sequence already recorded before this run.
    pub already_applied: i64,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MigrationRunner {
    set: MigrationSet,
}

impl MigrationRunner {
    pub fn new(set: MigrationSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> &MigrationSet {
        &self.set
    }

    /// Bring the session's partition up to date.
    pub async fn run(&self, session: &TenantSessionManager) -> TenancyResult<MigrationReport> {
        let partition = session.partition_key().to_string();

        session
            .execute(MIGRATIONS_TABLE_DDL, &[])
            .await
            .map_err(|e| self.failed(&partition, "migrations table", e))?;

        let current = current_sequence(session)
            .await
            .map_err(|e| self.failed(&partition, "migration status", e))?;

        let mut report = MigrationReport {
            applied: Vec::new(),
            already_applied: current,
        };

        if current > self.set.latest() {
            warn!(
                partition = %partition,
                recorded = current,
                known = self.set.latest(),
                "partition is ahead of the known migrations"
            );
            return Ok(report);
        }

        for migration in self.set.migrations().iter().filter(|m| m.sequence > current) {
            debug!(partition = %partition, migration = %migration.label(), "applying migration");

            apply(session, migration)
                .await
                .map_err(|e| self.failed(&partition, &format!("migration {}", migration.label()), e))?;

            info!(partition = %partition, migration = %migration.label(), "migration applied");
            report.applied.push(migration.sequence);
        }

        if report.is_noop() {
            debug!(partition = %partition, current, "partition already up to date");
        }

        Ok(report)
    }

    fn failed(&self, partition: &str, step: &str, source: TenancyError) -> TenancyError {
        TenancyError::Provisioning {
            partition: partition.to_string(),
            migration: step.to_string(),
            source: Box::new(source),
        }
    }
}

async fn current_sequence(session: &TenantSessionManager) -> TenancyResult<i64> {
    let rows = session.raw_query(CURRENT_SEQUENCE_SQL, &[]).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("current"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0))
}

async fn apply(session: &TenantSessionManager, migration: &Migration) -> TenancyResult<()> {
    let record: [SqlValue; 2] = [migration.sequence.into(), migration.name.clone().into()];

    if !migration.transactional {
        session.batch(&migration.sql).await?;
        session.execute(RECORD_MIGRATION_SQL, &record).await?;
        return Ok(());
    }

    session.batch("BEGIN").await?;
    let outcome = async {
        session.batch(&migration.sql).await?;
        session.execute(RECORD_MIGRATION_SQL, &record).await?;
        session.batch("COMMIT").await
    }
    .await;

    if outcome.is_err() {
        if let Err(rollback) = session.batch("ROLLBACK").await {
            warn!(error = %rollback, migration = %migration.label(), "rollback failed");
        }
    }
    outcome
}
