use thiserror::Error;
use tms_core::{ErrorKind, PartitionKeyError, TmsError};

/// Result type for tenancy operations
pub type TenancyResult<T> = Result<T, TenancyError>;

/// Failures of the session manager, migration runner and provisioning service
#[derive(Error, Debug)]
pub enum TenancyError {
    #[error("Could not acquire a database session: {0}")]
    Acquisition(String),

    #[error("Could not scope session to partition {partition}: {reason}")]
    Isolation { partition: String, reason: String },

    #[error("Statements may not change the session search_path")]
    IsolationViolation,

    #[error("Tenant session has already been released")]
    SessionReleased,

    #[error("Invalid partition key: {0}")]
    InvalidPartitionKey(#[from] PartitionKeyError),

    #[error("Partition {0} is reserved")]
    ReservedPartition(String),

    #[error("Provisioning partition {partition} failed at {migration}: {source}")]
    Provisioning {
        partition: String,
        migration: String,
        #[source]
        source: Box<TenancyError>,
    },

    #[error("Invalid migration set: {0}")]
    InvalidMigrationSet(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotAuthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TenancyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Acquisition(_) => ErrorKind::Unavailable,
            Self::InvalidPartitionKey(_)
            | Self::ReservedPartition(_)
            | Self::InvalidMigrationSet(_)
            | Self::InvalidInput(_) => ErrorKind::BadRequest,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotAuthenticated(_) => ErrorKind::NotAuthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Isolation { .. }
            | Self::IsolationViolation
            | Self::SessionReleased
            | Self::Provisioning { .. }
            | Self::Query(_)
            | Self::Internal(_) => ErrorKind::GeneralError,
        }
    }

    /// Name of the migration (or step) a provisioning failure stopped at.
    pub fn failed_migration(&self) -> Option<&str> {
        match self {
            Self::Provisioning { migration, .. } => Some(migration),
            _ => None,
        }
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        TmsError::from(self).into_anyhow()
    }
}

impl From<TenancyError> for TmsError {
    fn from(err: TenancyError) -> Self {
        TmsError::new(err.kind(), err.to_string()).with_source(anyhow::Error::new(err))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for TenancyError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Acquisition(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(db.message().to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(TmsError::from(TenancyError::Acquisition("timeout".into())).code(), 503);
        assert_eq!(TmsError::from(TenancyError::IsolationViolation).code(), 500);
        assert_eq!(TmsError::from(TenancyError::SessionReleased).code(), 500);
        assert_eq!(TmsError::from(TenancyError::ReservedPartition("public".into())).code(), 400);
        assert_eq!(TmsError::from(TenancyError::Conflict("Email already exists".into())).code(), 409);
        assert_eq!(TmsError::from(TenancyError::NotFound("No tenant".into())).code(), 404);
        assert_eq!(TmsError::from(TenancyError::NotAuthenticated("Invalid credentials".into())).code(), 401);
        assert_eq!(TmsError::from(TenancyError::Forbidden("Tenant is not active".into())).code(), 403);
    }

    #[test]
    fn provisioning_names_the_failed_migration() {
        let err = TenancyError::Provisioning {
            partition: "tenant_a".into(),
            migration: "migration 2 (indexes)".into(),
            source: Box::new(TenancyError::Query("syntax error".into())),
        };
        assert_eq!(err.failed_migration(), Some("migration 2 (indexes)"));
        assert!(err.to_string().contains("tenant_a"));
        assert!(err.to_string().contains("syntax error"));
    }
}
