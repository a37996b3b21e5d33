//! tms-tenancy: schema-per-tenant data access.
//!
//! - [`TenantSessionManager`]: one lazily acquired, partition-scoped session per request
//! - [`MigrationRunner`] / [`MigrationSet`]: ordered migrations recorded per partition
//! - [`PartitionProvisioner`]: create, migrate, look up and drop tenant partitions
//! - [`TenantRegistrar`]: tenant sign-up and login on the shared partition
//!
//! Backends implement [`SessionPool`]: `PgSessionPool` (feature `postgres`) for
//! production and `MemoryPool` (feature `memory`) for tests.

pub mod entity;
pub mod error;
pub mod manager;
pub mod migrate;
pub mod provision;
pub mod registration;
pub mod session;

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use entity::{DataHandle, EntityKind};
pub use error::{TenancyError, TenancyResult};
pub use manager::{isolation_directive, TenantSessionManager};
pub use migrate::{Migration, MigrationReport, MigrationRunner, MigrationSet};
pub use provision::PartitionProvisioner;
pub use registration::{
    AuthenticatedUser, LoginResponse, RegisterTenant, RegisteredTenant, TenantRegistrar, TenantStatus,
};
pub use session::{PooledSession, Row, SessionPool, SqlValue};

#[cfg(feature = "memory")]
pub use memory::{MemoryPool, StatementRecord};
#[cfg(feature = "postgres")]
pub use postgres::{PgSessionPool, PoolConfig};
