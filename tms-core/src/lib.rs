//! tms-core: framework-agnostic core for the TMS backend.
//!
//! Holds the types every other crate agrees on: partition keys, the
//! per-request tenant context, caller roles, the structured error type
//! that crosses the HTTP boundary, and the key/value configuration store.

pub mod config;
pub mod errors;
pub mod tenant;

pub use config::{TmsConfig, TmsConfigSnapshot};
pub use errors::{ErrorKind, TmsError};
pub use tenant::{PartitionKey, PartitionKeyError, RequestTenantContext, Role};
