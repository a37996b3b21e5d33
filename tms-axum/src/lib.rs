//! tms-axum: HTTP surface for the TMS backend.
//!
//! [`TmsApp`] wires the tenant layer, request ids and tracing around the
//! auth and health routes. Handlers reach the request's partition-scoped
//! session through the [`TenantSession`] extractor.

pub mod app;
pub mod extract;
pub mod middlewares;
pub mod routes;
pub mod state;
mod error;

pub use app::TmsApp;
pub use error::{ResponseScope, TmsAxumError};
pub use extract::{RequireCaller, TenantCtx, TenantSession};
pub use middlewares::tenant_layer;
pub use state::TmsState;
