use std::sync::Arc;

use tms_auth::TenantIdentityResolver;
use tms_tenancy::{SessionPool, TenantRegistrar};

/// Process-wide services shared by every request.
pub struct TmsState {
    pub pool: Arc<dyn SessionPool>,
    pub resolver: TenantIdentityResolver,
    pub registrar: TenantRegistrar,
    /// Render 5xx messages verbatim instead of the generic text.
    pub expose_errors: bool,
}

impl Clone for TmsState {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            resolver: self.resolver.clone(),
            registrar: self.registrar.clone(),
            expose_errors: self.expose_errors,
        }
    }
}

impl TmsState {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        resolver: TenantIdentityResolver,
        registrar: TenantRegistrar,
    ) -> Self {
        Self {
            pool,
            resolver,
            registrar,
            expose_errors: false,
        }
    }

    pub fn expose_errors(mut self, expose: bool) -> Self {
        self.expose_errors = expose;
        self
    }
}
