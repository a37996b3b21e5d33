//! Extractors over what [`tenant_layer`](crate::middlewares::tenant_layer) puts in the request.

use std::ops::Deref;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use tms_core::{errors::TmsError, RequestTenantContext, Role};
use tms_tenancy::TenantSessionManager;

use crate::TmsAxumError;

fn layer_missing() -> TmsAxumError {
    TmsError::general_error("tenant layer is not installed on this router").into()
}

/// The request's session manager.
#[derive(Clone)]
pub struct TenantSession(pub Arc<TenantSessionManager>);

impl Deref for TenantSession {
    type Target = Arc<TenantSessionManager>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for TenantSession {
    type Rejection = TmsAxumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<TenantSessionManager>>()
            .cloned()
            .map(TenantSession)
            .ok_or_else(layer_missing)
    }
}

/// The resolved tenant context. Anonymous requests get the `public` context.
#[derive(Clone, Debug)]
pub struct TenantCtx(pub RequestTenantContext);

impl<S: Send + Sync> FromRequestParts<S> for TenantCtx {
    type Rejection = TmsAxumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestTenantContext>()
            .cloned()
            .map(TenantCtx)
            .ok_or_else(layer_missing)
    }
}

/// An authenticated caller; rejects anonymous requests with 401.
#[derive(Clone, Debug)]
pub struct RequireCaller(pub RequestTenantContext);

impl RequireCaller {
    pub fn caller_id(&self) -> &str {
        self.0.caller_id.as_deref().unwrap_or_default()
    }

    pub fn require_role(&self, role: Role) -> Result<(), TmsAxumError> {
        if self.0.caller_role == Some(role) {
            Ok(())
        } else {
            Err(TmsError::forbidden(format!("This action requires the {} role", role.as_str())).into())
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequireCaller {
    type Rejection = TmsAxumError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TenantCtx(context) = TenantCtx::from_request_parts(parts, state).await?;
        if !context.is_authenticated() {
            return Err(TmsError::not_authenticated("Authentication required").into());
        }
        Ok(RequireCaller(context))
    }
}
