//! Per-request tenant scoping.
//!
//! For every request the layer resolves the caller from the `Authorization`
//! header, creates a [`TenantSessionManager`] and stores both in the request
//! extensions. The handler runs inside a span tagged with the partition; the
//! session (if the handler touched data) goes back to the pool once the
//! response is built, whatever the outcome. A request dropped mid-flight
//! releases through the manager's `Drop`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tms_tenancy::TenantSessionManager;
use tracing::{debug, info_span, Instrument};

use crate::error::ResponseScope;
use crate::TmsState;

pub async fn tenant_layer(State(state): State<TmsState>, mut req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let context = state.resolver.resolve(authorization);

    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let span = info_span!(
        "tenant_request",
        partition = %context.partition_key,
        caller = context.caller_id.as_deref().unwrap_or("-"),
        request_id = request_id.as_deref().unwrap_or("-"),
    );

    let manager = TenantSessionManager::new(context.clone(), Arc::clone(&state.pool));
    req.extensions_mut().insert(context);
    req.extensions_mut().insert(Arc::clone(&manager));

    let scope = ResponseScope {
        request_id,
        expose_errors: state.expose_errors,
    };

    async move {
        let response = scope.run(next.run(req)).await;
        manager.release().await;
        debug!(status = response.status().as_u16(), "request finished");
        response
    }
    .instrument(span)
    .await
}
