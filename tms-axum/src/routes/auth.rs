use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tms_core::errors::TmsError;
use tms_tenancy::{LoginResponse, RegisterTenant, RegisteredTenant};

use crate::extract::RequireCaller;
use crate::{TmsAxumError, TmsState};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub(crate) fn map_json_rejection(rejection: JsonRejection) -> TmsAxumError {
    TmsError::bad_request("Failed to parse the request body as JSON")
        .with_errors(json!({ "_schema": [rejection.body_text()] }))
        .into()
}

async fn register(
    State(state): State<TmsState>,
    body: Result<Json<RegisterTenant>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisteredTenant>), TmsAxumError> {
    let Json(request) = body.map_err(map_json_rejection)?;
    let registered = state.registrar.register(request).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn login(
    State(state): State<TmsState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, TmsAxumError> {
    let Json(request) = body.map_err(map_json_rejection)?;
    let response = state.registrar.login(&request.email, &request.password).await?;
    Ok(Json(response))
}

async fn me(caller: RequireCaller) -> Json<Value> {
    let RequireCaller(context) = caller;
    Json(json!({
        "userId": context.caller_id,
        "role": context.caller_role,
        "tenantId": context.partition_key,
        "tenantUuid": context.tenant_uuid,
    }))
}

pub fn router() -> Router<TmsState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
}
