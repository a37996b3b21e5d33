use std::future::Future;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tms_core::errors::TmsError;
use tms_tenancy::TenancyError;
use tracing::error;

tokio::task_local! {
    static RESPONSE_SCOPE: ResponseScope;
}

/// Per-request settings the error envelope needs while it is rendered.
#[derive(Clone, Debug, Default)]
pub struct ResponseScope {
    pub request_id: Option<String>,
    pub expose_errors: bool,
}

impl ResponseScope {
    /// Run `fut` with this scope visible to every error rendered inside it.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        RESPONSE_SCOPE.scope(self, fut).await
    }

    fn current() -> Self {
        RESPONSE_SCOPE.try_with(Clone::clone).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct TmsAxumError(pub anyhow::Error);

impl From<anyhow::Error> for TmsAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<TmsError> for TmsAxumError {
    fn from(e: TmsError) -> Self {
        Self(e.into_anyhow())
    }
}

impl From<TenancyError> for TmsAxumError {
    fn from(e: TenancyError) -> Self {
        Self(e.into_anyhow())
    }
}

impl IntoResponse for TmsAxumError {
    fn into_response(self) -> Response {
        let scope = ResponseScope::current();

        // Structured errors keep their kind even behind anyhow contexts; anything else is a 500.
        let safe = match TmsError::from_anyhow(&self.0) {
            Some(tms) => {
                if tms.kind.is_server_error() {
                    error!(error = format!("{:#}", self.0), request_id = ?scope.request_id, "request failed");
                }
                tms.sanitize_for_client(scope.expose_errors)
            }
            None => {
                error!(error = format!("{:#}", self.0), request_id = ?scope.request_id, "request failed");
                TmsError::general_error(self.0.to_string()).sanitize_for_client(scope.expose_errors)
            }
        };

        let status = StatusCode::from_u16(safe.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = safe.to_json();
        body["timestamp"] = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        body["correlationId"] = scope.request_id.map(Value::String).unwrap_or(Value::Null);

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: TmsAxumError, scope: ResponseScope) -> (u16, Value) {
        let res = scope.run(async move { err.into_response() }).await;
        let status = res.status().as_u16();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn scope(expose: bool) -> ResponseScope {
        ResponseScope {
            request_id: Some("req-1".to_string()),
            expose_errors: expose,
        }
    }

    #[tokio::test]
    async fn envelope_carries_timestamp_and_correlation_id() {
        let (status, body) = render(TmsError::conflict("Email already exists").into(), scope(false)).await;
        assert_eq!(status, 409);
        assert_eq!(body["name"], "Conflict");
        assert_eq!(body["className"], "conflict");
        assert_eq!(body["message"], "Email already exists");
        assert_eq!(body["correlationId"], "req-1");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn server_errors_are_masked_unless_exposed() {
        let err = || TmsAxumError::from(TenancyError::Query("relation \"orders\" does not exist".into()));

        let (status, body) = render(err(), scope(false)).await;
        assert_eq!(status, 500);
        assert_eq!(body["message"], "Internal server error");

        let (_, body) = render(err(), scope(true)).await;
        assert!(body["message"].as_str().unwrap().contains("orders"));
    }

    #[tokio::test]
    async fn acquisition_failures_are_unavailable() {
        let (status, body) = render(TenancyError::Acquisition("pool timed out".into()).into(), scope(false)).await;
        assert_eq!(status, 503);
        assert_eq!(body["message"], "Service temporarily unavailable");
    }

    #[tokio::test]
    async fn foreign_errors_become_general_errors() {
        let (status, body) = render(anyhow::anyhow!("boom").into(), ResponseScope::default()).await;
        assert_eq!(status, 500);
        assert_eq!(body["name"], "GeneralError");
        assert_eq!(body["correlationId"], Value::Null);
    }
}
