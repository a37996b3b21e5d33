//! # Errors
//!
//! Structured errors with a stable shape for clients:
//! - a status code, a `name` and a kebab-cased `className` per kind
//! - can be carried through `anyhow::Error` and recovered with a downcast
//! - transport-agnostic (the HTTP crate decides how to render the envelope)

use std::fmt;

use anyhow::Error as AnyError;
use serde_json::Value;

/// Error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,       // 400
    NotAuthenticated, // 401
    Forbidden,        // 403
    NotFound,         // 404
    Conflict,         // 409
    GeneralError,     // 500
    Unavailable,      // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotAuthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotAuthenticated => "NotAuthenticated",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotAuthenticated => "not-authenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    /// Server-side faults. Their messages are internal detail.
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

/// A structured error that can live inside `anyhow::Error`.
#[derive(Debug)]
pub struct TmsError {
    pub kind: ErrorKind,
    pub message: String,
    pub errors: Option<Value>,
    pub source: Option<AnyError>,
}

impl TmsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errors: None,
            source: None,
        }
    }

    pub fn with_errors(mut self, errors: Value) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    /// Convert into `anyhow::Error` so it flows through `?`.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Find a `TmsError` anywhere in an `anyhow` chain.
    pub fn from_anyhow(err: &AnyError) -> Option<&TmsError> {
        err.chain().find_map(|e| e.downcast_ref::<TmsError>())
    }

    /// Client-safe copy: drops the inner `source`, and with `expose_internal = false`
    /// replaces server-side messages with a generic one.
    pub fn sanitize_for_client(&self, expose_internal: bool) -> TmsError {
        let message = if self.kind.is_server_error() && !expose_internal {
            match self.kind {
                ErrorKind::Unavailable => "Service temporarily unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.message.clone()
        };

        TmsError {
            kind: self.kind,
            message,
            errors: self.errors.clone(),
            source: None,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut base = serde_json::json!({
            "name": self.name(),
            "message": self.message,
            "code": self.code(),
            "className": self.class_name(),
        });

        if let Some(e) = &self.errors {
            base["errors"] = e.clone();
        }
        base
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }
    pub fn not_authenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthenticated, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }
    pub fn general_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::GeneralError, msg)
    }
}

impl fmt::Display for TmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.message)
    }
}

impl std::error::Error for TmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_carry_status_and_class() {
        let err = TmsError::not_found("No tenant with that id");
        assert_eq!(err.code(), 404);
        assert_eq!(err.class_name(), "not-found");
        assert_eq!(TmsError::conflict("Email already exists").name(), "Conflict");
    }

    #[test]
    fn sanitize_hides_server_messages_unless_exposed() {
        let err = TmsError::general_error("relation \"orders\" does not exist");
        assert_eq!(err.sanitize_for_client(false).message, "Internal server error");
        assert_eq!(
            err.sanitize_for_client(true).message,
            "relation \"orders\" does not exist"
        );

        let client = TmsError::bad_request("missing email");
        assert_eq!(client.sanitize_for_client(false).message, "missing email");
    }

    #[test]
    fn from_anyhow_finds_error_behind_context() {
        let err = TmsError::forbidden("nope")
            .into_anyhow()
            .context("while loading orders");
        let found = TmsError::from_anyhow(&err).map(|e| e.kind);
        assert_eq!(found, Some(ErrorKind::Forbidden));
    }
}
