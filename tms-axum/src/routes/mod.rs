pub mod auth;
pub mod health;

use axum::{routing::get, Router};

use crate::TmsState;

/// All built-in routes, before state and layers are attached.
pub fn router() -> Router<TmsState> {
    Router::new()
        .route("/health", get(health::health))
        .nest("/auth", auth::router())
}
