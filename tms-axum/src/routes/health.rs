use axum::Json;
use serde_json::{json, Value};

/// Liveness only; never touches the database.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
