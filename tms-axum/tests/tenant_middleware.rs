use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tms_auth::{
    AccessTokenSubject, JwtOptions, PasswordOptions, TenantIdentityResolver, TokenService,
};
use tms_axum::{RequireCaller, TenantCtx, TenantSession, TmsApp, TmsAxumError, TmsState};
use tms_core::{errors::TmsError, PartitionKey, Role};
use tms_tenancy::{
    EntityKind, MemoryPool, PartitionProvisioner, Row, SessionPool, TenantRegistrar,
};
use tower::ServiceExt;

const SECRET: &str = "middleware-test-secret";

struct Harness {
    pool: MemoryPool,
    tokens: TokenService,
}

impl Harness {
    fn new() -> Self {
        Self {
            pool: MemoryPool::new(),
            tokens: TokenService::new(JwtOptions::default().with_secret(SECRET)),
        }
    }

    fn router(&self) -> Router {
        let shared: Arc<dyn SessionPool> = Arc::new(self.pool.clone());
        let registrar = TenantRegistrar::new(
            Arc::clone(&shared),
            PartitionProvisioner::for_tenants(Arc::clone(&shared)),
            self.tokens.clone(),
            PasswordOptions { cost: 4 },
        );
        let state = TmsState::new(
            shared,
            TenantIdentityResolver::new(self.tokens.clone()),
            registrar,
        );

        TmsApp::new(state).merge(test_routes()).into_router()
    }

    fn token(&self, key: &str, role: Role) -> String {
        self.tokens
            .create_access_token(&AccessTokenSubject {
                user_id: format!("user-{key}"),
                email: format!("{key}@example.com"),
                partition_key: PartitionKey::parse(key).unwrap(),
                tenant_uuid: uuid::Uuid::new_v4().to_string(),
                role,
            })
            .unwrap()
    }
}

async fn list_orders(TenantSession(manager): TenantSession) -> Result<Json<Vec<Row>>, TmsAxumError> {
    let orders = manager.data_handle(EntityKind::Order).await?;
    Ok(Json(orders.find(50, 0).await?))
}

async fn whoami(TenantCtx(context): TenantCtx) -> Json<Value> {
    Json(json!({ "partition": context.partition_key, "caller": context.caller_id }))
}

async fn boom(TenantSession(manager): TenantSession) -> Result<Json<Value>, TmsAxumError> {
    manager.raw_query("SELECT 1", &[]).await?;
    Err(TmsError::general_error("connection reset by peer").into())
}

async fn admin_only(caller: RequireCaller) -> Result<Json<Value>, TmsAxumError> {
    caller.require_role(Role::Admin)?;
    Ok(Json(json!({ "caller": caller.caller_id() })))
}

async fn slow(TenantSession(manager): TenantSession) -> Result<Json<Value>, TmsAxumError> {
    manager.raw_query("SELECT 1", &[]).await?;
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Json(json!({})))
}

fn test_routes() -> Router<TmsState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/whoami", get(whoami))
        .route("/boom", get(boom))
        .route("/admin", get(admin_only))
        .route("/slow", get(slow))
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn order(number: &str) -> Row {
    json!({ "orderNumber": number }).as_object().cloned().unwrap()
}

#[tokio::test]
async fn anonymous_requests_are_scoped_to_public() {
    let h = Harness::new();

    let res = h.router().oneshot(get_request("/orders", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let log = h.pool.statements();
    assert_eq!(log[0].sql, "SET search_path TO public");
    assert_eq!(h.pool.acquired(), 1);
    assert_eq!(h.pool.released(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tenant_requests_stay_in_their_partitions() {
    let h = Harness::new();
    h.pool.seed_rows("tenant_a", "FROM \"orders\"", vec![order("A-1"), order("A-2")]);
    h.pool.seed_rows("tenant_b", "FROM \"orders\"", vec![order("B-1")]);

    let router = h.router();
    let token_a = h.token("tenant_a", Role::Operator);
    let token_b = h.token("tenant_b", Role::Operator);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let (key, token) = if i % 2 == 0 {
            ("tenant_a", token_a.clone())
        } else {
            ("tenant_b", token_b.clone())
        };
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            let res = router.oneshot(get_request("/orders", Some(&token))).await.unwrap();
            (key, json_body(res).await)
        }));
    }

    for task in tasks {
        let (key, body) = task.await.unwrap();
        let numbers: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["orderNumber"].as_str().unwrap().to_string())
            .collect();
        match key {
            "tenant_a" => assert_eq!(numbers, ["A-1", "A-2"]),
            _ => assert_eq!(numbers, ["B-1"]),
        }
    }

    assert_eq!(h.pool.acquired(), 10);
    assert_eq!(h.pool.open_sessions(), 0);
}

#[tokio::test]
async fn requests_without_data_access_never_acquire() {
    let h = Harness::new();
    let token = h.token("tenant_a", Role::Operator);

    let res = h
        .router()
        .oneshot(get_request("/whoami", Some(&token)))
        .await
        .unwrap();
    let body = json_body(res).await;

    assert_eq!(body["partition"], "tenant_a");
    assert_eq!(body["caller"], "user-tenant_a");
    assert_eq!(h.pool.acquired(), 0);
}

#[tokio::test]
async fn invalid_tokens_fall_back_to_public() {
    let h = Harness::new();
    let foreign = TokenService::new(JwtOptions::default().with_secret("someone-else"));
    let forged = foreign
        .create_access_token(&AccessTokenSubject {
            user_id: "mallory".into(),
            email: "mallory@example.com".into(),
            partition_key: PartitionKey::parse("tenant_a").unwrap(),
            tenant_uuid: uuid::Uuid::new_v4().to_string(),
            role: Role::Admin,
        })
        .unwrap();

    for token in ["not-a-jwt", forged.as_str()] {
        let res = h
            .router()
            .oneshot(get_request("/whoami", Some(token)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["partition"], "public");
        assert_eq!(body["caller"], Value::Null);
    }
}

#[tokio::test]
async fn handler_errors_release_and_carry_the_request_id() {
    let h = Harness::new();

    let res = h
        .router()
        .oneshot(
            Request::builder()
                .uri("/boom")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.headers()["x-request-id"], "req-42");

    let body = json_body(res).await;
    assert_eq!(body["name"], "GeneralError");
    assert_eq!(body["message"], "Internal server error");
    assert_eq!(body["correlationId"], "req-42");

    assert_eq!(h.pool.released(), 1);
    assert_eq!(h.pool.open_sessions(), 0);
}

#[tokio::test]
async fn missing_request_ids_are_generated() {
    let h = Harness::new();
    h.pool.fail_acquire(true);

    let res = h.router().oneshot(get_request("/orders", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let header = res.headers()["x-request-id"].to_str().unwrap().to_string();
    let body = json_body(res).await;
    assert_eq!(body["correlationId"], header.as_str());
    assert_eq!(body["className"], "unavailable");
}

#[tokio::test]
async fn role_checks() {
    let h = Harness::new();
    let router = h.router();

    let res = router.clone().oneshot(get_request("/admin", None)).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let operator = h.token("tenant_a", Role::Operator);
    let res = router
        .clone()
        .oneshot(get_request("/admin", Some(&operator)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["className"], "forbidden");

    let admin = h.token("tenant_a", Role::Admin);
    let res = router.oneshot(get_request("/admin", Some(&admin))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancelled_requests_release_their_session() {
    let h = Harness::new();
    let token = h.token("tenant_a", Role::Operator);
    let task = tokio::spawn(h.router().oneshot(get_request("/slow", Some(&token))));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.pool.acquired() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.pool.released(), 1);
    assert_eq!(h.pool.open_sessions(), 0);
}
