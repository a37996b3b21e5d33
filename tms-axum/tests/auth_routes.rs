use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tms_auth::{hash_password, JwtOptions, PasswordOptions, TenantIdentityResolver, TokenService};
use tms_axum::{TmsApp, TmsState};
use tms_tenancy::{MemoryPool, PartitionProvisioner, SessionPool, TenantRegistrar};
use tower::ServiceExt;

fn app(pool: &MemoryPool) -> Router {
    let shared: Arc<dyn SessionPool> = Arc::new(pool.clone());
    let tokens = TokenService::new(JwtOptions::default().with_secret("auth-routes-secret"));
    let registrar = TenantRegistrar::new(
        Arc::clone(&shared),
        PartitionProvisioner::for_tenants(Arc::clone(&shared)),
        tokens.clone(),
        PasswordOptions { cost: 4 },
    );
    TmsApp::new(TmsState::new(shared, TenantIdentityResolver::new(tokens), registrar)).into_router()
}

fn post_json(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn seed_account(pool: &MemoryPool, status: &str) {
    let hash = hash_password("SecurePass123!", &PasswordOptions { cost: 4 }).unwrap();
    let row = json!({
        "id": "5a3f4a52-4b0c-4d7e-9a0e-2b9c2f0f7d11",
        "email": "admin@abclojistik.com",
        "name": "Ayse Yilmaz",
        "passwordHash": hash,
        "role": "admin",
        "tenantUuid": "8c1f6f0e-1d4b-4e7c-8f3a-6a5e2d9b7c21",
        "schema": "abc_lojistik_1762000000000",
        "status": status,
    });
    pool.seed_rows("public", "JOIN \"tenant\"", vec![row.as_object().cloned().unwrap()]);
}

#[tokio::test]
async fn health_never_touches_the_database() {
    let pool = MemoryPool::new();
    let res = app(&pool)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["status"], "ok");
    assert_eq!(pool.acquired(), 0);
}

#[tokio::test]
async fn register_creates_and_provisions_the_tenant() {
    let pool = MemoryPool::new();
    let body = json!({
        "companyName": "ABC Lojistik",
        "userName": "Ayse Yilmaz",
        "email": "admin@abclojistik.com",
        "password": "SecurePass123!",
    });

    let res = app(&pool)
        .oneshot(post_json("/auth/register", body.to_string()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let body = json_body(res).await;
    let key = body["partitionKey"].as_str().unwrap();
    assert!(key.starts_with("abc_lojistik_"), "{key}");
    assert_eq!(body["migrations"]["applied"], json!([1, 2]));
    assert!(pool.has_schema(key));
    assert_eq!(pool.open_sessions(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let pool = MemoryPool::new();
    let res = app(&pool)
        .oneshot(post_json("/auth/register", "{\"companyName\":"))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = json_body(res).await;
    assert_eq!(body["className"], "bad-request");
    assert!(body["errors"]["_schema"].is_array());
    assert_eq!(pool.acquired(), 0);
}

#[tokio::test]
async fn invalid_registration_fields_are_rejected() {
    let pool = MemoryPool::new();
    let body = json!({
        "companyName": "A",
        "userName": "Ayse Yilmaz",
        "email": "admin@abclojistik.com",
        "password": "SecurePass123!",
    });

    let res = app(&pool)
        .oneshot(post_json("/auth/register", body.to_string()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(res).await["message"]
        .as_str()
        .unwrap()
        .contains("companyName"));
}

#[tokio::test]
async fn login_then_me_round_trip() {
    let pool = MemoryPool::new();
    seed_account(&pool, "active");
    let router = app(&pool);

    let res = router
        .clone()
        .oneshot(post_json(
            "/auth/login",
            json!({ "email": "admin@abclojistik.com", "password": "SecurePass123!" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let login = json_body(res).await;
    assert_eq!(login["user"]["tenantId"], "abc_lojistik_1762000000000");
    let token = login["accessToken"].as_str().unwrap().to_string();

    let res = router
        .oneshot(
            Request::builder()
                .uri("/auth/me")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let me = json_body(res).await;
    assert_eq!(me["tenantId"], "abc_lojistik_1762000000000");
    assert_eq!(me["role"], "admin");
    assert_eq!(me["userId"], "5a3f4a52-4b0c-4d7e-9a0e-2b9c2f0f7d11");
}

#[tokio::test]
async fn login_failures_map_to_401_and_403() {
    let pool = MemoryPool::new();
    seed_account(&pool, "failed");
    let router = app(&pool);

    let res = router
        .clone()
        .oneshot(post_json(
            "/auth/login",
            json!({ "email": "admin@abclojistik.com", "password": "WrongPass123!" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(res).await["message"], "Please check your login credentials");

    let res = router
        .oneshot(post_json(
            "/auth/login",
            json!({ "email": "admin@abclojistik.com", "password": "SecurePass123!" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["message"], "Tenant is not active");
}

#[tokio::test]
async fn me_requires_a_caller() {
    let pool = MemoryPool::new();
    let res = app(&pool)
        .oneshot(Request::builder().uri("/auth/me").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(res).await["className"], "not-authenticated");
}

#[tokio::test]
async fn unknown_routes_get_the_error_envelope() {
    let pool = MemoryPool::new();
    let res = app(&pool)
        .oneshot(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = json_body(res).await;
    assert_eq!(body["className"], "not-found");
    assert_eq!(body["message"], "No route for /nowhere");
    assert_eq!(pool.acquired(), 0);
}
