mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use common::*;
use jsonwebtoken::{EncodingKey, Header, encode};
use permission_service::{
    AppConfig, auth::Claims, config::Env, create_router,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;
use uuid::Uuid;

/// Helper to mint a token signed with the configured secret.
fn create_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        exp: (now + ttl_secs) as usize,
        iat: now as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn router_with(config: AppConfig) -> (Router, Fixture) {
    let fx = seeded_with(config).await;
    (create_router(fx.state.clone()), fx)
}

fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

#[tokio::test]
async fn health_is_public_and_carries_a_request_id() {
    let (app, _fx) = router_with(AppConfig::default()).await;

    let response = app
        .oneshot(get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn permission_routes_require_a_bearer_token() {
    let (app, _fx) = router_with(AppConfig::default()).await;

    let response = app
        .oneshot(
            get("/api/permissions/user-permissions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn valid_jwt_reaches_the_handler() {
    let config = AppConfig::default();
    let secret = config.jwt_secret.clone();
    let (app, fx) = router_with(config).await;
    let token = create_token(fx.teacher_user, &secret, 3600);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/permissions/batch-check")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"permissions": ["EDIT_STUDENT", "DELETE_STUDENT", "VIEW_STUDENT"]})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["data"]["results"],
        json!({"EDIT_STUDENT": true, "DELETE_STUDENT": false, "VIEW_STUDENT": true})
    );
    assert_eq!(body["data"]["summary"], json!({"total": 3, "granted": 2, "denied": 1}));
    assert_eq!(body["meta"]["level"], json!(3));
    assert!(body["meta"]["responseTime"].is_u64());
}

#[tokio::test]
async fn expired_or_foreign_tokens_are_rejected() {
    let config = AppConfig::default();
    let secret = config.jwt_secret.clone();
    let (app, fx) = router_with(config).await;

    for token in [
        create_token(fx.teacher_user, &secret, -3600),
        create_token(fx.teacher_user, "some-other-secret", 3600),
    ] {
        let response = app
            .clone()
            .oneshot(
                get("/api/permissions/user-info")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn local_bypass_header_is_ignored_in_production() {
    let (local, fx) = router_with(AppConfig::default()).await;
    let user = fx.parent_user.to_string();

    let local_response = local
        .oneshot(
            get("/api/permissions/my-pages")
                .header("x-user-id", &user)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let production = create_router(state_over(
        &fx.repo,
        AppConfig {
            env: Env::Production,
            ..AppConfig::default()
        },
    ));
    let production_response = production
        .oneshot(
            get("/api/permissions/my-pages")
                .header("x-user-id", &user)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(local_response.status(), StatusCode::OK);
    assert_eq!(production_response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_answer_403_without_the_permission() {
    let (app, fx) = router_with(AppConfig::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/permissions/cache/clear")
                .header("x-user-id", fx.teacher_user.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_json_body_is_a_validation_error() {
    let (app, fx) = router_with(AppConfig::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/permissions/check-permission")
                .header("x-user-id", fx.teacher_user.to_string())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"permission\": "))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn openapi_document_lists_the_permission_routes() {
    let (app, _fx) = router_with(AppConfig::default()).await;

    let response = app
        .oneshot(get("/api-docs/openapi.json").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    for path in [
        "/permissions/page-actions",
        "/permissions/batch-check",
        "/api/permissions/dynamic-routes",
        "/api/permissions/user-permissions",
        "/api/permissions/check-permission",
        "/api/permissions/all-routes",
        "/api/role-permissions",
        "/api/permissions/{id}",
        "/api/permissions/role/{roleId}",
        "/api/permissions/cache/stats",
        "/setup/assign-role-permissions",
    ] {
        assert!(doc["paths"].get(path).is_some(), "missing {path}");
    }
}

#[tokio::test]
async fn node_lookup_by_id_leaves_static_routes_alone() {
    let (app, fx) = router_with(AppConfig::default()).await;

    let by_id = app
        .clone()
        .oneshot(
            get(&format!("/api/permissions/{EDIT_STUDENT}"))
                .header("x-user-id", fx.admin_user.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(by_id.status(), StatusCode::OK);
    assert_eq!(body_json(by_id).await["data"]["code"], json!("EDIT_STUDENT"));

    // A plain user reaches their own info, not the admin-only node lookup.
    let info = app
        .oneshot(
            get("/api/permissions/user-info")
                .header("x-user-id", fx.teacher_user.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(info.status(), StatusCode::OK);
    assert_eq!(body_json(info).await["data"]["roles"], json!(["teacher"]));
}

#[tokio::test]
async fn served_over_tcp() {
    let (app, fx) = router_with(AppConfig::default()).await;
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port");
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{address}/api/permissions/user-info"))
        .header("x-user-id", fx.admin_user.to_string())
        .send()
        .await
        .expect("request failed");

    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["isSuperuser"], json!(true));
}
