//! Tests for the token management API under `/auth/api/v1`.

mod support;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use gafaelfawr::models::{Token, TokenType, TokenUserInfo};
use gafaelfawr::server::build_router;
use serde_json::{json, Value};
use tower::ServiceExt;

use support::{body_bytes, build_state};

async fn make_session(
    state: &gafaelfawr::server::AppState,
    username: &str,
    scopes: &[&str],
) -> Token {
    let info = TokenUserInfo {
        username: username.to_string(),
        name: None,
        email: Some(format!("{username}@example.com")),
        uid: Some(4100),
        groups: Vec::new(),
    };
    let scopes: Vec<String> = scopes.iter().map(|s| (*s).to_string()).collect();
    state
        .tokens
        .create_session_token(&info, &scopes, None)
        .await
        .unwrap()
}

fn request(method: &str, uri: &str, bearer: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {bearer}"));
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn user_token_create_list_delete() {
    // GIVEN: bob with user:token scope
    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state.clone());
    let wire = session.to_string();

    // WHEN: bob creates a named token
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &wire,
            Some(json!({"token_name": "ci", "scopes": ["read:all"]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let new_wire = created["token"].as_str().unwrap().to_string();
    let new_token: Token = new_wire.parse().unwrap();

    // THEN: the new token authenticates and lists under bob
    let data = state.tokens.get_data(&new_token).await.unwrap().unwrap();
    assert_eq!(data.username, "bob");
    assert_eq!(data.token_type, TokenType::User);

    let response = app
        .clone()
        .oneshot(request(
            "GET",
            "/auth/api/v1/tokens?username=bob",
            &wire,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["token_name"].as_str())
        .collect();
    assert_eq!(names, vec!["ci"]);

    // AND: deleting it returns 204 and it stops authenticating
    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/auth/api/v1/tokens/{}", new_token.key),
            &wire,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.tokens.get_data(&new_token).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_token_name_returns_conflict() {
    // GIVEN: bob already has a token named "ci"
    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state);
    let wire = session.to_string();
    let body = json!({"token_name": "ci", "scopes": ["read:all"]});

    let response = app
        .clone()
        .oneshot(request("POST", "/auth/api/v1/tokens", &wire, Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // WHEN: the same name is created again
    let response = app
        .clone()
        .oneshot(request("POST", "/auth/api/v1/tokens", &wire, Some(body)))
        .await
        .unwrap();

    // THEN: 409, and the list still shows one
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let response = app
        .oneshot(request("GET", "/auth/api/v1/tokens?username=bob", &wire, None))
        .await
        .unwrap();
    let listed = json_body(response).await;
    let count = listed
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["token_name"].as_str() == Some("ci"))
        .count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn cascade_delete_through_the_api() {
    // GIVEN: session -> notebook -> internal
    let state = build_state(None).await;
    let session = make_session(&state, "alice", &["read:all", "user:token"]).await;
    let session_data = state.tokens.get_data(&session).await.unwrap().unwrap();
    let notebook = state
        .tokens
        .get_notebook_token(&session_data, None)
        .await
        .unwrap();
    let notebook_data = state.tokens.get_data(&notebook).await.unwrap().unwrap();
    let internal = state
        .tokens
        .get_internal_token(&notebook_data, "nublado", &["read:all".to_string()], None)
        .await
        .unwrap();
    let app = build_router(state.clone());

    // WHEN: the session is deleted through the API
    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/auth/api/v1/tokens/{}", session.key),
            &session.to_string(),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // THEN: all three stop authenticating
    for token in [&session, &notebook, &internal] {
        assert!(state.tokens.get_data(token).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn change_history_records_create_and_revoke() {
    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state);
    let wire = session.to_string();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &wire,
            Some(json!({"token_name": "ci", "scopes": ["read:all"]})),
        ))
        .await
        .unwrap();
    let created = json_body(response).await;
    let key = created["token"]
        .as_str()
        .unwrap()
        .parse::<Token>()
        .unwrap()
        .key;

    let response = app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/auth/api/v1/tokens/{key}"),
            &wire,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request(
            "GET",
            &format!("/auth/api/v1/tokens/{key}/change-history"),
            &wire,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history = json_body(response).await;
    let actions: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert_eq!(actions, vec!["revoke", "create"]);
}

#[tokio::test]
async fn patch_renames_and_rescopes() {
    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state);
    let wire = session.to_string();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &wire,
            Some(json!({"token_name": "ci", "scopes": ["read:all"]})),
        ))
        .await
        .unwrap();
    let created = json_body(response).await;
    let key = created["token"]
        .as_str()
        .unwrap()
        .parse::<Token>()
        .unwrap()
        .key;

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            &format!("/auth/api/v1/tokens/{key}"),
            &wire,
            Some(json!({"token_name": "deploy", "scopes": ["user:token"]})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["token_name"], "deploy");
    assert_eq!(info["scopes"], json!(["user:token"]));
}

#[tokio::test]
async fn users_cannot_see_other_users_tokens() {
    // GIVEN: bob's session and carol's token
    let state = build_state(None).await;
    let bob = make_session(&state, "bob", &["user:token"]).await;
    let carol = make_session(&state, "carol", &["user:token"]).await;
    let app = build_router(state);

    // WHEN: bob asks for carol's token or a global list
    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/auth/api/v1/tokens/{}", carol.key),
            &bob.to_string(),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(request("GET", "/auth/api/v1/tokens", &bob.to_string(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_scope_reaches_any_owner() {
    // GIVEN: an admin session and bob's token
    let state = build_state(None).await;
    let admin = make_session(&state, "admin", &["admin:token", "user:token"]).await;
    let bob = make_session(&state, "bob", &["user:token"]).await;
    let app = build_router(state);

    // WHEN: the admin fetches bob's token info
    let response = app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/auth/api/v1/tokens/{}", bob.key),
            &admin.to_string(),
            None,
        ))
        .await
        .unwrap();

    // THEN: it is visible
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["username"], "bob");

    // AND: the admin can create a service token for another user
    let response = app
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &admin.to_string(),
            Some(json!({
                "username": "bot",
                "token_type": "service",
                "scopes": ["read:all"],
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn admins_api_requires_admin_scope() {
    let state = build_state(None).await;
    let admin = make_session(&state, "admin", &["admin:token", "user:token"]).await;
    let bob = make_session(&state, "bob", &["user:token"]).await;
    let app = build_router(state);

    // Listing as a plain user fails.
    let response = app
        .clone()
        .oneshot(request("GET", "/auth/api/v1/admins", &bob.to_string(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The admin adds bob, then the list shows both.
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/admins",
            &admin.to_string(),
            Some(json!({"username": "bob"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(request("GET", "/auth/api/v1/admins", &admin.to_string(), None))
        .await
        .unwrap();
    let listed = json_body(response).await;
    assert_eq!(
        listed,
        json!([{"username": "admin"}, {"username": "bob"}])
    );

    // Removing a missing admin is 404.
    let response = app
        .oneshot(request(
            "DELETE",
            "/auth/api/v1/admins/nobody",
            &admin.to_string(),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bootstrap_token_is_a_super_admin_on_token_routes() {
    // GIVEN: the configured bootstrap token
    let state = build_state(None).await;
    let app = build_router(state.clone());
    let bootstrap = state.config.bootstrap_token.clone().unwrap();

    // WHEN: it creates a service token for a user
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &bootstrap,
            Some(json!({
                "username": "bot",
                "token_type": "service",
                "scopes": ["read:all"],
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // AND: it manages admins
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/admins",
            &bootstrap,
            Some(json!({"username": "carol"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // BUT: it is not accepted on introspection routes
    let response = app
        .oneshot(request("GET", "/auth/api/v1/user-info", &bootstrap, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn introspection_routes_reflect_the_caller() {
    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state);
    let wire = session.to_string();

    let response = app
        .clone()
        .oneshot(request("GET", "/auth/api/v1/user-info", &wire, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["username"], "bob");
    assert_eq!(info["email"], "bob@example.com");

    let response = app
        .oneshot(request("GET", "/auth/api/v1/token-info", &wire, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["token"], session.key);
    assert_eq!(info["token_type"], "session");
}

#[tokio::test]
async fn basic_auth_carries_the_token() {
    // The wire token may ride in either half of Basic credentials.
    use base64::Engine as _;

    let state = build_state(None).await;
    let session = make_session(&state, "bob", &["read:all", "user:token"]).await;
    let app = build_router(state);

    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{session}:x-oauth-basic"));
    let request = Request::builder()
        .uri("/auth/api/v1/user-info")
        .header("Authorization", format!("Basic {encoded}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn error_bodies_follow_the_detail_shape() {
    let state = build_state(None).await;
    let app = build_router(state);

    let response = app
        .oneshot(request(
            "GET",
            "/auth/api/v1/tokens",
            &Token::generate().to_string(),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    let detail = body["detail"].as_array().unwrap();
    assert!(detail[0]["msg"].is_string());
    assert!(detail[0]["type"].is_string());
    assert!(detail[0]["loc"].is_array());
}
