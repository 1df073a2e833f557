//! Shared test harness: an in-process application over in-memory
//! storage, plus a mock GitHub for exercising the login flow.

// Each integration test binary uses a subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Json, Router};
use gafaelfawr::config::{Config, GitHubConfig, IssuerConfig, ProviderConfig};
use gafaelfawr::crypto::{Issuer, Sealer};
use gafaelfawr::providers::{GitHubProvider, Provider};
use gafaelfawr::server::AppState;
use gafaelfawr::service::{AdminService, TokenService};
use gafaelfawr::storage::{AdminStore, Database, InMemoryTokenCache, TokenCache};
use http_body_util::BodyExt;
use rand::Rng;
use serde_json::{json, Value};

/// Test configuration: example.com realm, one mapped scope, alice as
/// the seeded admin.
pub fn test_config() -> Config {
    let session_secret: [u8; 32] = rand::rng().random();
    Config {
        realm: "example.com".to_string(),
        session_secret: session_secret.to_vec(),
        database_url: "sqlite::memory:".to_string(),
        redis_url: None,
        after_logout_url: "https://example.com/".to_string(),
        proxies: vec!["10.0.0.0/8".parse().unwrap()],
        initial_admins: vec!["admin".to_string()],
        bootstrap_token: Some("gt-bootstrap-token-value.secret".to_string()),
        known_scopes: HashMap::from([
            ("read:all".to_string(), "Read everything".to_string()),
            ("exec:admin".to_string(), "Administrative exec".to_string()),
            ("user:token".to_string(), "Manage own tokens".to_string()),
            ("admin:token".to_string(), "Manage all tokens".to_string()),
        ]),
        group_mapping: HashMap::from([
            (
                "exec:admin".to_string(),
                vec!["lsst-sqre-square".to_string()],
            ),
            (
                "read:all".to_string(),
                vec!["lsst-sqre-square".to_string(), "org-a-team".to_string()],
            ),
        ]),
        issuer: IssuerConfig {
            iss: "https://example.com".to_string(),
            aud: "https://example.com".to_string(),
            aud_internal: "https://example.com/api".to_string(),
            key_id: "some-kid".to_string(),
            key_pem: String::new(),
            lifetime: Duration::from_secs(23 * 3600),
        },
        provider: ProviderConfig::GitHub(GitHubConfig {
            client_id: "some-client-id".to_string(),
            client_secret: "some-client-secret".to_string(),
        }),
        host: "127.0.0.1".to_string(),
        port: 8080,
    }
}

/// Build an application state over fresh in-memory storage.
///
/// `github_url` points the provider at a mock server; tests that never
/// reach GitHub pass `None`.
pub async fn build_state(github_url: Option<&str>) -> AppState {
    let config = Arc::new(test_config());
    let sealer = Sealer::new(&config.session_secret).unwrap();

    let db = Database::connect("sqlite::memory:").await.unwrap();
    let admins = AdminService::new(AdminStore::new(&db));
    admins.seed(&config.initial_admins).await.unwrap();

    let cache: Arc<dyn TokenCache> = Arc::new(InMemoryTokenCache::new());
    let tokens = Arc::new(TokenService::new(Arc::clone(&config), db, cache));

    let (issuer, _pem) = Issuer::generate(
        "https://example.com",
        "https://example.com/api",
        "some-kid",
    )
    .unwrap();

    let github = GitHubConfig {
        client_id: "some-client-id".to_string(),
        client_secret: "some-client-secret".to_string(),
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let base = github_url.unwrap_or("https://github.com").to_string();
    let provider: Arc<dyn Provider> =
        Arc::new(GitHubProvider::with_urls(github, http, &base, &base));

    AppState {
        config,
        sealer,
        issuer: Arc::new(issuer),
        tokens,
        admins: Arc::new(admins),
        provider,
    }
}

/// Spawn a mock GitHub serving the OAuth token exchange and the three
/// identity APIs for user `githubuser` with teams `org/a-team` and
/// `lsst-sqre/square`.
pub async fn spawn_mock_github() -> String {
    async fn access_token() -> Json<Value> {
        Json(json!({"access_token": "gh-access-token", "token_type": "bearer"}))
    }
    async fn user() -> Json<Value> {
        Json(json!({
            "login": "githubuser",
            "id": 123_456,
            "name": "GitHub User",
        }))
    }
    async fn emails() -> Json<Value> {
        Json(json!([
            {"email": "otheremail@example.com", "primary": false},
            {"email": "githubuser@example.com", "primary": true},
        ]))
    }
    async fn teams() -> Json<Value> {
        Json(json!([
            {"slug": "a-team", "id": 1000, "organization": {"login": "org"}},
            {"slug": "square", "id": 1001, "organization": {"login": "lsst-sqre"}},
        ]))
    }

    let app = Router::new()
        .route("/login/oauth/access_token", post(access_token))
        .route("/user", get(user))
        .route("/user/emails", get(emails))
        .route("/user/teams", get(teams));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Collect a response body to bytes.
pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

/// Pull the session cookie value out of a `Set-Cookie` header.
pub fn session_cookie_value(response: &axum::response::Response) -> Option<String> {
    let header = response.headers().get("set-cookie")?.to_str().ok()?;
    let (name_value, _) = header.split_once(';')?;
    let (name, value) = name_value.split_once('=')?;
    (name == "gafaelfawr").then(|| value.to_string())
}
