//! The token management API under `/auth/api/v1`.
//!
//! Authorization is scope-based: `admin:token` permits every operation
//! on any owner, `user:token` permits operations on the caller's own
//! tokens. The configured bootstrap token is admitted on the token and
//! admin routes only, acting as `<bootstrap>`.
//!
//! All 4xx responses carry `{detail: [{msg, type, loc}]}`.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::{TokenType, BOOTSTRAP_USERNAME};
use crate::service::token::AdminTokenRequest;
use crate::{Error, Result};

use super::context::{authenticate, client_ip};
use super::AppState;

// ── Request / response types ──────────────────────────────────────────────

/// Query filter for `GET /tokens`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Restrict to one owner
    username: Option<String>,
}

/// Body of `POST /tokens`.
///
/// Without `username` (or with the caller's own), this creates a named
/// user token; with another username it is an admin request for a user
/// or service token.
#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    /// Owner; defaults to the caller
    pub username: Option<String>,
    /// `user` (default) or `service`
    pub token_type: Option<TokenType>,
    /// Token name, required for user tokens
    pub token_name: Option<String>,
    /// Scope set
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiration as epoch seconds
    pub expires: Option<i64>,
}

/// Body of `PATCH /tokens/{key}`.
#[derive(Debug, Deserialize)]
pub struct ModifyTokenRequest {
    /// New token name
    pub token_name: Option<String>,
    /// New scope set
    pub scopes: Option<Vec<String>>,
    /// New expiration as epoch seconds
    pub expires: Option<i64>,
    /// Clear the expiration entirely
    #[serde(default)]
    pub no_expire: bool,
}

/// Response of `POST /tokens`.
#[derive(Debug, Serialize)]
pub struct NewTokenResponse {
    /// Wire form of the new token
    pub token: String,
}

/// Body of `POST /admins`.
#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    /// Username to grant admin
    pub username: String,
}

// ── Token routes ──────────────────────────────────────────────────────────

/// `GET /tokens` — list tokens, optionally filtered by owner.
pub async fn list_tokens(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let infos = state
            .tokens
            .list_tokens(&auth, query.username.as_deref())
            .await?;
        Ok(Json(infos).into_response())
    })
    .await
}

/// `POST /tokens` — create a user or service token.
pub async fn create_token(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(body): Json<CreateTokenRequest>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let ip = client_ip(&headers, &state.config.proxies).map(|a| a.to_string());
        let expires = body.expires.map(epoch).transpose()?;

        let for_self = body
            .username
            .as_deref()
            .map_or(true, |u| u == auth.username);
        let token = if for_self && auth.username != BOOTSTRAP_USERNAME {
            let token_name = body.token_name.as_deref().ok_or_else(|| {
                Error::Validation("User tokens require a token name".to_string())
            })?;
            let username = auth.username.clone();
            state
                .tokens
                .create_user_token(
                    &auth,
                    &username,
                    token_name,
                    &body.scopes,
                    expires,
                    ip.as_deref(),
                )
                .await?
        } else {
            let request = AdminTokenRequest {
                username: body.username.clone().ok_or_else(|| {
                    Error::Validation("username is required".to_string())
                })?,
                token_type: body.token_type.unwrap_or(TokenType::User),
                token_name: body.token_name.clone(),
                scopes: body.scopes.clone(),
                expires,
                name: None,
                email: None,
                uid: None,
            };
            state
                .tokens
                .create_token_from_admin_request(&request, &auth, ip.as_deref())
                .await?
        };

        Ok((
            StatusCode::CREATED,
            Json(NewTokenResponse {
                token: token.to_string(),
            }),
        )
            .into_response())
    })
    .await
}

/// `GET /tokens/{key}` — token metadata.
pub async fn get_token(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let info = state
            .tokens
            .get_token_info(&key, &auth, None)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Token {key} not found")))?;
        Ok(Json(info).into_response())
    })
    .await
}

/// `PATCH /tokens/{key}` — modify a user token.
pub async fn modify_token(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<ModifyTokenRequest>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let ip = client_ip(&headers, &state.config.proxies).map(|a| a.to_string());
        let expires = body.expires.map(epoch).transpose()?;
        let info = state
            .tokens
            .modify_token(
                &key,
                &auth,
                None,
                ip.as_deref(),
                body.token_name.as_deref(),
                body.scopes.as_deref(),
                expires,
                body.no_expire,
            )
            .await
            .map_err(|e| match e {
                // A rename collision on modify is a validation failure,
                // unlike the conflict on create.
                Error::DuplicateTokenName(name) => {
                    Error::Validation(format!("Duplicate token name: {name}"))
                }
                other => other,
            })?
            .ok_or_else(|| Error::NotFound(format!("Token {key} not found")))?;
        Ok(Json(info).into_response())
    })
    .await
}

/// `DELETE /tokens/{key}` — revoke a token and its descendants.
pub async fn delete_token(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let ip = client_ip(&headers, &state.config.proxies).map(|a| a.to_string());
        let deleted = state
            .tokens
            .delete_token(&key, &auth, None, ip.as_deref())
            .await?;
        if deleted {
            Ok(StatusCode::NO_CONTENT.into_response())
        } else {
            Err(Error::NotFound(format!("Token {key} not found")))
        }
    })
    .await
}

/// `GET /tokens/{key}/change-history` — the change log for one token.
pub async fn token_change_history(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let entries = state.tokens.get_change_history(&auth, &key).await?;
        Ok(Json(entries).into_response())
    })
    .await
}

// ── Admin routes ──────────────────────────────────────────────────────────

/// `GET /admins` — list admins.
pub async fn list_admins(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        let admins = state.admins.list(&auth).await?;
        let body: Vec<_> = admins
            .into_iter()
            .map(|username| json!({"username": username}))
            .collect();
        Ok(Json(body).into_response())
    })
    .await
}

/// `POST /admins` — add an admin.
pub async fn add_admin(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(body): Json<AddAdminRequest>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        state.admins.add(&body.username, &auth).await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    })
    .await
}

/// `DELETE /admins/{username}` — remove an admin.
pub async fn delete_admin(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, true).await?;
        state.admins.remove(&username, &auth).await?;
        Ok(StatusCode::NO_CONTENT.into_response())
    })
    .await
}

// ── Caller introspection ──────────────────────────────────────────────────

/// `GET /user-info` — identity behind the presented token.
pub async fn user_info(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, false).await?;
        Ok(Json(auth.user_info()).into_response())
    })
    .await
}

/// `GET /token-info` — metadata of the presented token.
pub async fn token_info(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    run(async {
        let auth = authenticate(&state, &jar, &headers, false).await?;
        let info = state
            .tokens
            .get_token_info_unchecked(&auth.token.key, None)
            .await?
            .ok_or_else(|| Error::NotFound("Token not found".to_string()))?;
        Ok(Json(info).into_response())
    })
    .await
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Collapse handler results into responses; errors render through the
/// crate-wide mapping.
async fn run<F>(f: F) -> Response
where
    F: std::future::Future<Output = Result<Response>>,
{
    match f.await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn epoch(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::Validation(format!("Invalid expiration: {seconds}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_deserializes_with_defaults() {
        let body: CreateTokenRequest =
            serde_json::from_value(json!({"token_name": "ci", "scopes": ["read:all"]}))
                .unwrap();
        assert_eq!(body.token_name.as_deref(), Some("ci"));
        assert!(body.username.is_none());
        assert!(body.expires.is_none());
    }

    #[test]
    fn modify_request_defaults_no_expire_false() {
        let body: ModifyTokenRequest = serde_json::from_value(json!({})).unwrap();
        assert!(!body.no_expire);
        assert!(body.scopes.is_none());
    }

    #[test]
    fn epoch_rejects_out_of_range() {
        assert!(epoch(i64::MAX).is_err());
        assert!(epoch(1_700_000_000).is_ok());
    }
}
