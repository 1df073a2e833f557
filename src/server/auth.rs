//! The `/auth` subrequest decision engine.
//!
//! NGINX calls this endpoint once per protected request. The handler
//! resolves the caller's credential, enforces the scope predicate named
//! in the query, optionally mints a delegated child token, and renders
//! either identity headers (200) or a challenge NGINX can translate
//! into a login redirect (401/403).

use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use serde_json::json;
use tracing::debug;

use crate::models::TokenData;
use crate::{Error, Result};

use super::context::{authenticate, client_ip, OriginalRequest};
use super::AppState;

/// How the required scope list is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Satisfy {
    /// Every scope is required
    #[default]
    All,
    /// Any one scope suffices
    Any,
}

impl Satisfy {
    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

/// Challenge type for the `WWW-Authenticate` header on 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    /// `Bearer` challenge
    #[default]
    Bearer,
    /// `Basic` challenge
    Basic,
}

impl AuthType {
    fn scheme(self) -> &'static str {
        match self {
            Self::Bearer => "Bearer",
            Self::Basic => "Basic",
        }
    }
}

/// Parsed `/auth` query parameters.
#[derive(Debug, Default)]
struct AuthParams {
    scopes: Vec<String>,
    satisfy: Satisfy,
    auth_type: AuthType,
    notebook: bool,
    delegate_to: Option<String>,
    delegate_scopes: Vec<String>,
    minimum_lifetime: Option<i64>,
    use_jwt: bool,
}

impl AuthParams {
    /// Parse the raw query string. `scope` and `delegate_scope` repeat.
    fn parse(query: Option<&str>) -> Result<Self> {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "scope" => params.scopes.push(value.into_owned()),
                "satisfy" => {
                    params.satisfy = match value.as_ref() {
                        "all" => Satisfy::All,
                        "any" => Satisfy::Any,
                        other => {
                            return Err(Error::Validation(format!("Unknown satisfy: {other}")))
                        }
                    }
                }
                "auth_type" => {
                    params.auth_type = match value.as_ref() {
                        "bearer" => AuthType::Bearer,
                        "basic" => AuthType::Basic,
                        other => {
                            return Err(Error::Validation(format!("Unknown auth_type: {other}")))
                        }
                    }
                }
                "notebook" => {
                    params.notebook = matches!(value.as_ref(), "true" | "1");
                }
                "delegate_to" => params.delegate_to = Some(value.into_owned()),
                "delegate_scope" => params.delegate_scopes.push(value.into_owned()),
                "minimum_lifetime" => {
                    params.minimum_lifetime = Some(value.parse().map_err(|_| {
                        Error::Validation("minimum_lifetime must be an integer".to_string())
                    })?);
                }
                "use_jwt" => {
                    params.use_jwt = matches!(value.as_ref(), "true" | "1");
                }
                _ => {}
            }
        }
        if params.notebook && params.delegate_to.is_some() {
            return Err(Error::Validation(
                "notebook and delegate_to are mutually exclusive".to_string(),
            ));
        }
        Ok(params)
    }
}

/// `GET /auth` — the forward-auth subrequest handler.
pub async fn authenticate_request(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let params = match AuthParams::parse(query.as_deref()) {
        Ok(params) => params,
        Err(e) => return e.into_response(),
    };

    let original = OriginalRequest::from_headers(&headers);
    debug!(
        uri = original.uri.as_deref().unwrap_or("-"),
        method = original.method.as_deref().unwrap_or("-"),
        "Auth subrequest"
    );

    let data = match authenticate(&state, &jar, &headers, false).await {
        Ok(data) => data,
        Err(e @ (Error::InvalidCredentials(_) | Error::TokenExpired)) => {
            // Browser requests (no Authorization header) get a Location
            // pointing at the login flow with the original URI carried
            // as the return destination.
            let login = if headers.contains_key("authorization") {
                None
            } else {
                original.uri.as_deref().map(|uri| login_redirect(&state, uri))
            };
            return unauthorized(&state, params.auth_type, &e.to_string(), login.as_deref());
        }
        Err(e) => return e.into_response(),
    };

    // Scope predicate under the requested combinator.
    let satisfied = match params.satisfy {
        Satisfy::All => params.scopes.iter().all(|s| data.has_scope(s)),
        Satisfy::Any => {
            params.scopes.is_empty() || params.scopes.iter().any(|s| data.has_scope(s))
        }
    };
    if !satisfied {
        return forbidden(&state, &params, &data);
    }

    if let Some(minimum) = params.minimum_lifetime {
        if data.remaining_seconds().is_some_and(|r| r < minimum) {
            return forbidden(&state, &params, &data);
        }
    }

    let ip = client_ip(&headers, &state.config.proxies).map(|a| a.to_string());
    match build_success(&state, &params, &data, ip.as_deref()).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Mint any requested delegation and compose the identity headers.
async fn build_success(
    state: &AppState,
    params: &AuthParams,
    data: &TokenData,
    ip: Option<&str>,
) -> Result<Response> {
    // The delegated token when one was requested, else the caller's own.
    let mut delegated = None;
    if params.notebook {
        let token = state.tokens.get_notebook_token(data, ip).await?;
        delegated = Some(token.to_string());
    } else if let Some(service) = &params.delegate_to {
        let scopes = if params.delegate_scopes.is_empty() {
            data.scopes.clone()
        } else {
            params.delegate_scopes.clone()
        };
        let token = state
            .tokens
            .get_internal_token(data, service, &scopes, ip)
            .await?;
        if params.use_jwt {
            let child = state
                .tokens
                .get_data(&token)
                .await?
                .ok_or_else(|| Error::Internal("Minted token vanished".to_string()))?;
            delegated = Some(state.issuer.issue_internal_jwt(&child)?);
        } else {
            delegated = Some(token.to_string());
        }
    }
    let token_header = delegated.unwrap_or_else(|| data.token.to_string());

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("X-Auth-Request-User", &data.username)
        .header("X-Auth-Request-Token", token_header)
        .header("X-Auth-Request-Token-Scopes", data.scopes.join(","))
        .header("X-Auth-Request-Scopes-Accepted", params.scopes.join(" "))
        .header("X-Auth-Request-Scopes-Satisfy", params.satisfy.as_str());
    if let Some(email) = &data.email {
        builder = builder.header("X-Auth-Request-Email", email);
    }
    if let Some(uid) = data.uid {
        builder = builder.header("X-Auth-Request-Uid", uid.to_string());
    }
    if !data.groups.is_empty() {
        let groups: Vec<&str> = data.groups.iter().map(|g| g.name.as_str()).collect();
        builder = builder.header("X-Auth-Request-Groups", groups.join(","));
    }
    builder
        .body(axum::body::Body::empty())
        .map_err(|e| Error::Internal(e.to_string()))
}

/// The login URL carrying the original request as its destination.
fn login_redirect(state: &AppState, original_uri: &str) -> String {
    let destination: String = url::form_urlencoded::byte_serialize(
        format!("https://{}{original_uri}", state.config.realm).as_bytes(),
    )
    .collect();
    format!("https://{}/login?rd={destination}", state.config.realm)
}

/// 401 with the challenge and the NGINX rendering hints.
fn unauthorized(
    state: &AppState,
    auth_type: AuthType,
    reason: &str,
    login: Option<&str>,
) -> Response {
    let challenge = format!(
        "{} realm=\"{}\"",
        auth_type.scheme(),
        state.config.realm
    );
    let body = json!({
        "detail": [{"msg": reason, "type": "invalid_credentials", "loc": ["header", "Authorization"]}]
    })
    .to_string();
    let mut builder = Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("WWW-Authenticate", challenge)
        .header("X-Error-Status", "401")
        .header("X-Error-Body", &body);
    if let Some(login) = login {
        builder = builder.header("Location", login);
    }
    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::UNAUTHORIZED.into_response())
}

/// 403 for an unsatisfied scope predicate or insufficient lifetime.
fn forbidden(state: &AppState, params: &AuthParams, data: &TokenData) -> Response {
    let challenge = format!(
        "Bearer realm=\"{}\", error=\"insufficient_scope\", scope=\"{}\"",
        state.config.realm,
        params.scopes.join(" ")
    );
    debug!(
        username = %data.username,
        required = %params.scopes.join(","),
        held = %data.scopes.join(","),
        "Scope predicate not satisfied"
    );
    let body = json!({
        "detail": [{"msg": "Token missing required scope", "type": "insufficient_scope", "loc": ["query", "scope"]}]
    })
    .to_string();
    (
        StatusCode::FORBIDDEN,
        [
            ("WWW-Authenticate", challenge.as_str()),
            ("X-Error-Status", "403"),
            ("X-Error-Body", body.as_str()),
        ],
        body.clone(),
    )
        .into_response()
}
