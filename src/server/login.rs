//! Browser login flow: `/login`, the OIDC callback alias, and `/logout`.
//!
//! One handler serves both legs of `/login`. A request carrying `code`
//! and `state` is the provider callback; anything else starts a new
//! login. CSRF state lives in the sealed session cookie, compared in
//! constant time on return. Any failure clears the pending state so a
//! wedged login recovers on the next attempt, and surfaces a 403 with a
//! correlation ID that is also written to the log.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use url::Url;

use crate::models::TokenUserInfo;
use crate::scopes::session_scopes;
use crate::service::audit::{self, AuditEvent};
use crate::session::{clear_session_cookie, session_cookie, SessionState, COOKIE_NAME};
use crate::{Error, Result};

use super::context::client_ip;
use super::AppState;

/// Query parameters for both legs of `/login`.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Return URL for the initial request
    rd: Option<String>,
    /// Authorization code on the callback
    code: Option<String>,
    /// CSRF state on the callback
    state: Option<String>,
}

/// `GET /login` and `GET /oauth2/callback`.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let session = current_session(&state, &jar);

    if let (Some(code), Some(csrf)) = (query.code.as_deref(), query.state.as_deref()) {
        return match handle_callback(&state, &session, &headers, code, csrf).await {
            Ok((new_session, target)) => {
                match set_session(&state, jar, &new_session) {
                    Ok(jar) => (jar, Redirect::to(&target)).into_response(),
                    Err(e) => e.into_response(),
                }
            }
            Err(e) => login_failure(jar, &e),
        };
    }

    match handle_initial(&state, &session, &headers, query.rd.as_deref()).await {
        Ok(InitialAction::Redirect(target)) => Redirect::to(&target).into_response(),
        Ok(InitialAction::ToProvider(new_session, target)) => {
            match set_session(&state, jar, &new_session) {
                Ok(jar) => (jar, Redirect::to(&target)).into_response(),
                Err(e) => e.into_response(),
            }
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /logout` — revoke the session token and clear the cookie.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let session = current_session(&state, &jar);

    if let Some(token) = &session.token {
        if let Ok(Some(data)) = state.tokens.get_data(token).await {
            let ip = client_ip(&headers, &state.config.proxies).map(|a| a.to_string());
            let result = state
                .tokens
                .delete_token(&token.key, &data, Some(&data.username), ip.as_deref())
                .await;
            match result {
                Ok(_) => info!(username = %data.username, "Logged out"),
                Err(e) => warn!(error = %e, "Failed to revoke session token on logout"),
            }
        }
    }

    let jar = jar.add(clear_session_cookie());
    (jar, Redirect::to(&state.config.after_logout_url)).into_response()
}

enum InitialAction {
    Redirect(String),
    ToProvider(SessionState, String),
}

/// The initial leg: validate the return URL, then either short-circuit
/// an already-authenticated session or start the provider redirect.
async fn handle_initial(
    state: &AppState,
    session: &SessionState,
    headers: &HeaderMap,
    rd: Option<&str>,
) -> Result<InitialAction> {
    // The return URL comes from the rd parameter or the header NGINX
    // sets on the error-page redirect.
    let return_url = rd
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-auth-request-redirect")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| Error::Validation("No destination URL specified".to_string()))?;
    validate_return_url(state, &return_url)?;

    if let Some(token) = &session.token {
        if state.tokens.get_data(token).await?.is_some() {
            return Ok(InitialAction::Redirect(return_url));
        }
    }

    let csrf = generate_state();
    let authorize_url = state.provider.authorize_url(&csrf)?;
    let pending = SessionState {
        token: None,
        csrf: Some(csrf),
        return_url: Some(return_url),
    };
    Ok(InitialAction::ToProvider(pending, authorize_url))
}

/// The callback leg: verify state, assemble identity, create a session
/// token, and come back with the new cookie state and redirect target.
async fn handle_callback(
    state: &AppState,
    session: &SessionState,
    headers: &HeaderMap,
    code: &str,
    csrf: &str,
) -> Result<(SessionState, String)> {
    let Some(expected) = session.csrf.as_deref() else {
        return Err(Error::Forbidden("Login is not in progress".to_string()));
    };
    let matches: bool = expected.as_bytes().ct_eq(csrf.as_bytes()).into();
    if !matches {
        return Err(Error::Forbidden("Authentication state mismatch".to_string()));
    }

    let user_info = state.provider.create_user_info(code, csrf).await?;
    let ip = client_ip(headers, &state.config.proxies).map(|a| a.to_string());
    let token = create_session(state, &user_info, ip.as_deref()).await?;

    let target = session
        .return_url
        .clone()
        .unwrap_or_else(|| state.config.after_logout_url.clone());
    let authenticated = SessionState {
        token: Some(token),
        csrf: None,
        return_url: None,
    };
    Ok((authenticated, target))
}

/// Derive scopes and create the session token.
async fn create_session(
    state: &AppState,
    user_info: &TokenUserInfo,
    ip: Option<&str>,
) -> Result<crate::models::Token> {
    let is_admin = state.admins.is_admin(&user_info.username).await?;
    let scopes = session_scopes(&user_info.groups, &state.config.group_mapping, is_admin);

    let token = state
        .tokens
        .create_session_token(user_info, &scopes, ip)
        .await?;
    info!(
        username = %user_info.username,
        token_scope = %scopes.join(","),
        "Successfully authenticated"
    );
    audit::emit(&AuditEvent::login_succeeded(
        &user_info.username,
        &token.key,
        &scopes,
    ));
    Ok(token)
}

/// Render a login failure: 403 with a correlation ID, pending state
/// cleared so the next attempt starts fresh.
fn login_failure(jar: CookieJar, error: &Error) -> Response {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    warn!(error = %error, correlation_id = %correlation_id, "Login failed");
    audit::emit(&AuditEvent::login_failed(&error.to_string(), &correlation_id));

    let jar = jar.add(clear_session_cookie());
    let message = format!(
        "Authentication failed: {error} (correlation ID {correlation_id})"
    );
    (StatusCode::FORBIDDEN, jar, message).into_response()
}

fn current_session(state: &AppState, jar: &CookieJar) -> SessionState {
    jar.get(COOKIE_NAME)
        .map(|cookie| {
            SessionState::from_cookie_value(
                &state.sealer,
                cookie.value(),
                state.config.token_lifetime(),
            )
        })
        .unwrap_or_default()
}

fn set_session(state: &AppState, jar: CookieJar, session: &SessionState) -> Result<CookieJar> {
    let value = session.to_cookie_value(&state.sealer)?;
    Ok(jar.add(session_cookie(value, state.config.token_lifetime())))
}

/// The return URL must point back into this deployment.
fn validate_return_url(state: &AppState, return_url: &str) -> Result<()> {
    let parsed = Url::parse(return_url)
        .map_err(|_| Error::Validation(format!("Invalid return URL: {return_url}")))?;
    if parsed.host_str() != Some(state.config.realm.as_str()) {
        return Err(Error::Validation(format!(
            "Return URL is not at {}",
            state.config.realm
        )));
    }
    Ok(())
}

/// 128 bits of CSRF state, base64url.
fn generate_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_base64url_and_unique() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert!(a.len() >= 20);
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        assert!(!a.contains('='));
    }
}
