//! Per-request context: credential extraction and true-client-IP
//! resolution under the forward-auth contract with NGINX.

use std::net::IpAddr;

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use subtle::ConstantTimeEq;

use crate::config::Cidr;
use crate::models::{current_datetime, Token, TokenData, TokenType, BOOTSTRAP_USERNAME};
use crate::session::{SessionState, COOKIE_NAME};
use crate::{Error, Result};

use super::AppState;

/// Resolve the true client IP from `X-Forwarded-For`.
///
/// The header is walked right to left; addresses inside the configured
/// proxy CIDR blocks are our own frontends and are skipped. The first
/// address outside them is the client. When every hop is a trusted
/// proxy, the leftmost address is used.
#[must_use]
pub fn client_ip(headers: &HeaderMap, proxies: &[Cidr]) -> Option<IpAddr> {
    let forwarded = headers.get("x-forwarded-for")?.to_str().ok()?;
    let hops: Vec<IpAddr> = forwarded
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if hops.is_empty() {
        return None;
    }
    for addr in hops.iter().rev() {
        if !proxies.iter().any(|cidr| cidr.contains(*addr)) {
            return Some(*addr);
        }
    }
    hops.first().copied()
}

/// The original request metadata NGINX forwards with the subrequest.
#[derive(Debug, Default)]
pub struct OriginalRequest {
    /// `X-Original-URI`
    pub uri: Option<String>,
    /// `X-Original-Method`
    pub method: Option<String>,
}

impl OriginalRequest {
    /// Extract from the subrequest headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            uri: get("x-original-uri"),
            method: get("x-original-method"),
        }
    }
}

/// Pull the wire token out of a request, session cookie first.
///
/// JupyterHub and friends send their own `Authorization` headers on
/// internal requests, so an authenticated session cookie always wins
/// over the header.
#[must_use]
pub fn extract_credential(state: &AppState, jar: &CookieJar, headers: &HeaderMap) -> Option<Token> {
    if let Some(cookie) = jar.get(COOKIE_NAME) {
        let session = SessionState::from_cookie_value(
            &state.sealer,
            cookie.value(),
            state.config.token_lifetime(),
        );
        if let Some(token) = session.token {
            return Some(token);
        }
    }

    let header = headers.get("authorization")?.to_str().ok()?;
    if let Some(wire) = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
    {
        return wire.trim().parse().ok();
    }
    if let Some(encoded) = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
    {
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        // Either half may carry the token; the other is a placeholder.
        return user.parse().ok().or_else(|| password.parse().ok());
    }
    None
}

/// Authenticate a request into token data.
///
/// `allow_bootstrap` admits the configured bootstrap token, which acts
/// as a super-admin with the fixed `<bootstrap>` username; only the
/// token and admin routes pass `true`.
///
/// # Errors
///
/// Returns [`Error::InvalidCredentials`] when no usable credential is
/// presented or the token is unknown, revoked, or expired.
pub async fn authenticate(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
    allow_bootstrap: bool,
) -> Result<TokenData> {
    if allow_bootstrap {
        if let Some(data) = bootstrap_data(state, headers) {
            return Ok(data);
        }
    }

    let token = extract_credential(state, jar, headers)
        .ok_or_else(|| Error::InvalidCredentials("No authentication token found".to_string()))?;
    state
        .tokens
        .get_data(&token)
        .await?
        .ok_or_else(|| Error::InvalidCredentials("Token is not valid".to_string()))
}

/// Check the raw `Authorization: Bearer` value against the configured
/// bootstrap token in constant time.
fn bootstrap_data(state: &AppState, headers: &HeaderMap) -> Option<TokenData> {
    let configured = state.config.bootstrap_token.as_ref()?;
    let header = headers.get("authorization")?.to_str().ok()?;
    let wire = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    let matches: bool = wire.as_bytes().ct_eq(configured.as_bytes()).into();
    if !matches {
        return None;
    }
    Some(TokenData {
        token: Token {
            key: "bootstrap".to_string(),
            secret: String::new(),
        },
        username: BOOTSTRAP_USERNAME.to_string(),
        token_type: TokenType::Service,
        scopes: vec![crate::config::ADMIN_TOKEN_SCOPE.to_string()],
        created: current_datetime(),
        expires: None,
        name: None,
        email: None,
        uid: None,
        groups: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_headers(forwarded: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", forwarded.parse().unwrap());
        headers
    }

    #[test]
    fn client_ip_skips_trusted_proxies() {
        // GIVEN: a proxy CIDR and a forwarded chain ending in the proxy
        let proxies: Vec<Cidr> = vec!["10.0.0.0/8".parse().unwrap()];
        let headers = make_headers("192.0.2.4, 10.1.2.3");

        // THEN: the first untrusted hop from the right wins
        assert_eq!(
            client_ip(&headers, &proxies),
            Some("192.0.2.4".parse().unwrap())
        );
    }

    #[test]
    fn client_ip_with_no_proxies_takes_rightmost() {
        let headers = make_headers("192.0.2.4, 198.51.100.9");
        assert_eq!(
            client_ip(&headers, &[]),
            Some("198.51.100.9".parse().unwrap())
        );
    }

    #[test]
    fn client_ip_all_trusted_takes_leftmost() {
        let proxies: Vec<Cidr> = vec!["10.0.0.0/8".parse().unwrap()];
        let headers = make_headers("10.0.0.4, 10.1.2.3");
        assert_eq!(
            client_ip(&headers, &proxies),
            Some("10.0.0.4".parse().unwrap())
        );
    }

    #[test]
    fn client_ip_absent_header_is_none() {
        assert_eq!(client_ip(&HeaderMap::new(), &[]), None);
    }

    #[test]
    fn original_request_reads_nginx_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-original-uri", "/portal/query".parse().unwrap());
        headers.insert("x-original-method", "POST".parse().unwrap());
        let original = OriginalRequest::from_headers(&headers);
        assert_eq!(original.uri.as_deref(), Some("/portal/query"));
        assert_eq!(original.method.as_deref(), Some("POST"));
    }
}
