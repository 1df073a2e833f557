//! Generic OpenID Connect provider.
//!
//! # Verification flow
//!
//! 1. Exchange the authorization code at the configured token endpoint.
//! 2. Decode the ID token header (no verification) to extract `kid`.
//! 3. Fetch the issuer's JWKS (cached for 1 hour; refreshed once on an
//!    unknown `kid`).
//! 4. Verify the signature and the `exp`, `iss`, and `aud` claims.
//! 5. Map the claims to a [`TokenUserInfo`], groups from `isMemberOf`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    jwk::{AlgorithmParameters, JwkSet},
    Algorithm, DecodingKey, TokenData as JwtData, Validation,
};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::OidcConfig;
use crate::models::{is_valid_group_name, TokenGroup, TokenUserInfo};
use crate::{Error, Result};

use super::Provider;

/// How long a fetched JWKS stays cached.
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// OIDC login provider.
pub struct OidcProvider {
    config: OidcConfig,
    http: reqwest::Client,
    jwks_cache: JwksCache,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    id_token: Option<String>,
}

/// ID token claims of interest. Signature, `exp`, `iss`, and `aud` are
/// validated by `jsonwebtoken`; the rest is identity assembly.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "uidNumber")]
    uid_number: Option<UidClaim>,
    #[serde(default, rename = "isMemberOf")]
    is_member_of: Vec<OidcGroup>,
}

/// Providers serialize the UID claim as either a number or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UidClaim {
    Number(u64),
    Text(String),
}

impl UidClaim {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OidcGroup {
    name: String,
    #[serde(default)]
    id: Option<u64>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// JWKS cache — one entry per issuer.
struct JwksCache {
    inner: DashMap<String, CachedJwks>,
}

impl JwksCache {
    fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    async fn get_or_fetch(
        &self,
        http: &reqwest::Client,
        issuer: &str,
        force_refresh: bool,
    ) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(issuer) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let jwks_uri = jwks_uri(issuer);
        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = http
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Provider(format!("JWKS parse failed: {e}")))?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }
}

impl OidcProvider {
    /// Create a provider from resolved configuration.
    #[must_use]
    pub fn new(config: OidcConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            jwks_cache: JwksCache::new(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "OIDC token exchange failed: HTTP {}",
                response.status()
            )));
        }
        let body: TokenEndpointResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(e.to_string()))?;
        body.id_token
            .ok_or_else(|| Error::Provider("No ID token in token response".to_string()))
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| Error::Provider(format!("Unverifiable ID token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::Provider("ID token has no kid".to_string()))?;

        let key = self.find_decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 60;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let decoded: JwtData<IdTokenClaims> = jsonwebtoken::decode(id_token, &key, &validation)
            .map_err(|e| Error::Provider(format!("Unverifiable ID token: {e}")))?;
        Ok(decoded.claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if unknown.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let jwks = self
            .jwks_cache
            .get_or_fetch(&self.http, &self.config.issuer, false)
            .await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self
            .jwks_cache
            .get_or_fetch(&self.http, &self.config.issuer, true)
            .await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| Error::Provider(format!("Unknown key ID: {kid}")))
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.login_url)
            .map_err(|e| Error::Config(format!("Invalid OIDC login URL: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.config.client_id)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.config.scopes.join(" "))
                .append_pair("state", state)
                .append_pair("redirect_uri", &self.config.redirect_url);
            let mut extra: Vec<_> = self.config.login_params.iter().collect();
            extra.sort();
            for (key, value) in extra {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    async fn create_user_info(&self, code: &str, _state: &str) -> Result<TokenUserInfo> {
        let id_token = self.exchange_code(code).await?;
        let claims = self.verify_id_token(&id_token).await?;

        let username = claims
            .preferred_username
            .unwrap_or_else(|| claims.sub.clone());
        let groups = claims
            .is_member_of
            .into_iter()
            .filter(|g| is_valid_group_name(&g.name))
            .map(|g| TokenGroup {
                name: g.name,
                id: g.id,
            })
            .collect();

        Ok(TokenUserInfo {
            username: username.to_lowercase(),
            name: claims.name,
            email: claims.email,
            uid: claims.uid_number.and_then(|u| u.as_u64()),
            groups,
        })
    }
}

/// Derive the JWKS URI from the issuer URL per OIDC discovery.
fn jwks_uri(issuer: &str) -> String {
    format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'))
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        };
    }
    None
}
