//! GitHub OAuth 2.0 provider.
//!
//! Identity assembly calls three GitHub APIs with the exchanged access
//! token: `/user` for the username and UID, `/user/emails` for the
//! primary address, and `/user/teams` for team memberships. Each team
//! becomes a group named `<org>-<team slug>`, truncated to GitHub's
//! 32-character group limit with a hash suffix when needed.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::config::GitHubConfig;
use crate::models::{TokenGroup, TokenUserInfo};
use crate::{Error, Result};

use super::Provider;

/// OAuth scopes requested from GitHub.
const SCOPES: &[&str] = &["read:org", "read:user", "user:email"];

/// Maximum group name length, from the GitHub API's team slug limit.
const GROUP_NAME_MAX: usize = 32;

const DEFAULT_OAUTH_URL: &str = "https://github.com";
const DEFAULT_API_URL: &str = "https://api.github.com";

/// GitHub login provider.
pub struct GitHubProvider {
    config: GitHubConfig,
    http: reqwest::Client,
    oauth_url: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
    id: u64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubTeam {
    slug: String,
    id: u64,
    organization: GitHubOrg,
}

#[derive(Debug, Deserialize)]
struct GitHubOrg {
    login: String,
}

impl GitHubProvider {
    /// Create a provider against the public GitHub endpoints.
    #[must_use]
    pub fn new(config: GitHubConfig, http: reqwest::Client) -> Self {
        Self::with_urls(config, http, DEFAULT_OAUTH_URL, DEFAULT_API_URL)
    }

    /// Create a provider against explicit endpoints. Used for GitHub
    /// Enterprise deployments and by the test suite.
    #[must_use]
    pub fn with_urls(
        config: GitHubConfig,
        http: reqwest::Client,
        oauth_url: &str,
        api_url: &str,
    ) -> Self {
        Self {
            config,
            http,
            oauth_url: oauth_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn exchange_code(&self, code: &str, state: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/login/oauth/access_token", self.oauth_url))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("state", state),
            ])
            .send()
            .await
            .map_err(provider_error)?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "GitHub token exchange failed: HTTP {}",
                response.status()
            )));
        }
        let body: AccessTokenResponse = response.json().await.map_err(provider_error)?;
        body.access_token.ok_or_else(|| {
            Error::Provider(format!(
                "GitHub token exchange failed: {}",
                body.error_description.unwrap_or_else(|| "no access token".to_string())
            ))
        })
    }

    /// GET a GitHub API resource. Reads are idempotent, so transport
    /// failures are retried once with backoff before surfacing.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(T, Option<String>)> {
        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .http
                .get(url)
                .bearer_auth(token)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", "gafaelfawr")
                .send()
                .await;
            match result {
                Ok(response) => break response,
                Err(e) if attempt == 0 && (e.is_connect() || e.is_timeout()) => {
                    debug!(url = %url, error = %e, "Retrying GitHub API read");
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Err(e) => return Err(provider_error(e)),
            }
        };
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "GitHub API {url} failed: HTTP {}",
                response.status()
            )));
        }
        let next = next_page(response.headers());
        Ok((response.json().await.map_err(provider_error)?, next))
    }

    async fn get_teams(&self, token: &str) -> Result<Vec<GitHubTeam>> {
        let mut teams = Vec::new();
        let mut url = format!("{}/user/teams?per_page=100", self.api_url);
        loop {
            let (mut page, next): (Vec<GitHubTeam>, _) = self.get_json(&url, token).await?;
            teams.append(&mut page);
            match next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(teams)
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&format!("{}/login/oauth/authorize", self.oauth_url))
            .map_err(|e| Error::Internal(format!("Invalid GitHub URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn create_user_info(&self, code: &str, state: &str) -> Result<TokenUserInfo> {
        let token = self.exchange_code(code, state).await?;

        let (user, _): (GitHubUser, _) =
            self.get_json(&format!("{}/user", self.api_url), &token).await?;
        let (emails, _): (Vec<GitHubEmail>, _) = self
            .get_json(&format!("{}/user/emails", self.api_url), &token)
            .await?;
        let teams = self.get_teams(&token).await?;

        let email = emails.into_iter().find(|e| e.primary).map(|e| e.email);
        let groups = teams
            .iter()
            .map(|t| TokenGroup {
                name: team_group_name(&t.organization.login, &t.slug),
                id: Some(t.id),
            })
            .collect();

        debug!(user = %user.login, teams = teams.len(), "Assembled GitHub identity");
        Ok(TokenUserInfo {
            username: user.login.to_lowercase(),
            name: user.name,
            email,
            uid: Some(user.id),
            groups,
        })
    }
}

/// Synthesize a group name from an organization and team slug.
///
/// Names longer than 32 characters are truncated to 25 and suffixed with
/// a dash plus six base64url characters of the full name's SHA-256, so
/// distinct long names stay distinct.
fn team_group_name(org: &str, slug: &str) -> String {
    let name = format!("{}-{}", org.to_lowercase(), slug);
    if name.len() <= GROUP_NAME_MAX {
        return name;
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix = URL_SAFE_NO_PAD.encode(&digest[..4]);
    let head: String = name.chars().take(GROUP_NAME_MAX - suffix.len() - 1).collect();
    format!("{head}-{suffix}")
}

/// Parse the `rel="next"` target out of a `Link` header.
fn next_page(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    for part in link.split(',') {
        let mut pieces = part.trim().split(';');
        let target = pieces.next()?.trim();
        if pieces.any(|p| p.trim() == "rel=\"next\"") {
            return Some(target.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

fn provider_error(e: reqwest::Error) -> Error {
    Error::Provider(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_provider() -> GitHubProvider {
        GitHubProvider::new(
            GitHubConfig {
                client_id: "some-client-id".to_string(),
                client_secret: "some-client-secret".to_string(),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn authorize_url_carries_state_and_scopes() {
        // GIVEN: a provider and a CSRF state
        let provider = make_provider();

        // WHEN: the authorization URL is rendered
        let url = provider.authorize_url("some-state").unwrap();
        let parsed = Url::parse(&url).unwrap();

        // THEN: it points at GitHub and carries the expected query
        assert_eq!(parsed.host_str(), Some("github.com"));
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(pairs.contains(&("client_id".to_string(), "some-client-id".to_string())));
        assert!(pairs.contains(&("state".to_string(), "some-state".to_string())));
        assert!(pairs.contains(&(
            "scope".to_string(),
            "read:org read:user user:email".to_string()
        )));
    }

    #[test]
    fn short_team_names_pass_through() {
        assert_eq!(team_group_name("Org", "a-team"), "org-a-team");
    }

    #[test]
    fn long_team_names_truncate_to_32_with_hash() {
        // GIVEN: an org/team pair beyond the 32-character limit
        let name = team_group_name("other-org", "team-with-very-long-name");

        // THEN: the result is exactly 32 chars, prefix-stable, hash-suffixed
        assert_eq!(name.len(), 32);
        assert!(name.starts_with("other-org-team-with-very--"));

        // AND: distinct long names stay distinct
        let other = team_group_name("other-org", "team-with-very-long-norm");
        assert_eq!(other.len(), 32);
        assert_ne!(name, other);
    }

    #[test]
    fn truncation_is_deterministic() {
        let a = team_group_name("some-really-long-org", "some-really-long-team");
        let b = team_group_name("some-really-long-org", "some-really-long-team");
        assert_eq!(a, b);
    }

    #[test]
    fn next_page_parses_github_link_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "link",
            "<https://api.github.com/user/teams?page=2>; rel=\"next\", \
             <https://api.github.com/user/teams?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            next_page(&headers).as_deref(),
            Some("https://api.github.com/user/teams?page=2")
        );

        let empty = reqwest::header::HeaderMap::new();
        assert!(next_page(&empty).is_none());
    }
}
