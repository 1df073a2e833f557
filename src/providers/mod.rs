//! Upstream identity providers.
//!
//! A provider brokers the redirect-based OAuth 2.0 login: it renders the
//! authorization URL for the initial redirect and turns the callback's
//! authorization code into a verified [`TokenUserInfo`]. Exactly one
//! provider is configured per deployment.

mod github;
mod oidc;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, ProviderConfig};
use crate::models::TokenUserInfo;
use crate::Result;

pub use github::GitHubProvider;
pub use oidc::OidcProvider;

/// Hard timeout for every outbound call to a provider.
pub const PROVIDER_TIMEOUT_SECS: u64 = 10;

/// An upstream login provider.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// The provider authorization URL carrying the CSRF `state`.
    fn authorize_url(&self, state: &str) -> Result<String>;

    /// Exchange the callback's code for provider tokens and assemble the
    /// caller's identity, groups included.
    async fn create_user_info(&self, code: &str, state: &str) -> Result<TokenUserInfo>;
}

/// Build the configured provider.
///
/// # Errors
///
/// Returns an error if the shared HTTP client cannot be constructed.
pub fn build_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
        .build()?;
    Ok(match &config.provider {
        ProviderConfig::GitHub(github) => {
            Arc::new(GitHubProvider::new(github.clone(), http))
        }
        ProviderConfig::Oidc(oidc) => Arc::new(OidcProvider::new(oidc.clone(), http)),
    })
}
