//! Configuration management
//!
//! Settings are loaded from a YAML file merged with `GAFAELFAWR_`-prefixed
//! environment variables, then resolved into a single typed [`Config`]
//! record: secret files are read, the signing key is parsed, and CIDR
//! blocks are validated. Components consume only the resolved form.

use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable naming the settings file.
pub const SETTINGS_PATH_ENV: &str = "GAFAELFAWR_SETTINGS_PATH";

/// Default settings path when neither the CLI flag nor the environment
/// variable is set.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/gafaelfawr/gafaelfawr.yaml";

/// Scope synthesized for every authenticated session.
pub const USER_TOKEN_SCOPE: &str = "user:token";

/// Scope granting token administration over any user.
pub const ADMIN_TOKEN_SCOPE: &str = "admin:token";

/// Raw settings as they appear in the YAML file.
///
/// This is the serde target only; [`Config::load`] turns it into the
/// resolved [`Config`] that the rest of the code consumes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Authentication realm, also the external hostname of the deployment
    pub realm: String,
    /// File containing the base64-encoded 256-bit session secret
    pub session_secret_file: PathBuf,
    /// SQL database URL
    pub database_url: String,
    /// Redis URL for the token cache (in-memory cache when unset)
    pub redis_url: Option<String>,
    /// Where to send the browser after logout
    pub after_logout_url: String,
    /// CIDR blocks of trusted frontend proxies
    pub proxies: Vec<String>,
    /// Usernames seeded into the admin table on startup
    pub initial_admins: Vec<String>,
    /// Fixed super-admin token (wire form), optional
    pub bootstrap_token: Option<String>,
    /// Known scopes and their human-readable descriptions
    pub known_scopes: HashMap<String, String>,
    /// Mapping from scope to the provider groups that grant it
    pub group_mapping: HashMap<String, Vec<String>>,
    /// Internal JWT issuer settings
    pub issuer: IssuerSettings,
    /// GitHub provider settings (mutually exclusive with `oidc`)
    pub github: Option<GitHubSettings>,
    /// Generic OpenID Connect provider settings
    pub oidc: Option<OidcSettings>,
    /// HTTP server bind settings
    pub server: ServerSettings,
}

/// Issuer settings for internal JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerSettings {
    /// `iss` claim value
    pub iss: String,
    /// Audiences
    pub aud: AudienceSettings,
    /// `kid` advertised in the JWKS and JWT headers
    pub key_id: String,
    /// PEM file containing the RSA private key
    pub key_file: PathBuf,
    /// Session token lifetime in minutes
    pub exp_minutes: u64,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            iss: String::new(),
            aud: AudienceSettings::default(),
            key_id: "gafaelfawr".to_string(),
            key_file: PathBuf::new(),
            exp_minutes: 1380,
        }
    }
}

/// Audience values for issued JWTs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AudienceSettings {
    /// Audience for tokens handed to browsers
    pub default: String,
    /// Audience for internal JWTs consumed by backend services
    pub internal: String,
}

/// GitHub OAuth App settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitHubSettings {
    /// OAuth App client ID
    pub client_id: String,
    /// File containing the OAuth App client secret
    pub client_secret_file: PathBuf,
}

/// Generic OpenID Connect provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OidcSettings {
    /// OAuth client ID
    pub client_id: String,
    /// File containing the OAuth client secret
    pub client_secret_file: PathBuf,
    /// Provider authorization endpoint
    pub login_url: String,
    /// Provider token endpoint
    pub token_url: String,
    /// Registered redirect URL for the callback
    pub redirect_url: String,
    /// Scopes to request from the provider
    pub scopes: Vec<String>,
    /// Expected `iss` of returned ID tokens
    pub issuer: String,
    /// Expected `aud` of returned ID tokens
    pub audience: String,
    /// Extra query parameters for the authorization request
    pub login_params: HashMap<String, String>,
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Which upstream provider this deployment logs in against.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    /// GitHub OAuth 2.0
    GitHub(GitHubConfig),
    /// Generic OpenID Connect
    Oidc(OidcConfig),
}

/// Resolved GitHub provider configuration.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// OAuth App client ID
    pub client_id: String,
    /// OAuth App client secret
    pub client_secret: String,
}

/// Resolved OIDC provider configuration.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Provider authorization endpoint
    pub login_url: String,
    /// Provider token endpoint
    pub token_url: String,
    /// Registered redirect URL for the callback
    pub redirect_url: String,
    /// Scopes to request
    pub scopes: Vec<String>,
    /// Expected ID token issuer
    pub issuer: String,
    /// Expected ID token audience
    pub audience: String,
    /// Extra authorization query parameters
    pub login_params: HashMap<String, String>,
}

/// Resolved issuer configuration.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// `iss` claim value
    pub iss: String,
    /// Audience for browser-facing tokens
    pub aud: String,
    /// Audience for internal JWTs
    pub aud_internal: String,
    /// Key ID for the JWKS and JWT headers
    pub key_id: String,
    /// PEM-encoded RSA private key
    pub key_pem: String,
    /// Session token lifetime
    pub lifetime: Duration,
}

/// A parsed IPv4/IPv6 CIDR block.
///
/// Only prefix containment is needed for proxy trimming, so this stays a
/// small value type rather than pulling in a network crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Returns `true` if `ip` falls inside this block.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let addr: IpAddr = a
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid CIDR: {s}")))?;
                let prefix: u8 = p
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid CIDR: {s}")))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid CIDR: {s}")))?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::Config(format!("Invalid CIDR prefix: {s}")));
        }
        Ok(Self { addr, prefix })
    }
}

/// Fully resolved configuration consumed by every component.
#[derive(Debug, Clone)]
pub struct Config {
    /// Authentication realm / external hostname
    pub realm: String,
    /// 256-bit key for cookie and cache sealing
    pub session_secret: Vec<u8>,
    /// SQL database URL
    pub database_url: String,
    /// Redis URL, when a Redis cache is deployed
    pub redis_url: Option<String>,
    /// Post-logout redirect target
    pub after_logout_url: String,
    /// Trusted proxy CIDR blocks
    pub proxies: Vec<Cidr>,
    /// Usernames seeded as admins
    pub initial_admins: Vec<String>,
    /// Fixed super-admin token, when configured
    pub bootstrap_token: Option<String>,
    /// Known scopes with descriptions
    pub known_scopes: HashMap<String, String>,
    /// Scope to granting-groups mapping
    pub group_mapping: HashMap<String, Vec<String>>,
    /// Internal JWT issuer
    pub issuer: IssuerConfig,
    /// Upstream login provider
    pub provider: ProviderConfig,
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Config {
    /// Load and resolve configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file is missing, a key fails
    /// validation, or a referenced secret file cannot be read.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = env::var(SETTINGS_PATH_ENV).ok().map(PathBuf::from);
        let path = path
            .map(Path::to_path_buf)
            .or(env_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let settings: Settings = Figment::new()
            .merge(Yaml::file(&path))
            .merge(Env::prefixed("GAFAELFAWR_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::resolve(settings)
    }

    /// Resolve raw settings into a usable configuration.
    pub fn resolve(settings: Settings) -> Result<Self> {
        if settings.realm.is_empty() {
            return Err(Error::Config("realm must be set".to_string()));
        }
        if settings.database_url.is_empty() {
            return Err(Error::Config("database_url must be set".to_string()));
        }

        let provider = match (settings.github, settings.oidc) {
            (Some(gh), None) => ProviderConfig::GitHub(GitHubConfig {
                client_secret: read_secret(&gh.client_secret_file)?,
                client_id: gh.client_id,
            }),
            (None, Some(oidc)) => ProviderConfig::Oidc(OidcConfig {
                client_secret: read_secret(&oidc.client_secret_file)?,
                client_id: oidc.client_id,
                login_url: oidc.login_url,
                token_url: oidc.token_url,
                redirect_url: oidc.redirect_url,
                scopes: oidc.scopes,
                issuer: oidc.issuer,
                audience: oidc.audience,
                login_params: oidc.login_params,
            }),
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "github and oidc settings are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "one of github or oidc must be configured".to_string(),
                ))
            }
        };

        let session_secret = read_session_secret(&settings.session_secret_file)?;

        let mut known_scopes = settings.known_scopes;
        known_scopes
            .entry(USER_TOKEN_SCOPE.to_string())
            .or_insert_with(|| "Can create and modify user tokens".to_string());
        known_scopes
            .entry(ADMIN_TOKEN_SCOPE.to_string())
            .or_insert_with(|| "Can administer all tokens".to_string());
        for scope in settings.group_mapping.keys() {
            if !known_scopes.contains_key(scope) {
                return Err(Error::Config(format!(
                    "group_mapping scope {scope} is not in known_scopes"
                )));
            }
        }

        let proxies = settings
            .proxies
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Cidr>>>()?;

        let key_pem = read_secret(&settings.issuer.key_file)?;

        Ok(Self {
            realm: settings.realm,
            session_secret,
            database_url: settings.database_url,
            redis_url: settings.redis_url,
            after_logout_url: settings.after_logout_url,
            proxies,
            initial_admins: settings.initial_admins,
            bootstrap_token: settings.bootstrap_token,
            known_scopes,
            group_mapping: settings.group_mapping,
            issuer: IssuerConfig {
                iss: settings.issuer.iss,
                aud: settings.issuer.aud.default,
                aud_internal: settings.issuer.aud.internal,
                key_id: settings.issuer.key_id,
                key_pem,
                lifetime: Duration::from_secs(settings.issuer.exp_minutes * 60),
            },
            provider,
            host: settings.server.host,
            port: settings.server.port,
        })
    }

    /// The session token lifetime.
    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        self.issuer.lifetime
    }

    /// Returns `true` if `scope` is declared in `known_scopes`.
    #[must_use]
    pub fn is_known_scope(&self, scope: &str) -> bool {
        self.known_scopes.contains_key(scope)
    }
}

/// Read and trim a secret file.
fn read_secret(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
    Ok(raw.trim().to_string())
}

/// Read the session secret file and decode it to 32 key bytes.
fn read_session_secret(path: &Path) -> Result<Vec<u8>> {
    use base64::Engine as _;

    let encoded = read_secret(path)?;
    let key = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| Error::Config(format!("Invalid session secret: {e}")))?;
    if key.len() != 32 {
        return Err(Error::Config(format!(
            "Session secret must be 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_v4_containment() {
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.20.30.40".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn cidr_bare_address_is_host_route() {
        let net: Cidr = "192.168.0.1".parse().unwrap();
        assert!(net.contains("192.168.0.1".parse().unwrap()));
        assert!(!net.contains("192.168.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_v6_containment() {
        let net: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(net.contains("2001:db8::1".parse().unwrap()));
        assert!(!net.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn cidr_mixed_families_never_match() {
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(!net.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn resolve_requires_exactly_one_provider() {
        let settings = Settings {
            realm: "example.com".to_string(),
            database_url: "sqlite::memory:".to_string(),
            ..Settings::default()
        };
        let err = Config::resolve(settings).unwrap_err();
        assert!(err.to_string().contains("github or oidc"));
    }
}
