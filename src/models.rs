//! Core data model: tokens, token metadata, and change history.
//!
//! A token's wire form is `gt-<key>.<secret>` where both halves are
//! 128-bit random values in unpadded base64url. Only the SHA-256 hash of
//! the secret is ever persisted; possession of the plaintext secret is
//! proven by constant-time comparison of hashes.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Wire prefix for every token.
pub const TOKEN_PREFIX: &str = "gt-";

/// Username of the bootstrap super-admin actor.
pub const BOOTSTRAP_USERNAME: &str = "<bootstrap>";

/// Minimum allowed remaining lifetime for a token, in seconds.
pub const MINIMUM_LIFETIME: i64 = 5 * 60;

static USERNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9]|-[a-z0-9])*$").expect("static regex"));
static SCOPE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9:._-]+$").expect("static regex"));
static GROUPNAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-zA-Z0-9._-]*$").expect("static regex"));

/// Returns `true` if `username` is a syntactically valid username.
#[must_use]
pub fn is_valid_username(username: &str) -> bool {
    USERNAME_REGEX.is_match(username)
}

/// Returns `true` if `scope` is a syntactically valid scope label.
#[must_use]
pub fn is_valid_scope(scope: &str) -> bool {
    SCOPE_REGEX.is_match(scope)
}

/// Returns `true` if `group` is a syntactically valid group name.
#[must_use]
pub fn is_valid_group_name(group: &str) -> bool {
    GROUPNAME_REGEX.is_match(group)
}

/// The current time truncated to whole seconds.
///
/// Token timestamps round-trip through storage backends with second
/// precision, so every timestamp is created at that precision.
#[must_use]
pub fn current_datetime() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_else(Utc::now)
}

/// An opaque token: a public key half and a secret half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Short random identifier, safe to log and store
    pub key: String,
    /// Random secret, proven by hash comparison and never persisted
    pub secret: String,
}

impl Token {
    /// Generate a fresh token from 128 bits of randomness per half.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: random_128(),
            secret: random_128(),
        }
    }

    /// The base64url-encoded SHA-256 hash of the secret.
    #[must_use]
    pub fn hash(&self) -> String {
        hash_secret(&self.secret)
    }

    /// Constant-time check of this token's secret against a stored hash.
    #[must_use]
    pub fn verify_hash(&self, stored: &str) -> bool {
        self.hash().as_bytes().ct_eq(stored.as_bytes()).into()
    }

    /// Constant-time comparison of this token's secret with another.
    #[must_use]
    pub fn secret_matches(&self, other: &str) -> bool {
        self.secret.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_PREFIX}{}.{}", self.key, self.secret)
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(TOKEN_PREFIX).ok_or(Error::MalformedToken)?;
        let (key, secret) = rest.split_once('.').ok_or(Error::MalformedToken)?;
        if !is_token_part(key) || !is_token_part(secret) {
            return Err(Error::MalformedToken);
        }
        Ok(Self {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Hash an arbitrary secret string the way token secrets are hashed.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// 128 random bits as 22 chars of unpadded base64url.
fn random_128() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Both token halves are fixed-width base64url with no padding.
fn is_token_part(part: &str) -> bool {
    part.len() == 22
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Root token created by a completed browser login
    Session,
    /// Long-lived token created by its owner via the API
    User,
    /// Child token with the parent's full scopes for notebook spawns
    Notebook,
    /// Short-lived child token delegated to a named service
    Internal,
    /// Token for a standalone service, created by an admin
    Service,
}

impl TokenType {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::User => "user",
            Self::Notebook => "notebook",
            Self::Internal => "internal",
            Self::Service => "service",
        }
    }
}

impl FromStr for TokenType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "session" => Ok(Self::Session),
            "user" => Ok(Self::User),
            "notebook" => Ok(Self::Notebook),
            "internal" => Ok(Self::Internal),
            "service" => Ok(Self::Service),
            _ => Err(Error::Internal(format!("Unknown token type: {s}"))),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group the user belongs to, as reported by the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGroup {
    /// Group name
    pub name: String,
    /// Numeric GID, when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Identity information carried on a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUserInfo {
    /// Username
    pub username: String,
    /// Preferred display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Numeric UID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u64>,
    /// Group memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<TokenGroup>,
}

/// The full data behind a token, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// The token itself, secret included
    pub token: Token,
    /// Owner username
    pub username: String,
    /// Token kind
    pub token_type: TokenType,
    /// Sorted scope set
    pub scopes: Vec<String>,
    /// Creation time
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    /// Expiration time, if any
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires: Option<DateTime<Utc>>,
    /// Preferred display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Numeric UID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u64>,
    /// Group memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<TokenGroup>,
}

impl TokenData {
    /// Returns `true` once the token's expiration has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|e| e <= Utc::now())
    }

    /// Seconds of validity remaining, `None` for tokens that never expire.
    #[must_use]
    pub fn remaining_seconds(&self) -> Option<i64> {
        self.expires.map(|e| e.timestamp() - Utc::now().timestamp())
    }

    /// Returns `true` if the token carries `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// The identity projection of this token.
    #[must_use]
    pub fn user_info(&self) -> TokenUserInfo {
        TokenUserInfo {
            username: self.username.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            uid: self.uid,
            groups: self.groups.clone(),
        }
    }
}

/// The public projection of a token: everything except the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Token key
    pub token: String,
    /// Owner username
    pub username: String,
    /// Token kind
    pub token_type: TokenType,
    /// Sorted scope set
    pub scopes: Vec<String>,
    /// Creation time
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    /// Expiration time, if any
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires: Option<DateTime<Utc>>,
    /// Name of a user token, unique per owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    /// Service an internal token was delegated to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Key of the parent token for notebook and internal tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Kinds of change recorded in the token history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenChange {
    /// Token created
    Create,
    /// Mutable fields edited
    Edit,
    /// Token explicitly revoked
    Revoke,
    /// Token aged out
    Expire,
}

impl TokenChange {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Revoke => "revoke",
            Self::Expire => "expire",
        }
    }
}

impl FromStr for TokenChange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "edit" => Ok(Self::Edit),
            "revoke" => Ok(Self::Revoke),
            "expire" => Ok(Self::Expire),
            _ => Err(Error::Internal(format!("Unknown token change: {s}"))),
        }
    }
}

/// One row of token change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenChangeHistoryEntry {
    /// Key of the affected token
    pub token: String,
    /// Owner of the affected token
    pub username: String,
    /// Kind of the affected token
    pub token_type: TokenType,
    /// Token name at the time of the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    /// Parent key, for child tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Scopes after the change
    pub scopes: Vec<String>,
    /// Delegated service, for internal tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Expiration after the change
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires: Option<DateTime<Utc>>,
    /// Previous token name, for edits that renamed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_token_name: Option<String>,
    /// Previous scopes, for edits that rescoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_scopes: Option<Vec<String>>,
    /// Previous expiration, for edits that changed it
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub old_expires: Option<DateTime<Utc>>,
    /// Who made the change
    pub actor: String,
    /// What kind of change this was
    pub action: TokenChange,
    /// Client IP the change came from, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// When the change happened
    #[serde(with = "chrono::serde::ts_seconds")]
    pub event_time: DateTime<Utc>,
}

/// A token administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    /// Username with `admin:token` authority
    pub username: String,
}
