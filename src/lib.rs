//! Gafaelfawr — authentication and authorization gateway.
//!
//! Gafaelfawr sits behind an NGINX ingress controller and answers its
//! `auth_request` subrequests: it resolves the caller's identity from a
//! session cookie or bearer token, enforces a scope-based access policy,
//! mints short-lived internal JWTs for downstream services, and brokers
//! upstream login against GitHub OAuth 2.0 or a generic OpenID Connect
//! provider.
//!
//! # Architecture
//!
//! - Opaque tokens (`gt-<key>.<secret>`) are stored hashed in SQL with a
//!   sealed Redis fast path for authentication lookups.
//! - Browser sessions ride in an encrypted, authenticated cookie.
//! - Internal and notebook tokens are minted on demand per
//!   `(parent, service, scopes)` fingerprint with single-flight
//!   deduplication.
//! - One RSA key signs internal JWTs; its JWKS is served at
//!   `/.well-known/jwks.json`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod providers;
pub mod scopes;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
