//! HTTP surface: the auth-subrequest decision engine, the browser login
//! flow, the token API, and the published JWKS.
//!
//! The long-lived dependencies (configuration, crypto, services, the
//! upstream provider) are initialized once at startup, collected into
//! [`AppState`], and passed explicitly to every handler.

pub mod api;
pub mod auth;
pub mod context;
pub mod login;
pub mod well_known;

use std::sync::Arc;

use axum::{
    routing::{delete, get, patch},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::crypto::{Issuer, Sealer};
use crate::providers::{build_provider, Provider};
use crate::service::{AdminService, TokenService};
use crate::storage::{AdminStore, Database, InMemoryTokenCache, RedisTokenCache, TokenCache};
use crate::Result;

/// Long-lived handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration
    pub config: Arc<Config>,
    /// Cookie and cache sealing
    pub sealer: Sealer,
    /// Internal JWT signing
    pub issuer: Arc<Issuer>,
    /// Token lifecycle
    pub tokens: Arc<TokenService>,
    /// Admin management
    pub admins: Arc<AdminService>,
    /// Upstream login provider
    pub provider: Arc<dyn Provider>,
}

impl AppState {
    /// Initialize every component from resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage backend is unreachable or the
    /// issuer key is invalid.
    pub async fn from_config(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let sealer = Sealer::new(&config.session_secret)?;

        let db = Database::connect(&config.database_url).await?;
        let admin_store = AdminStore::new(&db);
        let admins = AdminService::new(admin_store);
        admins.seed(&config.initial_admins).await?;

        let cache: Arc<dyn TokenCache> = match &config.redis_url {
            Some(url) => {
                info!(redis = %url, "Using Redis token cache");
                Arc::new(
                    RedisTokenCache::connect(url, sealer.clone(), config.token_lifetime())
                        .await?,
                )
            }
            None => Arc::new(InMemoryTokenCache::new()),
        };

        let issuer = Arc::new(Issuer::from_config(&config.issuer)?);
        let tokens = Arc::new(TokenService::new(Arc::clone(&config), db, cache));
        let provider = build_provider(&config)?;

        Ok(Self {
            config,
            sealer,
            issuer,
            tokens,
            admins: Arc::new(admins),
            provider,
        })
    }
}

/// Build the application router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tokens", get(api::list_tokens).post(api::create_token))
        .route("/tokens/:key", get(api::get_token))
        .route("/tokens/:key", patch(api::modify_token))
        .route("/tokens/:key", delete(api::delete_token))
        .route("/tokens/:key/change-history", get(api::token_change_history))
        .route("/admins", get(api::list_admins).post(api::add_admin))
        .route("/admins/:username", delete(api::delete_admin))
        .route("/user-info", get(api::user_info))
        .route("/token-info", get(api::token_info));

    Router::new()
        .route("/auth", get(auth::authenticate_request))
        .route("/login", get(login::login))
        .route("/oauth2/callback", get(login::login))
        .route("/logout", get(login::logout))
        .route("/.well-known/jwks.json", get(well_known::jwks))
        .nest("/auth/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until shutdown.
///
/// # Errors
///
/// Returns an error if startup initialization or binding fails.
pub async fn serve(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::from_config(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gafaelfawr listening");
    axum::serve(listener, app).await?;
    Ok(())
}
