//! Token lifecycle management.
//!
//! This service owns every token mutation and the ordering contract
//! between the two storage layers: the history row and the mutation
//! commit in one SQL transaction, then the cache entry is written or
//! evicted before the call returns. Reads go cache-first with an SQL
//! read-through capped at a five-minute TTL.
//!
//! Internal and notebook tokens are minted through a per-fingerprint
//! single-flight lock so concurrent requests for the same delegation
//! produce exactly one child token.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::info;

use crate::config::{Config, ADMIN_TOKEN_SCOPE, USER_TOKEN_SCOPE};
use crate::models::{
    current_datetime, is_valid_username, Token, TokenChange, TokenChangeHistoryEntry,
    TokenData, TokenInfo, TokenType, TokenUserInfo, BOOTSTRAP_USERNAME, MINIMUM_LIFETIME,
};
use crate::service::audit::{self, AuditEvent};
use crate::storage::{
    retry_transient, Database, HistoryStore, Inconsistency, TokenCache, TokenDatabaseStore,
    READ_THROUGH_TTL,
};
use crate::{Error, Result};

/// Lifetime of internal and notebook tokens.
const CHILD_TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Safety margin below which a cached child token is re-minted.
const SAFETY_MARGIN: Duration = Duration::from_secs(MINIMUM_LIFETIME as u64);

/// How long a mint loser waits between polls of the winner's result.
const MINT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll attempts before a wedged mint is reported as an error. Covers
/// several lock TTLs so a crashed winner's lock expires first.
const MINT_POLL_LIMIT: u32 = 150;

/// A request to create a token on behalf of a user, from an admin.
#[derive(Debug, Clone)]
pub struct AdminTokenRequest {
    /// Owner of the new token
    pub username: String,
    /// `user` or `service`
    pub token_type: TokenType,
    /// Token name, required for user tokens
    pub token_name: Option<String>,
    /// Scope set
    pub scopes: Vec<String>,
    /// Expiration, if any
    pub expires: Option<DateTime<Utc>>,
    /// Display name to carry on the token
    pub name: Option<String>,
    /// Email to carry on the token
    pub email: Option<String>,
    /// UID to carry on the token
    pub uid: Option<u64>,
}

/// Manage tokens across both storage layers.
pub struct TokenService {
    config: Arc<Config>,
    db: Database,
    store: TokenDatabaseStore,
    history: HistoryStore,
    cache: Arc<dyn TokenCache>,
}

impl TokenService {
    /// Create the service.
    #[must_use]
    pub fn new(config: Arc<Config>, db: Database, cache: Arc<dyn TokenCache>) -> Self {
        Self {
            store: TokenDatabaseStore::new(&db),
            history: HistoryStore::new(&db),
            config,
            db,
            cache,
        }
    }

    // ── Creation ──────────────────────────────────────────────────────────

    /// Create a session token after a completed upstream login.
    pub async fn create_session_token(
        &self,
        user_info: &TokenUserInfo,
        scopes: &[String],
        ip_address: Option<&str>,
    ) -> Result<Token> {
        self.validate_username(&user_info.username)?;
        let scopes = sort_scopes(scopes);

        let token = Token::generate();
        let created = current_datetime();
        let expires = created + chrono::Duration::from_std(self.config.token_lifetime())
            .map_err(|e| Error::Internal(e.to_string()))?;
        let data = TokenData {
            token: token.clone(),
            username: user_info.username.clone(),
            token_type: TokenType::Session,
            scopes: scopes.clone(),
            created,
            expires: Some(expires),
            name: user_info.name.clone(),
            email: user_info.email.clone(),
            uid: user_info.uid,
            groups: user_info.groups.clone(),
        };
        let entry = self.creation_entry(&data, None, None, None, &data.username, ip_address);

        self.commit_creation(&data, None, None, None, &entry).await?;
        audit::emit(&AuditEvent::created(
            &data.username,
            &token.key,
            TokenType::Session,
            &scopes,
            None,
            &data.username,
            ip_address,
        ));
        Ok(token)
    }

    /// Create a named user token. Only the user themselves may do this.
    pub async fn create_user_token(
        &self,
        auth_data: &TokenData,
        username: &str,
        token_name: &str,
        scopes: &[String],
        expires: Option<DateTime<Utc>>,
        ip_address: Option<&str>,
    ) -> Result<Token> {
        self.check_authorization(Some(username), auth_data, false, true)?;
        self.validate_username(username)?;
        self.validate_expires(expires)?;
        self.validate_scopes(scopes, Some(auth_data))?;
        let scopes = sort_scopes(scopes);

        let token = Token::generate();
        let data = TokenData {
            token: token.clone(),
            username: username.to_string(),
            token_type: TokenType::User,
            scopes: scopes.clone(),
            created: current_datetime(),
            expires,
            name: auth_data.name.clone(),
            email: auth_data.email.clone(),
            uid: auth_data.uid,
            groups: auth_data.groups.clone(),
        };
        let entry = self.creation_entry(
            &data,
            Some(token_name),
            None,
            None,
            &auth_data.username,
            ip_address,
        );

        self.commit_creation(&data, Some(token_name), None, None, &entry)
            .await?;
        info!(
            key = %token.key,
            token_name = %token_name,
            token_scope = %scopes.join(","),
            "Created new user token"
        );
        audit::emit(&AuditEvent::created(
            username,
            &token.key,
            TokenType::User,
            &scopes,
            None,
            &auth_data.username,
            ip_address,
        ));
        Ok(token)
    }

    /// Create a user or service token from an admin request.
    pub async fn create_token_from_admin_request(
        &self,
        request: &AdminTokenRequest,
        auth_data: &TokenData,
        ip_address: Option<&str>,
    ) -> Result<Token> {
        self.check_authorization(Some(&request.username), auth_data, true, false)?;
        self.validate_username(&request.username)?;
        self.validate_expires(request.expires)?;
        self.validate_scopes(&request.scopes, None)?;
        if !matches!(request.token_type, TokenType::User | TokenType::Service) {
            return Err(Error::Validation(
                "Only user and service tokens can be created directly".to_string(),
            ));
        }
        if request.token_type == TokenType::User && request.token_name.is_none() {
            return Err(Error::Validation(
                "User tokens require a token name".to_string(),
            ));
        }
        let scopes = sort_scopes(&request.scopes);

        let token = Token::generate();
        let data = TokenData {
            token: token.clone(),
            username: request.username.clone(),
            token_type: request.token_type,
            scopes: scopes.clone(),
            created: current_datetime(),
            expires: request.expires,
            name: request.name.clone(),
            email: request.email.clone(),
            uid: request.uid,
            groups: Vec::new(),
        };
        let entry = self.creation_entry(
            &data,
            request.token_name.as_deref(),
            None,
            None,
            &auth_data.username,
            ip_address,
        );

        self.commit_creation(&data, request.token_name.as_deref(), None, None, &entry)
            .await?;
        audit::emit(&AuditEvent::created(
            &request.username,
            &token.key,
            request.token_type,
            &scopes,
            None,
            &auth_data.username,
            ip_address,
        ));
        Ok(token)
    }

    // ── Authentication lookup ─────────────────────────────────────────────

    /// Resolve a wire token into its data.
    ///
    /// Doubles as the validity check: unknown, revoked, and expired
    /// tokens all come back as `None`. The cache is consulted first; a
    /// miss falls through to SQL and re-populates the cache with a TTL
    /// capped at five minutes.
    pub async fn get_data(&self, token: &Token) -> Result<Option<TokenData>> {
        let cached =
            retry_transient("token_cache_get", || self.cache.get_data(&token.key)).await?;
        if let Some(data) = cached {
            if !data.token.secret_matches(&token.secret) {
                return Ok(None);
            }
            if data.is_expired() {
                self.cache.delete_data(&token.key).await?;
                return Ok(None);
            }
            return Ok(Some(data));
        }

        // Read-through: rebuild from SQL. Identity enrichment lives only
        // in the cache, so a rebuilt record carries none.
        let Some((mut data, hash)) = self.store.get_data(&token.key).await? else {
            return Ok(None);
        };
        if !token.verify_hash(&hash) {
            return Ok(None);
        }
        if data.is_expired() {
            return Ok(None);
        }
        data.token.secret = token.secret.clone();
        let ttl = self.cache_ttl(&data).min(READ_THROUGH_TTL);
        self.cache.store_data(&data, ttl).await?;
        Ok(Some(data))
    }

    /// Identity information behind a wire token.
    pub async fn get_user_info(&self, token: &Token) -> Result<Option<TokenUserInfo>> {
        Ok(self.get_data(token).await?.map(|d| d.user_info()))
    }

    // ── Introspection ─────────────────────────────────────────────────────

    /// Token metadata, permission-checked against the caller.
    pub async fn get_token_info(
        &self,
        key: &str,
        auth_data: &TokenData,
        username: Option<&str>,
    ) -> Result<Option<TokenInfo>> {
        let Some(info) = self.get_token_info_unchecked(key, username).await? else {
            return Ok(None);
        };
        self.check_authorization(Some(&info.username), auth_data, false, false)?;
        Ok(Some(info))
    }

    /// Token metadata without an authorization check.
    pub async fn get_token_info_unchecked(
        &self,
        key: &str,
        username: Option<&str>,
    ) -> Result<Option<TokenInfo>> {
        let Some(info) = self.store.get_info(key).await? else {
            return Ok(None);
        };
        if username.is_some_and(|u| u != info.username) {
            return Ok(None);
        }
        Ok(Some(info))
    }

    /// List tokens, optionally for one user.
    pub async fn list_tokens(
        &self,
        auth_data: &TokenData,
        username: Option<&str>,
    ) -> Result<Vec<TokenInfo>> {
        self.check_authorization(username, auth_data, false, false)?;
        self.store.list(username).await
    }

    /// The change history of one token, permission-checked.
    ///
    /// History outlives the token itself: revoked tokens stay
    /// queryable, authorized against the owner recorded in the rows.
    pub async fn get_change_history(
        &self,
        auth_data: &TokenData,
        key: &str,
    ) -> Result<Vec<TokenChangeHistoryEntry>> {
        let entries = self.history.list_for_token(key).await?;
        let Some(first) = entries.first() else {
            return Err(Error::NotFound(format!("Token {key} not found")));
        };
        self.check_authorization(Some(&first.username), auth_data, false, false)?;
        Ok(entries)
    }

    // ── Modification ──────────────────────────────────────────────────────

    /// Modify a user token's name, scopes, or expiration.
    ///
    /// Shrinking the expiration cascades to child tokens so no child
    /// outlives its parent.
    #[allow(clippy::too_many_arguments)]
    pub async fn modify_token(
        &self,
        key: &str,
        auth_data: &TokenData,
        username: Option<&str>,
        ip_address: Option<&str>,
        token_name: Option<&str>,
        scopes: Option<&[String]>,
        expires: Option<DateTime<Utc>>,
        no_expire: bool,
    ) -> Result<Option<TokenInfo>> {
        let Some(info) = self.get_token_info_unchecked(key, username).await? else {
            return Ok(None);
        };
        self.check_authorization(Some(&info.username), auth_data, false, false)?;
        if info.token_type != TokenType::User {
            return Err(Error::Forbidden(
                "Only user tokens can be modified".to_string(),
            ));
        }
        if let Some(scopes) = scopes {
            self.validate_scopes(scopes, Some(auth_data))?;
        }
        self.validate_expires(expires)?;
        let scopes = scopes.map(sort_scopes);

        // A shrinking lifetime must propagate to child tokens.
        let update_children =
            expires.is_some_and(|e| info.expires.map_or(true, |current| e <= current));

        let entry = TokenChangeHistoryEntry {
            token: key.to_string(),
            username: info.username.clone(),
            token_type: TokenType::User,
            token_name: token_name
                .map(str::to_string)
                .or_else(|| info.token_name.clone()),
            parent: None,
            scopes: scopes.clone().unwrap_or_else(|| info.scopes.clone()),
            service: None,
            expires: if expires.is_some() || no_expire {
                expires
            } else {
                info.expires
            },
            old_token_name: token_name.and(info.token_name.clone()),
            old_scopes: scopes.is_some().then(|| info.scopes.clone()),
            old_expires: (expires.is_some() || no_expire).then_some(info.expires).flatten(),
            actor: auth_data.username.clone(),
            action: TokenChange::Edit,
            ip_address: ip_address.map(str::to_string),
            event_time: current_datetime(),
        };

        // Gather child rows before the transaction: the pool's
        // connection is held once the transaction begins.
        let mut children_to_shrink = Vec::new();
        if update_children {
            let new_expires = expires.unwrap_or_else(current_datetime);
            for child in self.store.get_children(key).await? {
                let Some(child_info) = self.store.get_info(&child).await? else {
                    continue;
                };
                if child_info.expires.is_some_and(|e| e <= new_expires) {
                    continue;
                }
                children_to_shrink.push((child, child_info, new_expires));
            }
        }

        let mut tx = self.db.pool().begin().await?;
        let new_info = self
            .store
            .modify(
                &mut tx,
                key,
                token_name,
                scopes.as_deref(),
                expires,
                no_expire,
            )
            .await?;
        self.history.add(&mut tx, &entry).await?;

        let mut touched_children = Vec::new();
        if new_info.is_some() {
            for (child, child_info, new_expires) in children_to_shrink {
                let child_entry = TokenChangeHistoryEntry {
                    token: child.clone(),
                    username: child_info.username.clone(),
                    token_type: child_info.token_type,
                    token_name: child_info.token_name.clone(),
                    parent: child_info.parent.clone(),
                    scopes: child_info.scopes.clone(),
                    service: child_info.service.clone(),
                    expires: Some(new_expires),
                    old_token_name: None,
                    old_scopes: None,
                    old_expires: child_info.expires,
                    actor: auth_data.username.clone(),
                    action: TokenChange::Edit,
                    ip_address: ip_address.map(str::to_string),
                    event_time: current_datetime(),
                };
                self.store
                    .modify(&mut tx, &child, None, None, Some(new_expires), false)
                    .await?;
                self.history.add(&mut tx, &child_entry).await?;
                touched_children.push(child);
            }
        }
        tx.commit().await?;

        // Overwrite or evict cache entries only after the commit.
        if new_info.is_some() {
            self.refresh_cached_expiry(key, scopes.as_deref(), expires, no_expire)
                .await?;
            for child in &touched_children {
                self.cache.delete_data(child).await?;
            }
            audit::emit(&AuditEvent::modified(
                &info.username,
                key,
                &auth_data.username,
            ));
        }
        Ok(new_info)
    }

    // ── Revocation ────────────────────────────────────────────────────────

    /// Delete a token and all of its descendants.
    ///
    /// Descendants are removed depth-first, each evicted from the cache
    /// before its SQL row is deleted, so no live cache entry outlives its
    /// row.
    pub async fn delete_token(
        &self,
        key: &str,
        auth_data: &TokenData,
        username: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<bool> {
        let Some(info) = self.get_token_info_unchecked(key, username).await? else {
            return Ok(false);
        };
        self.check_authorization(Some(&info.username), auth_data, false, false)?;

        // Depth-first: children were returned breadth-first, so delete in
        // reverse to remove the deepest tokens first. Row data is
        // gathered before the transaction claims the pool's connection.
        let mut children = Vec::new();
        for child in self.store.get_children(key).await? {
            if let Some(child_info) = self.store.get_info(&child).await? {
                children.push((child, child_info));
            }
        }
        children.reverse();

        let mut tx = self.db.pool().begin().await?;
        let mut revoked = Vec::new();
        for (child, child_info) in children {
            let entry = revocation_entry(&child_info, &auth_data.username, ip_address);
            self.cache.delete_data(&child).await?;
            if self.store.delete(&mut tx, &child).await? {
                self.history.add(&mut tx, &entry).await?;
                revoked.push((child, child_info.username));
            }
        }
        let entry = revocation_entry(&info, &auth_data.username, ip_address);
        self.cache.delete_data(key).await?;
        let success = self.store.delete(&mut tx, key).await?;
        if success {
            self.history.add(&mut tx, &entry).await?;
            revoked.push((key.to_string(), info.username));
        }
        tx.commit().await?;

        for (revoked_key, owner) in &revoked {
            info!(key = %revoked_key, username = %owner, "Deleted token");
            audit::emit(&AuditEvent::revoked(owner, revoked_key, &auth_data.username));
        }
        Ok(success)
    }

    // ── Child token minting ───────────────────────────────────────────────

    /// Get or mint an internal token delegated to `service`.
    ///
    /// Concurrent calls with the same fingerprint produce exactly one
    /// token; losers read the winner's cache entry.
    pub async fn get_internal_token(
        &self,
        auth_data: &TokenData,
        service: &str,
        scopes: &[String],
        ip_address: Option<&str>,
    ) -> Result<Token> {
        self.validate_username(&auth_data.username)?;
        let scopes = sort_scopes(scopes);
        if !scopes.iter().all(|s| auth_data.has_scope(s)) {
            return Err(Error::InsufficientScope(
                "Delegated scopes exceed the parent token's scopes".to_string(),
            ));
        }

        let slot = format!("internal:{}", mint_fingerprint(auth_data, service, &scopes));
        self.single_flight_mint(auth_data, &slot, Some(service), scopes, ip_address)
            .await
    }

    /// Get or mint a notebook token carrying the parent's full scopes.
    pub async fn get_notebook_token(
        &self,
        auth_data: &TokenData,
        ip_address: Option<&str>,
    ) -> Result<Token> {
        self.validate_username(&auth_data.username)?;
        let scopes = sort_scopes(&auth_data.scopes);
        let slot = format!("notebook:{}", auth_data.token.key);
        self.single_flight_mint(auth_data, &slot, None, scopes, ip_address)
            .await
    }

    async fn single_flight_mint(
        &self,
        auth_data: &TokenData,
        slot: &str,
        service: Option<&str>,
        scopes: Vec<String>,
        ip_address: Option<&str>,
    ) -> Result<Token> {
        for _ in 0..MINT_POLL_LIMIT {
            if let Some(token) = self.find_existing_child(auth_data, slot, service, &scopes).await?
            {
                return Ok(token);
            }

            if self.cache.try_lock(slot).await? {
                // Double-check under the lock: a winner may have
                // finished between the last look and the acquisition.
                let result = match self
                    .find_existing_child(auth_data, slot, service, &scopes)
                    .await?
                {
                    Some(token) => Ok(token),
                    None => {
                        self.mint_child(auth_data, slot, service, &scopes, ip_address)
                            .await
                    }
                };
                self.cache.unlock(slot).await?;
                return result;
            }

            sleep(MINT_POLL_INTERVAL).await;
        }
        Err(Error::Internal(format!(
            "Timed out waiting for concurrent mint of {slot}"
        )))
    }

    /// A live child for this mint slot, from the cache or from an
    /// existing row another worker cached.
    async fn find_existing_child(
        &self,
        auth_data: &TokenData,
        slot: &str,
        service: Option<&str>,
        scopes: &[String],
    ) -> Result<Option<Token>> {
        // A cached child that still authenticates wins immediately.
        if let Some(token) = self.cache.get_child(slot).await? {
            if self.get_data(&token).await?.is_some() {
                return Ok(Some(token));
            }
        }

        let min_expires =
            current_datetime() + chrono::Duration::seconds(SAFETY_MARGIN.as_secs() as i64);
        let existing = match service {
            Some(service) => {
                self.store
                    .get_internal_token_key(&auth_data.token.key, service, scopes, min_expires)
                    .await?
            }
            None => {
                self.store
                    .get_notebook_token_key(&auth_data.token.key, min_expires)
                    .await?
            }
        };
        if let Some(key) = existing {
            if let Some(data) = self.cache.get_data(&key).await? {
                if !data.is_expired() {
                    self.store_child_slot(slot, &data).await?;
                    return Ok(Some(data.token));
                }
            }
        }
        Ok(None)
    }

    async fn mint_child(
        &self,
        auth_data: &TokenData,
        slot: &str,
        service: Option<&str>,
        scopes: &[String],
        ip_address: Option<&str>,
    ) -> Result<Token> {
        let token = Token::generate();
        let created = current_datetime();
        let mut expires =
            created + chrono::Duration::seconds(CHILD_TOKEN_LIFETIME.as_secs() as i64);
        if let Some(parent_expires) = auth_data.expires {
            let cap = parent_expires
                - chrono::Duration::seconds(SAFETY_MARGIN.as_secs() as i64);
            expires = expires.min(cap);
        }

        let token_type = if service.is_some() {
            TokenType::Internal
        } else {
            TokenType::Notebook
        };
        let data = TokenData {
            token: token.clone(),
            username: auth_data.username.clone(),
            token_type,
            scopes: scopes.to_vec(),
            created,
            expires: Some(expires),
            name: auth_data.name.clone(),
            email: auth_data.email.clone(),
            uid: auth_data.uid,
            groups: auth_data.groups.clone(),
        };
        let entry = self.creation_entry(
            &data,
            None,
            service,
            Some(&auth_data.token.key),
            &auth_data.username,
            ip_address,
        );

        self.commit_creation(&data, None, service, Some(&auth_data.token.key), &entry)
            .await?;
        self.store_child_slot(slot, &data).await?;

        info!(
            key = %token.key,
            service = service.unwrap_or("-"),
            token_scope = %scopes.join(","),
            "Created new {token_type} token"
        );
        audit::emit(&AuditEvent::created(
            &auth_data.username,
            &token.key,
            token_type,
            scopes,
            service,
            &auth_data.username,
            ip_address,
        ));
        Ok(token)
    }

    /// Cache a child token under its mint slot, TTL short of its own
    /// expiration by the safety margin so it is re-minted in time.
    async fn store_child_slot(&self, slot: &str, data: &TokenData) -> Result<()> {
        let Some(remaining) = data.remaining_seconds() else {
            return Ok(());
        };
        let ttl = remaining - SAFETY_MARGIN.as_secs() as i64;
        if ttl > 0 {
            self.cache
                .store_child(slot, &data.token, Duration::from_secs(ttl as u64))
                .await?;
        }
        Ok(())
    }

    // ── Audit ─────────────────────────────────────────────────────────────

    /// Scan both storage layers and report drift.
    pub async fn audit(&self) -> Result<Vec<Inconsistency>> {
        let db_keys: BTreeSet<String> = self.store.list_keys().await?.into_iter().collect();
        let mut findings = Vec::new();
        for key in self.cache.list_data_keys().await? {
            if !db_keys.contains(&key) {
                findings.push(Inconsistency {
                    key: key.clone(),
                    message: "cache entry has no database row".to_string(),
                });
            }
            if let Some(data) = self.cache.get_data(&key).await? {
                if data.is_expired() {
                    findings.push(Inconsistency {
                        key,
                        message: "cache entry for expired token".to_string(),
                    });
                }
            }
        }
        Ok(findings)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Write the token row and its history entry in one transaction,
    /// then populate the cache.
    async fn commit_creation(
        &self,
        data: &TokenData,
        token_name: Option<&str>,
        service: Option<&str>,
        parent: Option<&str>,
        entry: &TokenChangeHistoryEntry,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        self.store
            .add(&mut tx, data, token_name, service, parent)
            .await?;
        self.history.add(&mut tx, entry).await?;
        tx.commit().await?;

        self.cache.store_data(data, self.cache_ttl(data)).await?;
        Ok(())
    }

    fn creation_entry(
        &self,
        data: &TokenData,
        token_name: Option<&str>,
        service: Option<&str>,
        parent: Option<&str>,
        actor: &str,
        ip_address: Option<&str>,
    ) -> TokenChangeHistoryEntry {
        TokenChangeHistoryEntry {
            token: data.token.key.clone(),
            username: data.username.clone(),
            token_type: data.token_type,
            token_name: token_name.map(str::to_string),
            parent: parent.map(str::to_string),
            scopes: data.scopes.clone(),
            service: service.map(str::to_string),
            expires: data.expires,
            old_token_name: None,
            old_scopes: None,
            old_expires: None,
            actor: actor.to_string(),
            action: TokenChange::Create,
            ip_address: ip_address.map(str::to_string),
            event_time: data.created,
        }
    }

    /// After a successful modify, bring any cached record in line.
    async fn refresh_cached_expiry(
        &self,
        key: &str,
        scopes: Option<&[String]>,
        expires: Option<DateTime<Utc>>,
        no_expire: bool,
    ) -> Result<()> {
        let Some(mut data) = self.cache.get_data(key).await? else {
            return Ok(());
        };
        if let Some(scopes) = scopes {
            data.scopes = scopes.to_vec();
        }
        if no_expire {
            data.expires = None;
        } else if let Some(expires) = expires {
            data.expires = Some(expires);
        }
        self.cache.store_data(&data, self.cache_ttl(&data)).await
    }

    /// Cache TTL for a record: its remaining lifetime, capped at the
    /// session lifetime for tokens that never expire.
    fn cache_ttl(&self, data: &TokenData) -> Duration {
        let lifetime = self.config.token_lifetime();
        match data.remaining_seconds() {
            Some(remaining) if remaining > 0 => {
                Duration::from_secs(remaining as u64).min(lifetime)
            }
            Some(_) => Duration::from_secs(1),
            None => lifetime,
        }
    }

    fn check_authorization(
        &self,
        username: Option<&str>,
        auth_data: &TokenData,
        require_admin: bool,
        require_same_user: bool,
    ) -> Result<()> {
        if auth_data.username == BOOTSTRAP_USERNAME && !require_same_user {
            return Ok(());
        }
        let is_admin = auth_data.has_scope(ADMIN_TOKEN_SCOPE);
        if (username.is_none() || require_admin) && !is_admin {
            return Err(Error::Forbidden(
                "Missing required admin:token scope".to_string(),
            ));
        }
        if let Some(username) = username {
            if username != auth_data.username && (require_same_user || !is_admin) {
                return Err(Error::Forbidden(format!(
                    "Cannot act on tokens for user {username}"
                )));
            }
        }
        if !is_admin && !auth_data.has_scope(USER_TOKEN_SCOPE) {
            return Err(Error::Forbidden(
                "Missing required user:token scope".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_username(&self, username: &str) -> Result<()> {
        if is_valid_username(username) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("Invalid username: {username}")))
        }
    }

    fn validate_expires(&self, expires: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(expires) = expires {
            let minimum = Utc::now() + chrono::Duration::seconds(MINIMUM_LIFETIME);
            if expires < minimum {
                return Err(Error::Validation(
                    "Token must be valid for at least five minutes".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Requested scopes must be known, and a subset of the caller's
    /// scopes unless the caller is a token admin.
    fn validate_scopes(&self, scopes: &[String], auth_data: Option<&TokenData>) -> Result<()> {
        if scopes.is_empty() {
            return Ok(());
        }
        if let Some(auth_data) = auth_data {
            if !auth_data.has_scope(ADMIN_TOKEN_SCOPE)
                && !scopes.iter().all(|s| auth_data.has_scope(s))
            {
                return Err(Error::Validation(
                    "Requested scopes are broader than your current scopes".to_string(),
                ));
            }
        }
        if let Some(unknown) = scopes.iter().find(|s| !self.config.is_known_scope(s)) {
            return Err(Error::Validation(format!("Unknown scope: {unknown}")));
        }
        Ok(())
    }
}

/// Deduplicate and sort a scope list.
fn sort_scopes(scopes: &[String]) -> Vec<String> {
    scopes
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Deduplication key for child-token minting.
fn mint_fingerprint(auth_data: &TokenData, service: &str, scopes: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(auth_data.token.key.as_bytes());
    hasher.update(b"\0");
    hasher.update(service.as_bytes());
    hasher.update(b"\0");
    hasher.update(scopes.join(",").as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn revocation_entry(
    info: &TokenInfo,
    actor: &str,
    ip_address: Option<&str>,
) -> TokenChangeHistoryEntry {
    TokenChangeHistoryEntry {
        token: info.token.clone(),
        username: info.username.clone(),
        token_type: info.token_type,
        token_name: info.token_name.clone(),
        parent: info.parent.clone(),
        scopes: info.scopes.clone(),
        service: info.service.clone(),
        expires: info.expires,
        old_token_name: None,
        old_scopes: None,
        old_expires: None,
        actor: actor.to_string(),
        action: TokenChange::Revoke,
        ip_address: ip_address.map(str::to_string),
        event_time: current_datetime(),
    }
}
