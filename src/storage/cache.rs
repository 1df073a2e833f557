//! Token cache — the authentication fast path.
//!
//! The [`TokenCache`] trait abstracts over the key-value backend. Two
//! implementations exist: [`RedisTokenCache`] for deployments and
//! [`InMemoryTokenCache`], backed by `DashMap`, for single-process
//! deployments and the test suite.
//!
//! # Keys
//!
//! | Key | Value |
//! |-----|-------|
//! | `token:<key>` | Sealed [`TokenData`] JSON |
//! | `internal:<fingerprint>` | Wire form of the live internal token |
//! | `notebook:<parent key>` | Wire form of the live notebook token |
//! | `lock:<slot>` | Single-flight mint lock |
//!
//! Values in Redis are sealed with the session secret so a compromised
//! cache dump exposes no token secrets. Entry TTLs never exceed the
//! underlying token's remaining lifetime.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::crypto::Sealer;
use crate::models::{Token, TokenData};
use crate::{Error, Result};

/// Read-through TTL cap for records re-populated from SQL.
pub const READ_THROUGH_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL of a single-flight mint lock.
pub const MINT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Trait abstracting the cache backend.
///
/// Implementations must be `Send + Sync` because the cache is shared
/// across request tasks.
#[async_trait]
pub trait TokenCache: Send + Sync + 'static {
    /// Look up token data by token key.
    async fn get_data(&self, key: &str) -> Result<Option<TokenData>>;

    /// Store token data under its key with the given TTL.
    async fn store_data(&self, data: &TokenData, ttl: Duration) -> Result<()>;

    /// Evict token data. Missing entries are not an error.
    async fn delete_data(&self, key: &str) -> Result<()>;

    /// Look up a cached child token (mint slot → wire token).
    async fn get_child(&self, slot: &str) -> Result<Option<Token>>;

    /// Store a child token under its mint slot.
    async fn store_child(&self, slot: &str, token: &Token, ttl: Duration) -> Result<()>;

    /// Acquire the single-flight mint lock for a slot.
    ///
    /// Returns `true` if this caller now holds the lock. The lock expires
    /// on its own after [`MINT_LOCK_TTL`] so a crashed winner cannot
    /// wedge minting.
    async fn try_lock(&self, slot: &str) -> Result<bool>;

    /// Release a held mint lock.
    async fn unlock(&self, slot: &str) -> Result<()>;

    /// Every token key with a data entry, for the cross-layer audit.
    async fn list_data_keys(&self) -> Result<Vec<String>>;
}

// ── In-memory implementation ──────────────────────────────────────────────

/// In-memory cache backed by `DashMap`, with lazy expiry on access.
#[derive(Default)]
pub struct InMemoryTokenCache {
    data: DashMap<String, (TokenData, Instant)>,
    children: DashMap<String, (Token, Instant)>,
    locks: DashMap<String, Instant>,
}

impl InMemoryTokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get_data(&self, key: &str) -> Result<Option<TokenData>> {
        let hit = self.data.get(key).map(|e| e.value().clone());
        match hit {
            Some((data, deadline)) if deadline > Instant::now() => Ok(Some(data)),
            Some(_) => {
                // Lazy eviction on access
                self.data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store_data(&self, data: &TokenData, ttl: Duration) -> Result<()> {
        self.data.insert(
            data.token.key.clone(),
            (data.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn delete_data(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn get_child(&self, slot: &str) -> Result<Option<Token>> {
        let hit = self.children.get(slot).map(|e| e.value().clone());
        match hit {
            Some((token, deadline)) if deadline > Instant::now() => Ok(Some(token)),
            Some(_) => {
                self.children.remove(slot);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store_child(&self, slot: &str, token: &Token, ttl: Duration) -> Result<()> {
        self.children
            .insert(slot.to_string(), (token.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn try_lock(&self, slot: &str) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        match self.locks.entry(slot.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    held.insert(now + MINT_LOCK_TTL);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert(now + MINT_LOCK_TTL);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, slot: &str) -> Result<()> {
        self.locks.remove(slot);
        Ok(())
    }

    async fn list_data_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.iter().map(|e| e.key().clone()).collect())
    }
}

// ── Redis implementation ──────────────────────────────────────────────────

/// Redis-backed cache. Token data is sealed before it leaves the
/// process; child slots hold only wire tokens, which are themselves
/// secrets, so they are sealed too.
pub struct RedisTokenCache {
    conn: redis::aio::ConnectionManager,
    sealer: Sealer,
    /// Upper bound accepted for the embedded freshness stamp. Redis TTLs
    /// already bound entry lifetime; the stamp guards against a
    /// misconfigured or restored cache.
    seal_max_age: Duration,
}

impl RedisTokenCache {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str, sealer: Sealer, seal_max_age: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            sealer,
            seal_max_age,
        })
    }

    async fn get_sealed(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let sealed: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        let Some(sealed) = sealed else { return Ok(None) };
        match self.sealer.open(&sealed, self.seal_max_age) {
            Ok(payload) => Ok(Some(payload)),
            Err(_) => {
                // Undecryptable entries are dropped rather than surfaced
                debug!(key = %key, "Dropping unreadable cache entry");
                let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
                Ok(None)
            }
        }
    }

    async fn set_sealed(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<()> {
        let sealed = self.sealer.seal(payload)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(sealed)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get_data(&self, key: &str) -> Result<Option<TokenData>> {
        let Some(payload) = self.get_sealed(&format!("token:{key}")).await? else {
            return Ok(None);
        };
        let data: TokenData = serde_json::from_slice(&payload)?;
        Ok(Some(data))
    }

    async fn store_data(&self, data: &TokenData, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_vec(data)?;
        self.set_sealed(&format!("token:{}", data.token.key), &payload, ttl)
            .await
    }

    async fn delete_data(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(format!("token:{key}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_child(&self, slot: &str) -> Result<Option<Token>> {
        let Some(payload) = self.get_sealed(slot).await? else {
            return Ok(None);
        };
        let wire = String::from_utf8(payload)
            .map_err(|_| Error::Cache("Invalid cached wire token".to_string()))?;
        Ok(wire.parse().ok())
    }

    async fn store_child(&self, slot: &str, token: &Token, ttl: Duration) -> Result<()> {
        self.set_sealed(slot, token.to_string().as_bytes(), ttl).await
    }

    async fn try_lock(&self, slot: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(format!("lock:{slot}"))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(MINT_LOCK_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, slot: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(format!("lock:{slot}"))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_data_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("token:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix("token:").map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{current_datetime, TokenType};
    use chrono::Duration as ChronoDuration;

    fn make_data(username: &str) -> TokenData {
        TokenData {
            token: Token::generate(),
            username: username.to_string(),
            token_type: TokenType::Session,
            scopes: vec!["read:all".to_string()],
            created: current_datetime(),
            expires: Some(current_datetime() + ChronoDuration::hours(1)),
            name: None,
            email: None,
            uid: None,
            groups: Vec::new(),
        }
    }

    #[tokio::test]
    async fn store_and_get_data() {
        // GIVEN: a cache with one stored record
        let cache = InMemoryTokenCache::new();
        let data = make_data("alice");
        cache.store_data(&data, Duration::from_secs(60)).await.unwrap();

        // WHEN: fetched by key
        let found = cache.get_data(&data.token.key).await.unwrap();

        // THEN: the full record comes back
        assert_eq!(found, Some(data));
    }

    #[tokio::test]
    async fn expired_entries_are_lazily_evicted() {
        // GIVEN: an entry stored with a zero TTL
        let cache = InMemoryTokenCache::new();
        let data = make_data("alice");
        cache.store_data(&data, Duration::ZERO).await.unwrap();

        // WHEN: fetched
        let found = cache.get_data(&data.token.key).await.unwrap();

        // THEN: it is gone and the map is clean
        assert!(found.is_none());
        assert_eq!(cache.data.len(), 0);
    }

    #[tokio::test]
    async fn delete_evicts_data() {
        let cache = InMemoryTokenCache::new();
        let data = make_data("alice");
        cache.store_data(&data, Duration::from_secs(60)).await.unwrap();

        cache.delete_data(&data.token.key).await.unwrap();
        assert!(cache.get_data(&data.token.key).await.unwrap().is_none());

        // Deleting again is not an error
        cache.delete_data(&data.token.key).await.unwrap();
    }

    #[tokio::test]
    async fn child_slots_round_trip() {
        let cache = InMemoryTokenCache::new();
        let token = Token::generate();

        cache
            .store_child("internal:abc", &token, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get_child("internal:abc").await.unwrap(),
            Some(token)
        );
        assert!(cache.get_child("internal:other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mint_lock_is_exclusive_until_released() {
        // GIVEN: one holder of the lock
        let cache = InMemoryTokenCache::new();
        assert!(cache.try_lock("internal:abc").await.unwrap());

        // THEN: a second acquisition fails while held
        assert!(!cache.try_lock("internal:abc").await.unwrap());

        // AND: succeeds again after release
        cache.unlock("internal:abc").await.unwrap();
        assert!(cache.try_lock("internal:abc").await.unwrap());
    }

    #[tokio::test]
    async fn list_data_keys_reflects_contents() {
        let cache = InMemoryTokenCache::new();
        let a = make_data("alice");
        let b = make_data("bob");
        cache.store_data(&a, Duration::from_secs(60)).await.unwrap();
        cache.store_data(&b, Duration::from_secs(60)).await.unwrap();

        let mut keys = cache.list_data_keys().await.unwrap();
        keys.sort();
        let mut expected = vec![a.token.key, b.token.key];
        expected.sort();
        assert_eq!(keys, expected);
    }
}
