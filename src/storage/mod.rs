//! Storage backends: the SQL source of truth and the key-value cache
//! used on the authentication fast path.
//!
//! The SQL store owns enumeration, ownership, uniqueness, and history;
//! the cache is authoritative for authentication lookups and is evicted
//! or overwritten after every SQL mutation commits. A crash between
//! commit and eviction leaves a stale cache entry bounded by its TTL.

mod cache;
mod sql;

pub use cache::{InMemoryTokenCache, RedisTokenCache, TokenCache, MINT_LOCK_TTL, READ_THROUGH_TTL};
pub use sql::{AdminStore, Database, HistoryStore, TokenDatabaseStore};

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::time::sleep;
use tracing::debug;

use crate::Result;

/// Maximum retries for transient backend failures.
const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Retry a storage operation on transient failure.
///
/// At most two retries with jittered exponential backoff; anything else
/// surfaces immediately.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or the error is not
/// transient.
pub async fn retry_transient<F, Fut, T>(name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff {
        current_interval: Duration::from_millis(50),
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(500),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    let mut attempts = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempts < MAX_TRANSIENT_RETRIES => {
                attempts += 1;
                let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(100));
                debug!(
                    operation = name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after transient storage error"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One detected drift between the SQL store and the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    /// Token key the drift concerns
    pub key: String,
    /// Human-readable description
    pub message: String,
}
