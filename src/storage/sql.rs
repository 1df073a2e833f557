//! SQL backing store for tokens, change history, and admins.
//!
//! The database is the source of truth for enumeration, ownership, the
//! parent/child tree, and the uniqueness of `(username, token_name)` for
//! user tokens. Secrets never land here; only their SHA-256 hashes do.
//!
//! Mutating operations take a `&mut SqliteConnection` so the service
//! layer can group the history row and the mutation into one
//! transaction. Reads go straight through the pool.

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};

use crate::models::{
    TokenChange, TokenChangeHistoryEntry, TokenData, TokenInfo, TokenType,
};
use crate::{Error, Result};

/// Connection pool wrapper with schema management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the database named by `url` and ensure the schema.
    ///
    /// In-memory databases get a single persistent connection so the
    /// schema survives between queries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the URL is invalid or the schema
    /// cannot be created.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(Error::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(if in_memory { 1 } else { 0 })
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS token (
                 key TEXT PRIMARY KEY,
                 hash TEXT NOT NULL,
                 username TEXT NOT NULL,
                 token_type TEXT NOT NULL,
                 token_name TEXT,
                 scopes TEXT NOT NULL,
                 service TEXT,
                 created INTEGER NOT NULL,
                 expires INTEGER,
                 parent TEXT
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS token_name_uq
                 ON token (username, token_name)
                 WHERE token_name IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS token_by_username ON token (username)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS token_by_parent ON token (parent)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS token_change_history (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 token TEXT NOT NULL,
                 username TEXT NOT NULL,
                 token_type TEXT NOT NULL,
                 token_name TEXT,
                 parent TEXT,
                 scopes TEXT NOT NULL,
                 service TEXT,
                 expires INTEGER,
                 old_token_name TEXT,
                 old_scopes TEXT,
                 old_expires INTEGER,
                 actor TEXT NOT NULL,
                 action TEXT NOT NULL,
                 ip_address TEXT,
                 event_time INTEGER NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS history_by_token ON token_change_history (token)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS admin (username TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Token table operations.
#[derive(Clone)]
pub struct TokenDatabaseStore {
    pool: SqlitePool,
}

impl TokenDatabaseStore {
    /// Create a store over an existing database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Insert a new token row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTokenName`] if a live token with the
    /// same `(username, token_name)` already exists.
    pub async fn add(
        &self,
        conn: &mut SqliteConnection,
        data: &TokenData,
        token_name: Option<&str>,
        service: Option<&str>,
        parent: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO token
                 (key, hash, username, token_type, token_name, scopes, service,
                  created, expires, parent)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&data.token.key)
        .bind(data.token.hash())
        .bind(&data.username)
        .bind(data.token_type.as_str())
        .bind(token_name)
        .bind(join_scopes(&data.scopes))
        .bind(service)
        .bind(data.created.timestamp())
        .bind(data.expires.map(|e| e.timestamp()))
        .bind(parent)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                Error::DuplicateTokenName(token_name.unwrap_or_default().to_string()),
            ),
            Err(e) => Err(Error::Database(e)),
        }
    }

    /// Fetch the public projection of a token.
    pub async fn get_info(&self, key: &str) -> Result<Option<TokenInfo>> {
        let row = sqlx::query("SELECT * FROM token WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_info(&r)).transpose()
    }

    /// Reconstruct token data from the database row for cache
    /// read-through. Identity enrichment (name, email, uid, groups) lives
    /// only in the cache, so a read-through record carries none.
    pub async fn get_data(&self, key: &str) -> Result<Option<(TokenData, String)>> {
        let row = sqlx::query("SELECT * FROM token WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let info = row_to_info(&row)?;
        let hash: String = row.try_get("hash").map_err(Error::Database)?;
        let data = TokenData {
            token: crate::models::Token {
                key: info.token.clone(),
                secret: String::new(),
            },
            username: info.username,
            token_type: info.token_type,
            scopes: info.scopes,
            created: info.created,
            expires: info.expires,
            name: None,
            email: None,
            uid: None,
            groups: Vec::new(),
        };
        Ok(Some((data, hash)))
    }

    /// List tokens, optionally restricted to one owner.
    pub async fn list(&self, username: Option<&str>) -> Result<Vec<TokenInfo>> {
        let rows = match username {
            Some(username) => {
                sqlx::query(
                    "SELECT * FROM token WHERE username = ? ORDER BY created DESC, key",
                )
                .bind(username)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM token ORDER BY created DESC, key")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_info).collect()
    }

    /// Every token key, for the cross-layer audit.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM token")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("key").map_err(Error::Database))
            .collect()
    }

    /// Direct and transitive children of a token, breadth-first.
    pub async fn get_children(&self, key: &str) -> Result<Vec<String>> {
        let mut children = Vec::new();
        let mut frontier = VecDeque::from([key.to_string()]);
        while let Some(parent) = frontier.pop_front() {
            let rows = sqlx::query("SELECT key FROM token WHERE parent = ?")
                .bind(&parent)
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                let child: String = row.try_get("key").map_err(Error::Database)?;
                frontier.push_back(child.clone());
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Update the mutable fields of a token and return the new
    /// projection, or `None` if the token does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTokenName`] when a rename collides.
    pub async fn modify(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        token_name: Option<&str>,
        scopes: Option<&[String]>,
        expires: Option<DateTime<Utc>>,
        no_expire: bool,
    ) -> Result<Option<TokenInfo>> {
        let row = sqlx::query("SELECT * FROM token WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let current = row_to_info(&row)?;

        let new_name = token_name.map_or(current.token_name.clone(), |n| Some(n.to_string()));
        let new_scopes = scopes.map_or(current.scopes.clone(), <[String]>::to_vec);
        let new_expires = if no_expire {
            None
        } else {
            expires.or(current.expires)
        };

        let result = sqlx::query(
            "UPDATE token SET token_name = ?, scopes = ?, expires = ? WHERE key = ?",
        )
        .bind(new_name.as_deref())
        .bind(join_scopes(&new_scopes))
        .bind(new_expires.map(|e| e.timestamp()))
        .bind(key)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(Some(TokenInfo {
                token_name: new_name,
                scopes: new_scopes,
                expires: new_expires,
                ..current
            })),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                Error::DuplicateTokenName(token_name.unwrap_or_default().to_string()),
            ),
            Err(e) => Err(Error::Database(e)),
        }
    }

    /// Delete one token row. Returns whether a row existed.
    pub async fn delete(&self, conn: &mut SqliteConnection, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM token WHERE key = ?")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Find a live internal token matching the mint fingerprint inputs.
    pub async fn get_internal_token_key(
        &self,
        parent_key: &str,
        service: &str,
        scopes: &[String],
        min_expires: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT key FROM token
             WHERE parent = ? AND token_type = 'internal' AND service = ?
                   AND scopes = ? AND expires >= ?
             LIMIT 1",
        )
        .bind(parent_key)
        .bind(service)
        .bind(join_scopes(scopes))
        .bind(min_expires.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<String, _>("key").map_err(Error::Database))
            .transpose()
    }

    /// Find a live notebook token for a parent.
    pub async fn get_notebook_token_key(
        &self,
        parent_key: &str,
        min_expires: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT key FROM token
             WHERE parent = ? AND token_type = 'notebook' AND expires >= ?
             LIMIT 1",
        )
        .bind(parent_key)
        .bind(min_expires.timestamp())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<String, _>("key").map_err(Error::Database))
            .transpose()
    }
}

/// Token change history operations.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Create a store over an existing database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Append one history row.
    pub async fn add(
        &self,
        conn: &mut SqliteConnection,
        entry: &TokenChangeHistoryEntry,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_change_history
                 (token, username, token_type, token_name, parent, scopes, service,
                  expires, old_token_name, old_scopes, old_expires, actor, action,
                  ip_address, event_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.token)
        .bind(&entry.username)
        .bind(entry.token_type.as_str())
        .bind(entry.token_name.as_deref())
        .bind(entry.parent.as_deref())
        .bind(join_scopes(&entry.scopes))
        .bind(entry.service.as_deref())
        .bind(entry.expires.map(|e| e.timestamp()))
        .bind(entry.old_token_name.as_deref())
        .bind(entry.old_scopes.as_deref().map(join_scopes))
        .bind(entry.old_expires.map(|e| e.timestamp()))
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(entry.ip_address.as_deref())
        .bind(entry.event_time.timestamp())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Every change for one token, newest first.
    pub async fn list_for_token(&self, key: &str) -> Result<Vec<TokenChangeHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM token_change_history WHERE token = ? ORDER BY id DESC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }
}

/// Admin table operations.
#[derive(Clone)]
pub struct AdminStore {
    pool: SqlitePool,
}

impl AdminStore {
    /// Create a store over an existing database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Seed the admin table from configuration if it is empty.
    pub async fn seed(&self, initial: &[String]) -> Result<()> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM admin")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
            .map_err(Error::Database)?;
        if count > 0 {
            return Ok(());
        }
        for username in initial {
            sqlx::query("INSERT OR IGNORE INTO admin (username) VALUES (?)")
                .bind(username)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Whether a username is an admin.
    pub async fn is_admin(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT username FROM admin WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// All admins, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT username FROM admin ORDER BY username")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("username").map_err(Error::Database))
            .collect()
    }

    /// Add an admin. Adding an existing admin is a no-op.
    pub async fn add(&self, username: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO admin (username) VALUES (?)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove an admin. Returns whether the admin existed.
    pub async fn remove(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM admin WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Scope lists are stored comma-joined; they are validated to never
/// contain commas.
fn join_scopes(scopes: &[String]) -> String {
    scopes.join(",")
}

fn split_scopes(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_else(Utc::now)
}

fn row_to_info(row: &SqliteRow) -> Result<TokenInfo> {
    let type_str: String = row.try_get("token_type").map_err(Error::Database)?;
    Ok(TokenInfo {
        token: row.try_get("key").map_err(Error::Database)?,
        username: row.try_get("username").map_err(Error::Database)?,
        token_type: type_str.parse()?,
        scopes: split_scopes(&row.try_get::<String, _>("scopes").map_err(Error::Database)?),
        created: timestamp(row.try_get("created").map_err(Error::Database)?),
        expires: row
            .try_get::<Option<i64>, _>("expires")
            .map_err(Error::Database)?
            .map(timestamp),
        token_name: row.try_get("token_name").map_err(Error::Database)?,
        service: row.try_get("service").map_err(Error::Database)?,
        parent: row.try_get("parent").map_err(Error::Database)?,
    })
}

fn row_to_history(row: &SqliteRow) -> Result<TokenChangeHistoryEntry> {
    let type_str: String = row.try_get("token_type").map_err(Error::Database)?;
    let action_str: String = row.try_get("action").map_err(Error::Database)?;
    Ok(TokenChangeHistoryEntry {
        token: row.try_get("token").map_err(Error::Database)?,
        username: row.try_get("username").map_err(Error::Database)?,
        token_type: type_str.parse::<TokenType>()?,
        token_name: row.try_get("token_name").map_err(Error::Database)?,
        parent: row.try_get("parent").map_err(Error::Database)?,
        scopes: split_scopes(&row.try_get::<String, _>("scopes").map_err(Error::Database)?),
        service: row.try_get("service").map_err(Error::Database)?,
        expires: row
            .try_get::<Option<i64>, _>("expires")
            .map_err(Error::Database)?
            .map(timestamp),
        old_token_name: row.try_get("old_token_name").map_err(Error::Database)?,
        old_scopes: row
            .try_get::<Option<String>, _>("old_scopes")
            .map_err(Error::Database)?
            .map(|s| split_scopes(&s)),
        old_expires: row
            .try_get::<Option<i64>, _>("old_expires")
            .map_err(Error::Database)?
            .map(timestamp),
        actor: row.try_get("actor").map_err(Error::Database)?,
        action: action_str.parse::<TokenChange>()?,
        ip_address: row.try_get("ip_address").map_err(Error::Database)?,
        event_time: timestamp(row.try_get("event_time").map_err(Error::Database)?),
    })
}
