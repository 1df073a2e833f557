//! Admin management.
//!
//! An admin is a username allowed to manipulate any token. The initial
//! set is seeded from configuration on startup; afterwards admins add
//! and remove each other through the API.

use crate::models::{is_valid_username, TokenData, BOOTSTRAP_USERNAME};
use crate::storage::AdminStore;
use crate::{Error, Result};

/// Manage the admin table.
#[derive(Clone)]
pub struct AdminService {
    store: AdminStore,
}

impl AdminService {
    /// Create the service over an admin store.
    #[must_use]
    pub fn new(store: AdminStore) -> Self {
        Self { store }
    }

    /// Seed the admin table from configuration if it is empty.
    pub async fn seed(&self, initial: &[String]) -> Result<()> {
        self.store.seed(initial).await
    }

    /// Whether a username is an admin.
    pub async fn is_admin(&self, username: &str) -> Result<bool> {
        self.store.is_admin(username).await
    }

    /// All admins, sorted by username.
    pub async fn list(&self, auth_data: &TokenData) -> Result<Vec<String>> {
        self.check_admin(auth_data)?;
        self.store.list().await
    }

    /// Add an admin.
    pub async fn add(&self, username: &str, auth_data: &TokenData) -> Result<()> {
        self.check_admin(auth_data)?;
        if !is_valid_username(username) {
            return Err(Error::Validation(format!("Invalid username: {username}")));
        }
        self.store.add(username).await?;
        tracing::info!(username = %username, actor = %auth_data.username, "Added admin");
        Ok(())
    }

    /// Remove an admin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the username is not an admin.
    pub async fn remove(&self, username: &str, auth_data: &TokenData) -> Result<()> {
        self.check_admin(auth_data)?;
        if !self.store.remove(username).await? {
            return Err(Error::NotFound(format!("{username} is not an admin")));
        }
        tracing::info!(username = %username, actor = %auth_data.username, "Removed admin");
        Ok(())
    }

    /// Admin routes require `admin:token`; the bootstrap actor always
    /// qualifies.
    fn check_admin(&self, auth_data: &TokenData) -> Result<()> {
        if auth_data.username == BOOTSTRAP_USERNAME
            || auth_data.has_scope(crate::config::ADMIN_TOKEN_SCOPE)
        {
            Ok(())
        } else {
            Err(Error::Forbidden(
                "Missing required admin:token scope".to_string(),
            ))
        }
    }
}
