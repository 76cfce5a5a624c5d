//! Port Interfaces
//!
//! Contracts for the two external collaborators this layer consumes:
//!
//! - [`TokenProvider`]: the authenticated-session credential used in the
//!   gateway handshake.
//! - [`KeyValueStore`]: durable storage used only for session-id
//!   persistence and periodic cache snapshot/restore.

use async_trait::async_trait;

// =============================================================================
// Token Provider
// =============================================================================

/// Errors from a credential provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    /// No credential is available. Fatal: connecting without one is
    /// never retried.
    #[error("no session credential available")]
    Missing,

    /// The provider failed to produce a credential.
    #[error("credential provider error: {0}")]
    Provider(String),
}

/// Supplies the bearer credential for the gateway handshake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Missing`] when no authenticated session
    /// exists.
    async fn bearer_token(&self) -> Result<String, TokenError>;
}

/// Token provider backed by an environment variable.
///
/// Reads the token once per call so a refreshed credential is picked up
/// without restarting.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    /// Conventional environment variable for the session token.
    pub const DEFAULT_VAR: &'static str = "BROKER_SYNC_TOKEN";

    /// Create a provider reading the given environment variable.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(TokenError::Missing),
        }
    }
}

// =============================================================================
// Key-Value Store
// =============================================================================

/// Errors from the durable key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored payload could not be parsed.
    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Durable key-value storage.
///
/// Used for exactly two things: session resumption tokens and cache
/// snapshots. Values are opaque strings; callers own the encoding.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing store fails; a missing
    /// key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing store fails.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing store fails.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// =============================================================================
// Tests
// =============================================================================
