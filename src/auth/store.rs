//! Token storage keyed by mailbox.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::OAuth2Token;
use crate::errors::MailResult;

/// Entries older than this are dropped by [`TokenStore::clear_expired`].
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Tokens held for one mailbox.
#[derive(Debug, Clone)]
pub struct StoredToken {
    /// Latest access token, if one was issued.
    pub access: Option<OAuth2Token>,
    /// Refresh token (protected).
    pub refresh_token: Option<SecretString>,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

impl StoredToken {
    /// An entry holding only a refresh token.
    pub fn refreshable(refresh_token: impl Into<String>) -> Self {
        Self {
            access: None,
            refresh_token: Some(SecretString::new(refresh_token.into())),
            stored_at: Utc::now(),
        }
    }

    /// An entry holding an access token and, optionally, a refresh token.
    pub fn issued(access: OAuth2Token, refresh_token: Option<SecretString>) -> Self {
        Self {
            access: Some(access),
            refresh_token,
            stored_at: Utc::now(),
        }
    }

    /// Access token that is not about to expire.
    pub fn usable_access(&self) -> Option<&OAuth2Token> {
        self.access.as_ref().filter(|t| !t.is_expired())
    }
}

/// Stores tokens per mailbox.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Stores or replaces the entry for `key`.
    async fn store(&self, key: &str, token: StoredToken) -> MailResult<()>;

    /// Entry for `key`, if any.
    async fn get(&self, key: &str) -> MailResult<Option<StoredToken>>;

    /// Removes the entry for `key`. Returns true if one existed.
    async fn delete(&self, key: &str) -> MailResult<bool>;

    /// Drops stale entries and returns how many were removed.
    async fn clear_expired(&self) -> MailResult<usize>;
}

/// [`TokenStore`] kept in process memory.
///
/// `clear_expired` drops entries older than the max age, and entries whose
/// access token expired with no refresh token to renew it.
#[derive(Debug)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<String, StoredToken>>,
    max_age: Duration,
}

impl InMemoryTokenStore {
    /// Creates an empty store with a 24 hour max age.
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_MAX_AGE)
    }

    /// Creates an empty store with a custom max age.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn store(&self, key: &str, token: StoredToken) -> MailResult<()> {
        self.lock().insert(key.to_string(), token);
        Ok(())
    }

    async fn get(&self, key: &str) -> MailResult<Option<StoredToken>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> MailResult<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn clear_expired(&self) -> MailResult<usize> {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - max_age;

        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, entry| {
            let dead_access = entry.usable_access().is_none() && entry.refresh_token.is_none();
            entry.stored_at > cutoff && !dead_access
        });
        Ok(before - tokens.len())
    }
}

/// Runs `clear_expired` every `interval` until `shutdown` is cancelled.
pub fn spawn_cleanup(
    store: Arc<dyn TokenStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match store.clear_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Cleared expired tokens"),
                    Err(e) => tracing::warn!(error = %e, "Token cleanup failed"),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_get_delete() {
        let store = InMemoryTokenStore::new();
        store.store("a@example.com", StoredToken::refreshable("rt")).await.unwrap();

        assert!(store.get("a@example.com").await.unwrap().is_some());
        assert!(store.get("b@example.com").await.unwrap().is_none());
        assert!(store.delete("a@example.com").await.unwrap());
        assert!(!store.delete("a@example.com").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clear_expired_keeps_renewable_entries() {
        let store = InMemoryTokenStore::new();
        let expired = OAuth2Token::new("old").with_expires_at(Utc::now());
        let fresh = OAuth2Token::new("new").expires_in(Duration::from_secs(3600));

        store.store("dead", StoredToken::issued(expired.clone(), None)).await.unwrap();
        store
            .store("renewable", StoredToken::issued(expired, Some(SecretString::new("rt".into()))))
            .await
            .unwrap();
        store.store("fresh", StoredToken::issued(fresh, None)).await.unwrap();

        let old = StoredToken {
            stored_at: Utc::now() - chrono::Duration::hours(25),
            ..StoredToken::refreshable("rt")
        };
        store.store("old", old).await.unwrap();

        assert_eq!(store.clear_expired().await.unwrap(), 2);
        assert!(store.get("renewable").await.unwrap().is_some());
        assert!(store.get("fresh").await.unwrap().is_some());
        assert!(store.get("dead").await.unwrap().is_none());
        assert!(store.get("old").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_until_shutdown() {
        let store = Arc::new(InMemoryTokenStore::new());
        let expired = OAuth2Token::new("old").with_expires_at(Utc::now());
        store.store("dead", StoredToken::issued(expired, None)).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_cleanup(store.clone(), Duration::from_secs(3600), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
