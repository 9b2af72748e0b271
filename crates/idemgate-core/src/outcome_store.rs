//! Persistence of terminal outcomes in the shared store.
//!
//! The shared store is the single source of truth for key state; nothing
//! authoritative is kept in process memory.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::key::IdempotencyKey;
use crate::outcome::{ClaimState, ClaimToken, Outcome};
use crate::store::SharedStore;

/// Default namespace for store keys and notification channels.
pub const DEFAULT_KEY_PREFIX: &str = "idempotency:";

/// Reads and writes outcomes under a namespaced key.
pub struct OutcomeStore<S: ?Sized = dyn SharedStore> {
    store: Arc<S>,
    prefix: String,
}

impl<S: ?Sized> Clone for OutcomeStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for OutcomeStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<S: SharedStore + ?Sized> OutcomeStore<S> {
    /// Creates an outcome store over `store` with the given key prefix.
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Returns the underlying shared store.
    #[must_use]
    pub fn shared(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the store key (and channel name) for `key`.
    #[must_use]
    pub fn store_key(&self, key: &IdempotencyKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Replaces `token`'s pending marker with `outcome`, expiring after `ttl`.
    ///
    /// Returns false, writing nothing, if the key no longer holds that marker
    /// (the claim expired or was taken over).
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the outcome cannot be encoded, or
    /// `Error::StoreUnavailable` if the write fails.
    pub async fn put(&self, token: &ClaimToken, outcome: &Outcome, ttl: Duration) -> Result<bool> {
        let payload = outcome.encode()?;
        self.put_encoded(token, &payload, ttl).await
    }

    pub(crate) async fn put_encoded(
        &self,
        token: &ClaimToken,
        payload: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.store
            .set_if_equals(&self.store_key(token.key()), token.marker(), payload, ttl)
            .await
    }

    /// Reads the current state of `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the read fails, or
    /// `Error::Serialization` if the stored value is not a valid outcome.
    pub async fn get(&self, key: &IdempotencyKey) -> Result<ClaimState> {
        let raw = self.store.get(&self.store_key(key)).await?;
        ClaimState::from_raw(raw.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(5);

    fn outcomes() -> (Arc<MemoryStore>, OutcomeStore<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), OutcomeStore::new(store, DEFAULT_KEY_PREFIX))
    }

    #[tokio::test]
    async fn keys_are_namespaced() {
        let (_, outcomes) = outcomes();
        assert_eq!(
            outcomes.store_key(&IdempotencyKey::new("abc")),
            "idempotency:abc"
        );
        assert_eq!(outcomes.prefix(), DEFAULT_KEY_PREFIX);
    }

    #[tokio::test]
    async fn put_replaces_own_marker() {
        let (store, outcomes) = outcomes();
        let token = ClaimToken::generate(IdempotencyKey::new("abc"));
        store
            .insert_if_absent(&outcomes.store_key(token.key()), token.marker(), TTL)
            .await
            .expect("claim");
        assert_eq!(outcomes.get(token.key()).await.expect("get"), ClaimState::Pending);

        let outcome = Outcome::new(token.key().clone(), 200, "done", None);
        assert!(outcomes.put(&token, &outcome, TTL).await.expect("put"));
        assert_eq!(
            outcomes.get(token.key()).await.expect("get"),
            ClaimState::Resolved(outcome)
        );
    }

    #[tokio::test]
    async fn put_leaves_foreign_marker_alone() {
        let (store, outcomes) = outcomes();
        let key = IdempotencyKey::new("abc");
        let ours = ClaimToken::generate(key.clone());
        let theirs = ClaimToken::generate(key.clone());
        store
            .insert_if_absent(&outcomes.store_key(&key), theirs.marker(), TTL)
            .await
            .expect("claim");

        let outcome = Outcome::new(key.clone(), 200, "stale", None);
        assert!(!outcomes.put(&ours, &outcome, TTL).await.expect("put"));
        assert_eq!(
            store.get("idempotency:abc").await.expect("get").as_deref(),
            Some(theirs.marker())
        );
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let (_, outcomes) = outcomes();
        let state = outcomes
            .get(&IdempotencyKey::new("nothing"))
            .await
            .expect("get");
        assert_eq!(state, ClaimState::Absent);
    }
}
