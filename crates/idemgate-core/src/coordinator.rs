//! Claim/wait protocol over a [`SharedStore`].
//!
//! # How It Works
//!
//! 1. Subscribe to the key's channel. Registration happens before the insert,
//!    so an outcome published after the insert cannot be missed.
//! 2. `insert_if_absent(key, marker, pending_ttl)` with a fresh claim-scoped
//!    marker ([`ClaimToken`]).
//! 3. Insert won: the caller is the claimant ([`ClaimResult::FirstCaller`]).
//! 4. Insert lost: read the key.
//!    - Resolved: replay it ([`ClaimResult::Follower`]).
//!    - Pending: wait on the subscription until the first message that is
//!      not a pending marker, or the wait deadline ([`Error::ClaimTimeout`]).
//!    - Absent (expired or released in between): try the insert again within
//!      the same deadline.
//!
//! The subscription is dropped on every exit path. A timed-out follower leaves
//! the pending key alone; it expires after `pending_ttl`.
//!
//! The claimant completes with [`Coordinator::resolve`] (compare-and-set of
//! its marker, then publish) or [`Coordinator::release`] (compare-and-delete
//! of its marker). A claimant whose marker expired finds another value there
//! and writes nothing: [`Resolution::ClaimLost`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::key::IdempotencyKey;
use crate::metrics;
use crate::observability::coordination_span;
use crate::outcome::{ClaimState, ClaimToken, Outcome, is_pending};
use crate::outcome_store::OutcomeStore;
use crate::policy::MethodPolicy;
use crate::store::{SharedStore, Subscription};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller won the claim and must execute, then resolve or release
    /// with the token.
    FirstCaller(ClaimToken),
    /// Another caller executed; this is its outcome.
    Follower(Outcome),
}

impl ClaimResult {
    /// Returns true if this caller must execute the operation.
    #[must_use]
    pub const fn is_first(&self) -> bool {
        matches!(self, Self::FirstCaller(_))
    }

    /// Returns the claim token if this caller won the claim.
    #[must_use]
    pub fn into_token(self) -> Option<ClaimToken> {
        match self {
            Self::FirstCaller(token) => Some(token),
            Self::Follower(_) => None,
        }
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::FirstCaller(_) => "first",
            Self::Follower(_) => "follower",
        }
    }
}

/// What a claimant's [`Coordinator::resolve`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The outcome replaced the claimant's marker and was published.
    Published {
        /// Subscribers that received the notification.
        receivers: usize,
    },
    /// The marker was gone; the outcome was discarded.
    ClaimLost,
}

/// Coordinates idempotent execution across every process sharing a store.
pub struct Coordinator<S: SharedStore + ?Sized = dyn SharedStore> {
    store: Arc<S>,
    outcomes: OutcomeStore<S>,
}

// Manual Clone: `Arc<S>` clones regardless of `S: Clone`.
impl<S: SharedStore + ?Sized> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            outcomes: self.outcomes.clone(),
        }
    }
}

impl<S: SharedStore + ?Sized> std::fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("store", &self.store.name())
            .field("prefix", &self.outcomes.prefix())
            .finish()
    }
}

impl<S: SharedStore + ?Sized> Coordinator<S> {
    /// Creates a coordinator namespacing keys and channels with `prefix`.
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        let outcomes = OutcomeStore::new(Arc::clone(&store), prefix);
        Self { store, outcomes }
    }

    /// Returns the outcome store.
    #[must_use]
    pub const fn outcomes(&self) -> &OutcomeStore<S> {
        &self.outcomes
    }

    /// Returns the shared store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Claims `key` or waits for the claimant's outcome.
    ///
    /// # Errors
    ///
    /// - `Error::ClaimTimeout` if no outcome arrives within `policy.wait_timeout_ms`.
    /// - `Error::StoreUnavailable` if a store operation fails or the
    ///   subscription closes early.
    /// - `Error::Serialization` if a stored or published outcome is unreadable.
    pub async fn claim(&self, key: &IdempotencyKey, policy: &MethodPolicy) -> Result<ClaimResult> {
        let span = coordination_span("claim", key.as_str());
        let started = Instant::now();

        let result = self.claim_inner(key, policy).instrument(span.clone()).await;

        let label = match &result {
            Ok(claim) => claim.label(),
            Err(Error::ClaimTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        span.record("result", label);
        metrics::record_claim(label, started.elapsed());
        result
    }

    async fn claim_inner(&self, key: &IdempotencyKey, policy: &MethodPolicy) -> Result<ClaimResult> {
        let deadline = Instant::now() + policy.wait_timeout();
        let store_key = self.outcomes.store_key(key);
        let token = ClaimToken::generate(key.clone());

        let mut subscription = observe("subscribe", self.store.subscribe(&store_key).await)?;

        loop {
            let inserted = observe(
                "insert_if_absent",
                self.store
                    .insert_if_absent(&store_key, token.marker(), policy.pending_ttl())
                    .await,
            )?;
            if inserted {
                tracing::debug!("claimed key");
                return Ok(ClaimResult::FirstCaller(token));
            }

            match observe("get", self.outcomes.get(key).await)? {
                ClaimState::Resolved(outcome) => {
                    tracing::debug!(status = outcome.status_code, "replaying stored outcome");
                    return Ok(ClaimResult::Follower(outcome));
                }
                ClaimState::Pending => {
                    tracing::debug!("key pending; waiting for outcome");
                    return wait_for_outcome(&mut subscription, key, policy, deadline)
                        .await
                        .map(ClaimResult::Follower);
                }
                ClaimState::Absent => {
                    if Instant::now() >= deadline {
                        return Err(timeout(key, policy));
                    }
                    tracing::debug!("key vanished between insert and read; retrying claim");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Stores `outcome` for `ttl` in place of `token`'s marker and notifies
    /// waiting followers.
    ///
    /// If the key no longer holds the marker (the pending TTL ran out and the
    /// key expired or was claimed again) nothing is written or published.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `outcome` belongs to another key,
    /// `Error::Serialization` if the outcome cannot be encoded, or
    /// `Error::StoreUnavailable` if the write or publish fails.
    pub async fn resolve(
        &self,
        token: &ClaimToken,
        outcome: &Outcome,
        ttl: Duration,
    ) -> Result<Resolution> {
        if &outcome.key != token.key() {
            return Err(Error::InvalidInput(format!(
                "outcome for {} cannot resolve the claim on {}",
                outcome.key,
                token.key()
            )));
        }

        let span = coordination_span("resolve", outcome.key.as_str());
        async {
            let payload = outcome.encode()?;
            let stored = observe(
                "set_if_equals",
                self.outcomes.put_encoded(token, &payload, ttl).await,
            )?;
            if !stored {
                tracing::warn!("claim expired before resolve; outcome discarded");
                metrics::record_claim_lost("resolve");
                return Ok(Resolution::ClaimLost);
            }

            let channel = self.outcomes.store_key(token.key());
            let receivers = observe("publish", self.store.publish(&channel, &payload).await)?;
            tracing::debug!(receivers, status = outcome.status_code, "outcome published");
            Ok(Resolution::Published { receivers })
        }
        .instrument(span)
        .await
    }

    /// Releases a pending claim without storing an outcome.
    ///
    /// Only `token`'s own marker is deleted; a stored outcome or a later
    /// claimant's marker is left alone. Returns true if the key was released.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the delete fails.
    pub async fn release(&self, token: &ClaimToken) -> Result<bool> {
        let store_key = self.outcomes.store_key(token.key());
        let released = observe(
            "delete_if_equals",
            self.store.delete_if_equals(&store_key, token.marker()).await,
        )?;
        if released {
            tracing::debug!(key = %token.key(), "released pending claim");
        } else {
            tracing::warn!(key = %token.key(), "claim expired before release");
            metrics::record_claim_lost("release");
        }
        Ok(released)
    }

    /// Reads the current state of `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` or `Error::Serialization` on failure.
    pub async fn state(&self, key: &IdempotencyKey) -> Result<ClaimState> {
        observe("get", self.outcomes.get(key).await)
    }

    /// Checks that the shared store is reachable.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the store does not answer.
    pub async fn ping(&self) -> Result<()> {
        observe("ping", self.store.ping().await)
    }
}

async fn wait_for_outcome(
    subscription: &mut Subscription,
    key: &IdempotencyKey,
    policy: &MethodPolicy,
    deadline: Instant,
) -> Result<Outcome> {
    let next_outcome = async {
        while let Some(message) = subscription.next_message().await {
            if is_pending(&message) {
                continue;
            }
            return Outcome::decode(&message);
        }
        Err(Error::store(format!(
            "subscription on {} closed before an outcome arrived",
            subscription.channel()
        )))
    };

    match tokio::time::timeout_at(deadline, next_outcome).await {
        Ok(outcome) => observe("subscribe", outcome),
        Err(_) => Err(timeout(key, policy)),
    }
}

fn timeout(key: &IdempotencyKey, policy: &MethodPolicy) -> Error {
    tracing::warn!(key = %key, wait_timeout_ms = policy.wait_timeout_ms, "idempotency wait timed out");
    Error::ClaimTimeout {
        key: key.to_string(),
        waited_ms: policy.wait_timeout_ms,
    }
}

/// Counts and logs store-class failures on the way through.
fn observe<T>(op: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_store_failure() {
            metrics::record_store_error(op);
            tracing::warn!(op, error = %e, "shared store operation failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::PENDING_SENTINEL;
    use crate::store::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, Coordinator<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), Coordinator::new(store, "test:"))
    }

    fn policy(wait_ms: u64) -> MethodPolicy {
        MethodPolicy {
            wait_timeout_ms: wait_ms,
            ..MethodPolicy::default()
        }
    }

    async fn first(
        coordinator: &Coordinator<MemoryStore>,
        key: &IdempotencyKey,
        wait_ms: u64,
    ) -> ClaimToken {
        coordinator
            .claim(key, &policy(wait_ms))
            .await
            .expect("claim")
            .into_token()
            .expect("first caller")
    }

    #[tokio::test]
    async fn first_claim_wins_and_writes_its_marker() {
        let (store, coordinator) = coordinator();
        let key = IdempotencyKey::new("k1");

        let token = first(&coordinator, &key, 1000).await;
        assert_eq!(token.key(), &key);
        assert_eq!(
            store.get("test:k1").await.expect("get").as_deref(),
            Some(token.marker())
        );
        assert_eq!(store.subscriber_count("test:k1"), 0);
    }

    #[tokio::test]
    async fn resolved_key_replays_without_waiting() {
        let (_, coordinator) = coordinator();
        let key = IdempotencyKey::new("k2");
        let token = first(&coordinator, &key, 1000).await;
        let outcome = Outcome::new(key.clone(), 200, "hello", None);
        let resolution = coordinator
            .resolve(&token, &outcome, Duration::from_secs(5))
            .await
            .expect("resolve");
        assert_eq!(resolution, Resolution::Published { receivers: 0 });

        let claim = coordinator.claim(&key, &policy(1000)).await.expect("claim");
        assert_eq!(claim, ClaimResult::Follower(outcome));
    }

    #[tokio::test]
    async fn follower_wakes_on_publish() {
        let (store, coordinator) = coordinator();
        let key = IdempotencyKey::new("k3");
        let token = first(&coordinator, &key, 5000).await;

        let follower = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.claim(&key, &policy(5000)).await })
        };

        while store.subscriber_count("test:k3") == 0 {
            tokio::task::yield_now().await;
        }

        let outcome = Outcome::new(key.clone(), 201, "created", None);
        let resolution = coordinator
            .resolve(&token, &outcome, Duration::from_secs(5))
            .await
            .expect("resolve");
        assert_eq!(resolution, Resolution::Published { receivers: 1 });

        let claim = follower.await.expect("join").expect("claim");
        assert_eq!(claim, ClaimResult::Follower(outcome));
        assert_eq!(store.subscriber_count("test:k3"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_times_out_on_stuck_key() {
        let (store, coordinator) = coordinator();
        let key = IdempotencyKey::new("abc");
        store
            .insert_if_absent("test:abc", PENDING_SENTINEL, Duration::from_secs(60))
            .await
            .expect("insert");

        let err = coordinator.claim(&key, &policy(100)).await.unwrap_err();
        match err {
            Error::ClaimTimeout { key, waited_ms } => {
                assert_eq!(key, "abc");
                assert_eq!(waited_ms, 100);
            }
            other => panic!("expected ClaimTimeout, got {other:?}"),
        }
        assert_eq!(store.subscriber_count("test:abc"), 0);
        assert_eq!(
            store.get("test:abc").await.expect("get").as_deref(),
            Some(PENDING_SENTINEL)
        );
    }

    #[tokio::test]
    async fn release_only_removes_own_marker() {
        let (store, coordinator) = coordinator();
        let key = IdempotencyKey::new("k4");
        let token = first(&coordinator, &key, 1000).await;

        assert!(coordinator.release(&token).await.expect("release"));
        assert_eq!(coordinator.state(&key).await.expect("state"), ClaimState::Absent);

        let second = first(&coordinator, &key, 1000).await;
        let outcome = Outcome::new(key.clone(), 200, "kept", None);
        coordinator
            .resolve(&second, &outcome, Duration::from_secs(5))
            .await
            .expect("resolve");
        assert!(!coordinator.release(&token).await.expect("release"));
        assert!(!coordinator.release(&second).await.expect("release"));
        assert!(store.get("test:k4").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn pending_echoes_are_ignored() {
        let (store, coordinator) = coordinator();
        let key = IdempotencyKey::new("k5");
        let token = first(&coordinator, &key, 5000).await;

        let follower = {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.claim(&key, &policy(5000)).await })
        };
        while store.subscriber_count("test:k5") == 0 {
            tokio::task::yield_now().await;
        }

        store.publish("test:k5", PENDING_SENTINEL).await.expect("publish");
        store.publish("test:k5", token.marker()).await.expect("publish");
        let outcome = Outcome::new(key.clone(), 200, "after echo", None);
        coordinator
            .resolve(&token, &outcome, Duration::from_secs(5))
            .await
            .expect("resolve");

        let claim = follower.await.expect("join").expect("claim");
        assert_eq!(claim, ClaimResult::Follower(outcome));
    }

    #[tokio::test]
    async fn outcome_for_another_key_is_rejected() {
        let (_, coordinator) = coordinator();
        let token = first(&coordinator, &IdempotencyKey::new("mine"), 1000).await;
        let outcome = Outcome::new(IdempotencyKey::new("theirs"), 200, "x", None);

        let err = coordinator
            .resolve(&token, &outcome, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(
            coordinator.state(token.key()).await.expect("state"),
            ClaimState::Pending
        );
    }

    #[tokio::test]
    async fn corrupt_stored_value_is_a_serialization_error() {
        let (store, coordinator) = coordinator();
        store
            .set_with_expiry("test:bad", "{garbage", Duration::from_secs(5))
            .await
            .expect("set");

        let err = coordinator
            .claim(&IdempotencyKey::new("bad"), &policy(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
