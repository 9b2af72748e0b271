//! Shared key-value and publish/subscribe store abstraction.
//!
//! Coordination relies on exactly two properties of the store:
//!
//! - `insert_if_absent` is atomic across every process sharing the store.
//! - A subscription registered before a `publish` receives that message.
//!
//! [`MemoryStore`] provides both within one process (tests, development,
//! single-instance deployments). The Redis-backed store lives in
//! [`crate::redis_store`] behind the `redis` feature.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{BoxStream, Stream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{Error, Result};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Async contract over the shared key-value and pub/sub store.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Short backend name for logs and readiness output.
    fn name(&self) -> &'static str;

    /// Writes `value` under `key` only if the key has no live value.
    ///
    /// Returns `true` if this call performed the write.
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Reads the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally writes `value` under `key` with an expiry.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Replaces the live value under `key` with `value` (expiring after
    /// `ttl`) only if it currently equals `expected`.
    ///
    /// Returns `true` if this call performed the write.
    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Deletes `key` only if its live value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Publishes `message` on `channel`, returning the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Registers a subscription on `channel`.
    ///
    /// The registration is in effect when this returns; messages published
    /// afterwards are delivered to the returned handle.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// A live registration on a notification channel.
///
/// Dropping the handle unregisters it.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, String>,
}

impl Subscription {
    /// Wraps a message stream for `channel`.
    pub fn new(
        channel: impl Into<String>,
        messages: impl Stream<Item = String> + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            messages: messages.boxed(),
        }
    }

    /// Returns the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message; `None` once the channel is closed.
    pub async fn next_message(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// In-process store with per-entry expiry and broadcast channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryState {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&str> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key).map(|e| e.value.as_str())
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|state| state.channels.get(channel).map(broadcast::Sender::receiver_count))
            .unwrap_or(0)
    }

    /// Returns the number of keys holding a live value.
    #[must_use]
    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|state| state.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::store("memory store lock poisoned"))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock()?;
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut state = self.lock()?;
        Ok(state.live_value(key, now).map(str::to_string))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut state = self.lock()?;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock()?;
        if state.live_value(key, now) != Some(expected) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock()?;
        if state.live_value(key, now) != Some(expected) {
            return Ok(false);
        }
        state.entries.remove(key);
        Ok(true)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let state = self.lock()?;
        let Some(sender) = state.channels.get(channel) else {
            return Ok(0);
        };
        // A send error only means nobody is listening.
        Ok(sender.send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut state = self.lock()?;
        state
            .channels
            .retain(|name, sender| name == channel || sender.receiver_count() > 0);

        let receiver = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        drop(state);

        let messages = BroadcastStream::new(receiver)
            .filter_map(|message| futures::future::ready(message.ok()));
        Ok(Subscription::new(channel, messages))
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
