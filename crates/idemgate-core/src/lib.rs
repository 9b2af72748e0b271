//! # idemgate-core
//!
//! Distributed idempotency coordination.
//!
//! Concurrent or retried invocations sharing an idempotency key execute the
//! underlying operation exactly once; every caller, on any process sharing
//! the store, observes the identical outcome.
//!
//! - **Key Resolver** ([`key`]): caller-supplied key or request fingerprint
//! - **Policy Resolver** ([`policy`]): defaults, bypass set, route overrides
//! - **Outcome Store** ([`outcome_store`]): terminal results with expiry
//! - **Coordinator** ([`coordinator`]): claim/wait over insert-if-absent and pub/sub
//! - **Shared Store** ([`store`]): the key-value and pub/sub contract, with an
//!   in-memory implementation and a Redis one behind the `redis` feature
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use idemgate_core::prelude::*;
//!
//! let coordinator = Coordinator::new(Arc::new(MemoryStore::new()), DEFAULT_KEY_PREFIX);
//! let key = IdempotencyKey::new("order-42");
//! let policy = MethodPolicy::default();
//!
//! match coordinator.claim(&key, &policy).await? {
//!     ClaimResult::FirstCaller(token) => {
//!         let outcome = Outcome::new(key.clone(), 200, "done", None);
//!         coordinator.resolve(&token, &outcome, policy.outcome_ttl()).await?;
//!     }
//!     ClaimResult::Follower(outcome) => println!("replayed {}", outcome.status_code),
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coordinator;
pub mod error;
pub mod key;
pub mod metrics;
pub mod observability;
pub mod outcome;
pub mod outcome_store;
pub mod policy;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::coordinator::{ClaimResult, Coordinator, Resolution};
    pub use crate::error::{Error, Result};
    pub use crate::key::{IDEMPOTENCY_KEY_HEADER, IdempotencyKey, KeySource, resolve_key};
    pub use crate::outcome::{ClaimState, ClaimToken, Outcome, PENDING_SENTINEL};
    pub use crate::outcome_store::{DEFAULT_KEY_PREFIX, OutcomeStore};
    pub use crate::policy::{MethodPolicy, PolicyFile, PolicyOverride, PolicyResolver};
    #[cfg(feature = "redis")]
    pub use crate::redis_store::RedisStore;
    pub use crate::store::{MemoryStore, SharedStore, Subscription};
}

pub use error::{Error, Result};
