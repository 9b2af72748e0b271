//! Error types and result aliases for idemgate.
//!
//! Errors are structured for programmatic handling: the HTTP layer maps each
//! variant onto a status code, so variants describe *what* failed rather than
//! how it should be reported.

/// The result type used throughout idemgate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating idempotent execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A follower exceeded its wait bound before the claimant published an outcome.
    #[error("idempotency wait timed out after {waited_ms}ms for key {key}")]
    ClaimTimeout {
        /// The key the follower was waiting on.
        key: String,
        /// The configured wait bound in milliseconds.
        waited_ms: u64,
    },

    /// The shared store could not be reached or rejected an operation.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the store failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored or published payload could not be encoded or decoded as an outcome.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The policy configuration is malformed.
    #[error("policy misconfiguration: {message}")]
    PolicyMisconfiguration {
        /// Description of what is wrong with the configuration.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Creates a new store error with the given message.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new store error with a source cause.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new policy misconfiguration error.
    #[must_use]
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyMisconfiguration {
            message: message.into(),
        }
    }

    /// Returns true for failures of the shared store itself.
    ///
    /// Serialization failures of stored payloads count as store-class failures:
    /// the stored state is unusable either way.
    #[must_use]
    pub const fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Serialization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_timeout_message_names_key_and_bound() {
        let err = Error::ClaimTimeout {
            key: "abc".to_string(),
            waited_ms: 100,
        };
        let message = err.to_string();
        assert!(message.contains("abc"));
        assert!(message.contains("100ms"));
    }

    #[test]
    fn store_with_source_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::store_with_source("connect", io);
        assert!(err.is_store_failure());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn serialization_counts_as_store_failure() {
        assert!(Error::serialization("bad payload").is_store_failure());
        assert!(!Error::policy("bad file").is_store_failure());
        assert!(
            !Error::ClaimTimeout {
                key: "k".into(),
                waited_ms: 1
            }
            .is_store_failure()
        );
    }
}
