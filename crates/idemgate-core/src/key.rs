//! Idempotency key resolution.
//!
//! A key is either supplied by the caller (the `x-idempotency-key` header) or
//! derived as a request fingerprint:
//!
//! ```text
//! hex(SHA256(JCS({ "body": <body>, "encoding": <encoding>, "path": <path> })))
//! ```
//!
//! JSON bodies are embedded as parsed values so that key order and whitespace
//! do not change the fingerprint. Other payloads are embedded as base64 under
//! `encoding = "raw"`, and an empty body as `null` under `encoding = "empty"`.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Header carrying a caller-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Maximum accepted length of a caller-supplied key, in bytes.
pub const MAX_HEADER_KEY_LEN: usize = 255;

/// Opaque identifier grouping requests that represent one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wraps a key value without validation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Taken verbatim from the request header.
    Header,
    /// Derived from the request path and body.
    Fingerprint,
}

/// Resolves the idempotency key for a request.
///
/// A non-empty header value wins and is used verbatim (after trimming
/// surrounding whitespace); otherwise the key is the request fingerprint.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the supplied header value exceeds
/// [`MAX_HEADER_KEY_LEN`], or `Error::Serialization` if the fingerprint
/// document cannot be canonicalized.
pub fn resolve_key(
    path: &str,
    body: &[u8],
    header_value: Option<&str>,
) -> Result<(IdempotencyKey, KeySource)> {
    if let Some(supplied) = header_value.map(str::trim).filter(|v| !v.is_empty()) {
        if supplied.len() > MAX_HEADER_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "{IDEMPOTENCY_KEY_HEADER} must be at most {MAX_HEADER_KEY_LEN} bytes"
            )));
        }
        return Ok((IdempotencyKey::new(supplied), KeySource::Header));
    }

    fingerprint(path, body).map(|key| (key, KeySource::Fingerprint))
}

/// Derives the request fingerprint from the path and body.
///
/// # Errors
///
/// Returns `Error::Serialization` if the fingerprint document cannot be
/// canonicalized.
pub fn fingerprint(path: &str, body: &[u8]) -> Result<IdempotencyKey> {
    let (encoding, body_value) = body_document(body);
    let document = json!({
        "body": body_value,
        "encoding": encoding,
        "path": path,
    });

    let canonical = serde_jcs::to_string(&document)
        .map_err(|e| Error::serialization(format!("canonicalize fingerprint: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(IdempotencyKey::new(hex::encode(hasher.finalize())))
}

fn body_document(body: &[u8]) -> (&'static str, Value) {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ("empty", Value::Null);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => ("json", value),
        Err(_) => (
            "raw",
            Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let key = fingerprint("/", br#"{"a":1}"#).unwrap();
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_json_key_order_and_whitespace() {
        let a = fingerprint("/orders", br#"{"amount": 10, "currency": "EUR"}"#).unwrap();
        let b = fingerprint("/orders", br#"{"currency":"EUR","amount":10}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_path_and_body() {
        let base = fingerprint("/orders", br#"{"amount":10}"#).unwrap();
        assert_ne!(base, fingerprint("/refunds", br#"{"amount":10}"#).unwrap());
        assert_ne!(base, fingerprint("/orders", br#"{"amount":11}"#).unwrap());
    }

    #[test]
    fn raw_and_empty_bodies_are_distinct() {
        let empty = fingerprint("/", b"").unwrap();
        let raw = fingerprint("/", b"not json").unwrap();
        let null_json = fingerprint("/", b"null").unwrap();
        assert_ne!(empty, raw);
        assert_ne!(empty, null_json);
    }

    #[test]
    fn header_value_wins_over_fingerprint() {
        let (key, source) = resolve_key("/", br#"{"a":1}"#, Some("abc")).unwrap();
        assert_eq!(key.as_str(), "abc");
        assert_eq!(source, KeySource::Header);

        let (other, _) = resolve_key("/", br#"{"a":2}"#, Some("abc")).unwrap();
        assert_eq!(key, other);
    }

    #[test]
    fn blank_header_falls_back_to_fingerprint() {
        let (key, source) = resolve_key("/", b"{}", Some("   ")).unwrap();
        assert_eq!(source, KeySource::Fingerprint);
        assert_eq!(key, fingerprint("/", b"{}").unwrap());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let long = "k".repeat(MAX_HEADER_KEY_LEN + 1);
        let err = resolve_key("/", b"", Some(&long)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        proptest! {
            #[test]
            fn fingerprint_is_pure(
                path in "/[a-z]{0,12}",
                pairs in prop::collection::vec(("[a-z]{1,8}", -1000i64..1000i64), 0..6)
            ) {
                let map: BTreeMap<String, i64> = pairs.into_iter().collect();
                let body = serde_json::to_vec(&map)
                    .unwrap_or_else(|e| panic!("failed to encode body: {e}"));

                let first = fingerprint(&path, &body)
                    .unwrap_or_else(|e| panic!("fingerprint failed: {e}"));
                let second = fingerprint(&path, &body)
                    .unwrap_or_else(|e| panic!("fingerprint failed: {e}"));

                prop_assert_eq!(first, second);
            }

            #[test]
            fn pretty_and_compact_json_share_a_key(
                pairs in prop::collection::vec(("[a-z]{1,8}", "[a-z0-9 ]{0,16}"), 1..6)
            ) {
                let map: BTreeMap<String, String> = pairs.into_iter().collect();
                let compact = serde_json::to_vec(&map)
                    .unwrap_or_else(|e| panic!("failed to encode body: {e}"));
                let pretty = serde_json::to_vec_pretty(&map)
                    .unwrap_or_else(|e| panic!("failed to encode body: {e}"));

                prop_assert_eq!(
                    fingerprint("/", &compact).unwrap_or_else(|e| panic!("{e}")),
                    fingerprint("/", &pretty).unwrap_or_else(|e| panic!("{e}"))
                );
            }
        }
    }
}
