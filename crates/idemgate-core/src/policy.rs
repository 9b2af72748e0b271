//! Per-route idempotency policy.
//!
//! The effective [`MethodPolicy`] for a request is resolved from:
//!
//! 1. Process-wide defaults.
//! 2. The bypass set: a bypassed method resolves to `enabled = false`.
//! 3. An exact-match route override keyed by `"METHOD:lowercased-path"`,
//!    which may override any field (including re-enabling a bypassed method
//!    for that one route).
//!
//! Resolution is pure and synchronous. The resolver is built once at startup
//! and shared immutably.
//!
//! ## Policy file
//!
//! ```json
//! {
//!   "defaults": { "waitTimeoutMs": 5000, "bypassMethods": "GET;OPTIONS;" },
//!   "paths": {
//!     "POST:/payments": { "cacheErrorResponses": true, "outcomeTtlMs": 60000 }
//!   }
//! }
//! ```
//!
//! The upper-case `.idempotencyrc` names (`ENABLED`, `WITH_ERROR`, `TIMEOUT`,
//! `TTL`, `BYPASS_METHODS`) are accepted as aliases, in `defaults` and in
//! route overrides, and the flags accept `0`/`1` as well as booleans.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Default wait bound for followers, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 20_000;

/// Default lifetime of a cached outcome, in milliseconds.
pub const DEFAULT_OUTCOME_TTL_MS: u64 = 20_000;

/// Methods that never engage coordination unless a route re-enables them.
pub const DEFAULT_BYPASS_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

/// Effective idempotency parameters for one `(method, path)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodPolicy {
    /// Whether coordination applies at all.
    pub enabled: bool,
    /// Cache non-2xx responses as well.
    pub cache_error_responses: bool,
    /// How long a follower waits for the claimant, in milliseconds.
    pub wait_timeout_ms: u64,
    /// How long a resolved outcome stays authoritative, in milliseconds.
    pub outcome_ttl_ms: u64,
}

impl Default for MethodPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_error_responses: false,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            outcome_ttl_ms: DEFAULT_OUTCOME_TTL_MS,
        }
    }
}

impl MethodPolicy {
    /// Returns the follower wait bound.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Returns the outcome lifetime.
    #[must_use]
    pub const fn outcome_ttl(&self) -> Duration {
        Duration::from_millis(self.outcome_ttl_ms)
    }

    /// Returns the lifetime of the pending sentinel.
    ///
    /// A claimant that never completes frees the key once no follower could
    /// still be waiting on it.
    #[must_use]
    pub const fn pending_ttl(&self) -> Duration {
        self.wait_timeout()
    }

    /// Returns whether a response with `status` should be cached.
    #[must_use]
    pub const fn is_cacheable(&self, status: u16) -> bool {
        self.cache_error_responses || (status >= 200 && status <= 299)
    }

    fn apply(mut self, patch: &PolicyOverride) -> Self {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(cache) = patch.cache_error_responses {
            self.cache_error_responses = cache;
        }
        if let Some(ms) = patch.wait_timeout_ms {
            self.wait_timeout_ms = ms;
        }
        if let Some(ms) = patch.outcome_ttl_ms {
            self.outcome_ttl_ms = ms;
        }
        self
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.wait_timeout_ms == 0 {
            return Err(Error::policy(format!(
                "{context}: waitTimeoutMs must be greater than 0"
            )));
        }
        if self.outcome_ttl_ms == 0 {
            return Err(Error::policy(format!(
                "{context}: outcomeTtlMs must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Partial policy; unset fields inherit from the layer below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyOverride {
    /// Overrides `enabled`.
    #[serde(
        default,
        alias = "ENABLED",
        deserialize_with = "bool_or_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled: Option<bool>,
    /// Overrides `cacheErrorResponses`.
    #[serde(
        default,
        alias = "WITH_ERROR",
        deserialize_with = "bool_or_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_error_responses: Option<bool>,
    /// Overrides `waitTimeoutMs`.
    #[serde(default, alias = "TIMEOUT", skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
    /// Overrides `outcomeTtlMs`.
    #[serde(default, alias = "TTL", skip_serializing_if = "Option::is_none")]
    pub outcome_ttl_ms: Option<u64>,
}

/// Reads a flag written either as a boolean or as `0`/`1`.
fn bool_or_flag<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(u64),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(value)) => Ok(Some(value)),
        Some(Flag::Int(0)) => Ok(Some(false)),
        Some(Flag::Int(1)) => Ok(Some(true)),
        Some(Flag::Int(n)) => Err(<D::Error as serde::de::Error>::custom(format!(
            "expected a boolean, 0 or 1, got {n}"
        ))),
    }
}

/// Bypass methods as written in a policy file: `"GET;OPTIONS;"` or `["GET", "OPTIONS"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodList {
    /// Separator-delimited list (`;` or `,`).
    Delimited(String),
    /// Explicit list.
    List(Vec<String>),
}

impl MethodList {
    /// Returns the normalized (uppercased, deduplicated) method names.
    #[must_use]
    pub fn methods(&self) -> BTreeSet<String> {
        match self {
            Self::Delimited(raw) => parse_method_list(raw),
            Self::List(items) => items
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }
}

/// Defaults section of a policy file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyFileDefaults {
    /// Overrides the default `enabled`.
    #[serde(
        default,
        alias = "ENABLED",
        deserialize_with = "bool_or_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled: Option<bool>,
    /// Overrides the default `cacheErrorResponses`.
    #[serde(
        default,
        alias = "WITH_ERROR",
        deserialize_with = "bool_or_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_error_responses: Option<bool>,
    /// Overrides the default `waitTimeoutMs`.
    #[serde(default, alias = "TIMEOUT", skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
    /// Overrides the default `outcomeTtlMs`.
    #[serde(default, alias = "TTL", skip_serializing_if = "Option::is_none")]
    pub outcome_ttl_ms: Option<u64>,
    /// Replaces the bypass set when present.
    #[serde(
        default,
        alias = "BYPASS_METHODS",
        skip_serializing_if = "Option::is_none"
    )]
    pub bypass_methods: Option<MethodList>,
}

impl PolicyFileDefaults {
    /// Returns the policy fields of this section as an override.
    #[must_use]
    pub const fn as_override(&self) -> PolicyOverride {
        PolicyOverride {
            enabled: self.enabled,
            cache_error_responses: self.cache_error_responses,
            wait_timeout_ms: self.wait_timeout_ms,
            outcome_ttl_ms: self.outcome_ttl_ms,
        }
    }
}

/// On-disk policy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyFile {
    /// Process-wide defaults.
    #[serde(default)]
    pub defaults: PolicyFileDefaults,
    /// Exact-match route overrides keyed by `"METHOD:path"`.
    #[serde(default)]
    pub paths: BTreeMap<String, PolicyOverride>,
}

impl PolicyFile {
    /// Parses a policy file from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyMisconfiguration` if the text is not a valid policy document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::policy(format!("invalid policy file: {e}")))
    }

    /// Reads a policy file from disk. A missing file yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyMisconfiguration` if the file exists but cannot be
    /// read or parsed.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)
                .map(Some)
                .map_err(|e| Error::policy(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::policy(format!(
                "failed to read policy file {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Resolves the effective policy for `(method, path)` pairs.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    defaults: MethodPolicy,
    bypass_methods: BTreeSet<String>,
    routes: HashMap<String, PolicyOverride>,
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new(MethodPolicy::default(), DEFAULT_BYPASS_METHODS.iter().copied())
    }
}

impl PolicyResolver {
    /// Creates a resolver with no route overrides.
    #[must_use]
    pub fn new<I, S>(defaults: MethodPolicy, bypass_methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            defaults,
            bypass_methods: bypass_methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
            routes: HashMap::new(),
        }
    }

    /// Layers a policy file over this resolver's defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyMisconfiguration` if a route key is malformed or
    /// any resulting policy has a zero timeout or TTL.
    pub fn with_file(mut self, file: &PolicyFile) -> Result<Self> {
        self.defaults = self.defaults.apply(&file.defaults.as_override());
        if let Some(list) = &file.defaults.bypass_methods {
            self.bypass_methods = list.methods();
        }

        for (route, patch) in &file.paths {
            let (method, path) = parse_route_key(route)?;
            self = self.with_route(&method, &path, patch.clone())?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Adds an exact-match override for `method` and `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyMisconfiguration` if the override yields a zero
    /// timeout or TTL.
    pub fn with_route(mut self, method: &str, path: &str, patch: PolicyOverride) -> Result<Self> {
        let key = route_key(method, path);
        self.defaults.apply(&patch).validate(&key)?;
        self.routes.insert(key, patch);
        Ok(self)
    }

    /// Returns the process-wide defaults.
    #[must_use]
    pub const fn defaults(&self) -> &MethodPolicy {
        &self.defaults
    }

    /// Returns the bypassed methods.
    #[must_use]
    pub const fn bypass_methods(&self) -> &BTreeSet<String> {
        &self.bypass_methods
    }

    /// Returns the number of route overrides.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Resolves the effective policy for a request.
    #[must_use]
    pub fn resolve(&self, method: &str, path: &str) -> MethodPolicy {
        let method = method.to_ascii_uppercase();
        let mut policy = self.defaults;
        if self.bypass_methods.contains(&method) {
            policy.enabled = false;
        }

        match self.routes.get(&route_key(&method, path)) {
            Some(patch) => policy.apply(patch),
            None => policy,
        }
    }

    /// Checks that the defaults and every route override yield positive
    /// timeouts and TTLs.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyMisconfiguration` naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        for (key, patch) in &self.routes {
            self.defaults.apply(patch).validate(key)?;
        }
        Ok(())
    }
}

/// Builds the lookup key for a route override.
#[must_use]
pub fn route_key(method: &str, path: &str) -> String {
    format!("{}:{}", method.to_ascii_uppercase(), path.to_lowercase())
}

/// Parses a `"GET;OPTIONS;"` style method list.
#[must_use]
pub fn parse_method_list(raw: &str) -> BTreeSet<String> {
    raw.split([';', ','])
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect()
}

fn parse_route_key(raw: &str) -> Result<(String, String)> {
    let (method, path) = raw
        .split_once(':')
        .ok_or_else(|| Error::policy(format!("route key {raw:?} must be METHOD:/path")))?;
    let method = method.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(Error::policy(format!(
            "route key {raw:?} has an invalid method"
        )));
    }
    if !path.starts_with('/') {
        return Err(Error::policy(format!(
            "route key {raw:?} must have a path starting with '/'"
        )));
    }
    Ok((method.to_string(), path.to_string()))
}
