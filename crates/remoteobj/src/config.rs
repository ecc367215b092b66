//! Handle configuration and attribute access policy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::codec::{Codec, JsonCodec};
use crate::error::Fault;

/// Filters attribute names before they reach a live object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub hide_private: bool,
    pub denied: BTreeSet<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            hide_private: true,
            denied: BTreeSet::new(),
        }
    }
}

impl AccessPolicy {
    /// No filtering at all.
    pub fn open() -> Self {
        Self {
            hide_private: false,
            denied: BTreeSet::new(),
        }
    }

    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.denied.insert(name.into());
        self
    }

    pub fn check(&self, name: &str) -> Result<(), Fault> {
        if (self.hide_private && name.starts_with('_')) || self.denied.contains(name) {
            return Err(Fault::permission(format!(
                "access to attribute '{name}' is not allowed"
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HandleConfig {
    /// Pause between drains of the service loop.
    pub poll_interval: Duration,
    /// Report unencodable results to the caller and stop the loop instead of
    /// replying null.
    pub strict_encoding: bool,
    /// Resolve on every `apply`.
    pub eager: bool,
    /// Returned by `resolve()` when no service loop is listening.
    pub default: Option<Value>,
    pub access: AccessPolicy,
    pub codec: Arc<dyn Codec>,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleConfig {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            strict_encoding: false,
            eager: false,
            default: None,
            access: AccessPolicy::default(),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Defaults with `REMOTEOBJ_POLL_INTERVAL_MS` and `REMOTEOBJ_STRICT_ENCODING`
    /// applied.
    pub fn from_env() -> Self {
        Self::new().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("REMOTEOBJ_POLL_INTERVAL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.poll_interval = Duration::from_millis(ms),
                Err(e) => tracing::warn!(
                    value = %raw,
                    error = %e,
                    "Ignoring invalid REMOTEOBJ_POLL_INTERVAL_MS"
                ),
            }
        }
        if let Some(raw) = lookup("REMOTEOBJ_STRICT_ENCODING") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => self.strict_encoding = true,
                "0" | "false" | "" => self.strict_encoding = false,
                _ => tracing::warn!(value = %raw, "Ignoring invalid REMOTEOBJ_STRICT_ENCODING"),
            }
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_strict_encoding(mut self, strict: bool) -> Self {
        self.strict_encoding = strict;
        self
    }

    pub fn with_eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }
}

impl std::fmt::Debug for HandleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleConfig")
            .field("poll_interval", &self.poll_interval)
            .field("strict_encoding", &self.strict_encoding)
            .field("eager", &self.eager)
            .field("default", &self.default)
            .field("access", &self.access)
            .field("codec", &self.codec.name())
            .finish()
    }
}
