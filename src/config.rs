//! Configuration management for Ratebridge.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Context handed to the reject policy when a rate limit would force a wait.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// Time until the limit ends, in milliseconds.
    pub timeout: i64,
    /// Maximum requests for the bucket, when known.
    pub limit: i64,
    /// HTTP method of the held request.
    pub method: String,
    /// Concrete path of the held request.
    pub path: String,
    /// Normalized route template of the held request.
    pub route: String,
    /// Whether the limit is the API-wide global throttle.
    pub global: bool,
}

/// Decides whether a rate limited call waits out the throttle or fails fast
/// with a rate limit error.
#[derive(Clone, Default)]
pub enum RejectPolicy {
    /// Always wait out the throttle (the default).
    #[default]
    Wait,
    /// Fail fast when the route template starts with any of these prefixes.
    Routes(Vec<String>),
    /// Fail fast when the predicate returns true for the held request.
    Predicate(Arc<dyn Fn(&RateLimitInfo) -> bool + Send + Sync>),
}

impl RejectPolicy {
    /// Evaluate the policy against a held request.
    pub fn should_reject(&self, info: &RateLimitInfo) -> bool {
        match self {
            RejectPolicy::Wait => false,
            RejectPolicy::Routes(prefixes) => prefixes
                .iter()
                .any(|prefix| info.route.starts_with(&prefix.to_lowercase())),
            RejectPolicy::Predicate(predicate) => predicate(info),
        }
    }
}

impl fmt::Debug for RejectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectPolicy::Wait => write!(f, "RejectPolicy::Wait"),
            RejectPolicy::Routes(routes) => write!(f, "RejectPolicy::Routes({routes:?})"),
            RejectPolicy::Predicate(_) => write!(f, "RejectPolicy::Predicate(..)"),
        }
    }
}

/// Main configuration for the rate limit coordination layer.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// TTL from last access for cached hashes, buckets and idle worker
    /// handlers.
    #[serde(default = "default_inactive_timeout")]
    pub inactive_timeout: u64,

    /// Interval at which workers sweep inactive handlers out of their
    /// registry.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Extra margin added on top of computed wait times before a held
    /// request resumes.
    #[serde(default = "default_request_offset")]
    pub request_offset: i64,

    /// Transport/5xx retry budget per logical call.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Forced reset window for reaction routes, which the API under-reports.
    #[serde(default = "default_reaction_window")]
    pub reaction_window: i64,

    /// Length of the rolling invalid-request accounting window.
    #[serde(default = "default_invalid_request_window")]
    pub invalid_request_window: i64,

    /// When set, calls fail fast (or self-throttle before performing) once
    /// the invalid-request count in the current window exceeds this amount.
    #[serde(default)]
    pub invalid_request_reject_on_amount: Option<u64>,

    /// Emit a warning every N invalid requests; 0 disables the warnings.
    #[serde(default = "default_invalid_request_warning_interval")]
    pub invalid_request_warning_interval: u64,

    /// Size cap for the authority's hash cache and bucket table.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Wait vs. fail-fast policy for rate limited calls. Programmatic only.
    #[serde(skip)]
    pub reject_on_rate_limit: RejectPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            inactive_timeout: default_inactive_timeout(),
            sweep_interval: default_sweep_interval(),
            request_offset: default_request_offset(),
            retry_limit: default_retry_limit(),
            reaction_window: default_reaction_window(),
            invalid_request_window: default_invalid_request_window(),
            invalid_request_reject_on_amount: None,
            invalid_request_warning_interval: default_invalid_request_warning_interval(),
            cache_capacity: default_cache_capacity(),
            reject_on_rate_limit: RejectPolicy::Wait,
        }
    }
}

fn default_inactive_timeout() -> u64 {
    240_000
}

fn default_sweep_interval() -> u64 {
    120_000
}

fn default_request_offset() -> i64 {
    500
}

fn default_retry_limit() -> u32 {
    1
}

fn default_reaction_window() -> i64 {
    250
}

fn default_invalid_request_window() -> i64 {
    600_000
}

fn default_invalid_request_warning_interval() -> u64 {
    500
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl CoordinationConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: CoordinationConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::RatebridgeError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Replace the reject policy.
    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_on_rate_limit = policy;
        self
    }
}
