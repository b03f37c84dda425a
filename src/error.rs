//! Error types for Ratebridge operations.

use thiserror::Error;

/// Main error type for Ratebridge operations.
///
/// Every variant is local to one logical call and never corrupts shared
/// bucket state: a failed call still reports whatever rate limit headers it
/// received before failing.
#[derive(Error, Debug)]
pub enum RatebridgeError {
    /// Transport-level failure performing an HTTP call, after the retry
    /// budget was exhausted.
    #[error("Request to {method} {path} failed after {retries} retries: {source}")]
    Request {
        method: String,
        path: String,
        retries: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A rate limit was hit while the caller opted out of waiting, or the
    /// invalid-request threshold was exceeded.
    #[error("A {} rate limit was hit on route {route}", scope(.global))]
    RateLimited {
        /// Time until the limit ends, in milliseconds.
        timeout: i64,
        /// Maximum requests for the bucket, when known.
        limit: i64,
        method: String,
        path: String,
        route: String,
        global: bool,
    },

    /// Structured error payload from the remote API (4xx other than 429).
    #[error("API error {status} on {method} {path}: {}", payload_message(.payload))]
    Api {
        status: u16,
        method: String,
        path: String,
        /// The parsed error body as returned by the API.
        payload: serde_json::Value,
    },

    /// 5xx response that exhausted the retry budget.
    #[error("Server error {status} on {method} {path}")]
    Server {
        status: u16,
        method: String,
        path: String,
    },

    /// The coordinator did not reply, usually because the authority process
    /// is gone or the channel closed.
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratebridge operations.
pub type Result<T> = std::result::Result<T, RatebridgeError>;

fn scope(global: &bool) -> &'static str {
    if *global {
        "global"
    } else {
        "bucket"
    }
}

fn payload_message(payload: &serde_json::Value) -> String {
    match payload.get("message").and_then(|m| m.as_str()) {
        Some(message) => message.to_string(),
        None => payload.to_string(),
    }
}
