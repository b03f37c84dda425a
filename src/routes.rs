//! Route analysis: template normalization and major parameter extraction.
//!
//! The remote API partitions its rate limits by a normalized route template
//! plus a "major parameter", the resource id embedded in certain paths.
//! Everything here is pure string work on the concrete request path.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;

use crate::protocol::{now_ms, GLOBAL_MAJOR};

/// Epoch (ms) that resource ids count from.
const SNOWFLAKE_EPOCH: i64 = 1_420_070_400_000;

/// Messages older than this land in a separate deletion bucket.
const OLD_MESSAGE_THRESHOLD: i64 = 1000 * 60 * 60 * 24 * 14;

static MAJOR_PARAMETER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/(?:channels|guilds|webhooks)/(\d{16,19})").expect("major parameter regex")
});

static RESOURCE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{16,19}").expect("resource id regex"));

static REACTION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/reactions/.*").expect("reaction suffix regex"));

static TRAILING_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{16,19}$").expect("trailing id regex"));

/// The rate limit identity of one concrete request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// Normalized route template, ids replaced with placeholders.
    pub route: String,
    /// The major parameter, or `"global"` when the path has none.
    pub major: String,
    /// Whether the path targets a reactions sub-route.
    pub reactions: bool,
}

impl RouteInfo {
    /// Analyze a concrete path for the given method.
    pub fn parse(method: &Method, path: &str) -> Self {
        let major = MAJOR_PARAMETER
            .captures(path)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| GLOBAL_MAJOR.to_string());

        let mut route = RESOURCE_ID.replace_all(path, ":id").to_string();
        route = REACTION_SUFFIX.replace(&route, "/reactions/:reaction").to_string();

        // Deleting messages past a certain age hits a different, stricter
        // bucket than regular message deletion.
        if method == Method::DELETE && route == "/channels/:id/messages/:id" {
            if let Some(id) = TRAILING_ID.find(path) {
                if now_ms() - snowflake_timestamp_ms(id.as_str()) > OLD_MESSAGE_THRESHOLD {
                    route.push_str("/old-message");
                }
            }
        }

        let reactions = route.contains("reactions");
        Self {
            route,
            major,
            reactions,
        }
    }

    /// The cache key the coordinator stores canonical hashes under.
    pub fn key(&self, method: &Method) -> String {
        format!("{}:{}", method.as_str(), self.route)
    }
}

/// Creation time (ms since epoch) encoded in a resource id.
fn snowflake_timestamp_ms(id: &str) -> i64 {
    let id: i64 = id.parse().unwrap_or(0);
    (id >> 22) + SNOWFLAKE_EPOCH
}
