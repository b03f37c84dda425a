//! Wire protocol connecting worker pipelines to the coordinator.
//!
//! Messages are tagged with the protocol opcode so they can share a
//! transport with unrelated traffic; the coordinator silently drops
//! anything carrying a different opcode. The payload shapes mirror the
//! four coordinator operations as a closed enum, so an unhandled message
//! kind is a compile error rather than a silent fallthrough.

use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Opcode identifying traffic belonging to this protocol on a shared
/// transport.
pub const OP: &str = "RATEBRIDGE";

/// Placeholder major parameter used while a route's real hash is unknown.
pub const GLOBAL_MAJOR: &str = "global";

const HEADER_DATE: &str = "date";
const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";
const HEADER_BUCKET: &str = "x-ratelimit-bucket";
const HEADER_GLOBAL: &str = "x-ratelimit-global";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Clock skew between the remote API and this process, derived from the
/// response `date` header. Positive means the remote clock is ahead.
pub fn remote_offset_ms(date: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc2822(date).ok()?;
    Some(parsed.timestamp_millis() - now_ms())
}

/// The remote API's notion of "now", expressed on the local clock.
pub fn remote_now_ms(date: &str) -> i64 {
    now_ms() + remote_offset_ms(date).unwrap_or(0)
}

/// Convert a remote `reset` deadline (epoch seconds) into a deadline on the
/// local clock, corrected for clock skew.
pub fn calculate_reset(reset_epoch_secs: f64, date: &str) -> i64 {
    (reset_epoch_secs * 1000.0) as i64 - remote_offset_ms(date).unwrap_or(0)
}

/// Rate limit state observed in one HTTP response's headers.
///
/// This is the `data` payload of a `bucket` message. Absent headers stay
/// `None`; the coordinator decides the sentinel semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitObservation {
    /// The response `date` header, used for clock skew correction.
    pub date: Option<String>,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    /// Reset deadline in epoch seconds, as reported by the API.
    pub reset: Option<f64>,
    /// The bucket hash assigned by the API for this route.
    pub hash: Option<String>,
    /// Explicit retry delay in seconds, if the API sent one.
    pub after: Option<f64>,
    /// Whether the response signalled an API-wide throttle.
    pub global: bool,
    /// Whether the request hit a reactions sub-route.
    pub reactions: bool,
}

impl RateLimitObservation {
    /// Build an observation from response headers.
    pub fn from_headers(headers: &HeaderMap, reactions: bool) -> Self {
        Self {
            date: header_str(headers, HEADER_DATE),
            limit: header_parse(headers, HEADER_LIMIT),
            remaining: header_parse(headers, HEADER_REMAINING),
            reset: header_parse(headers, HEADER_RESET),
            hash: header_str(headers, HEADER_BUCKET),
            after: header_parse(headers, HEADER_RETRY_AFTER),
            global: headers.contains_key(HEADER_GLOBAL),
            reactions,
        }
    }

    /// The explicit retry delay in milliseconds, `-1` when none was sent.
    pub fn after_ms(&self) -> i64 {
        match self.after {
            Some(after) => (after * 1000.0) as i64,
            None => -1,
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn header_parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// A request to the coordinator, dispatched on its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorRequest {
    /// Look up the cached canonical hash for a route key.
    Hash { id: String },
    /// Read a bucket's throttle state, creating the bucket if absent.
    Handler {
        id: String,
        hash: String,
        route: String,
    },
    /// Apply an observed rate limit update to a bucket.
    Bucket {
        id: String,
        hash: String,
        method: String,
        route: String,
        data: RateLimitObservation,
    },
    /// Record an invalid request (401/403/429) against the rolling window.
    InvalidRequest { id: String },
}

/// An opcode-tagged request envelope as it travels on the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub op: String,
    #[serde(flatten)]
    pub request: CoordinatorRequest,
}

impl WireMessage {
    /// Wrap a request with this protocol's opcode.
    pub fn new(request: CoordinatorRequest) -> Self {
        Self {
            op: OP.to_string(),
            request,
        }
    }
}

/// Throttle state for one bucket, as replied to a `handler` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    /// Max requests per window, `-1` when unknown.
    pub limit: i64,
    /// Requests left in the current window, `-1` when unknown.
    pub remaining: i64,
    /// Whether the bucket itself is exhausted for the current window.
    pub limited: bool,
    /// How long a held request should wait, in milliseconds.
    pub timeout: i64,
    /// Whether the API-wide global throttle is active.
    pub global: bool,
    /// Remaining invalid-request window, 0 when the window is idle.
    pub invalid_request_timeout: i64,
    /// Invalid requests recorded in the current window.
    pub invalid_request_count: u64,
}

/// Snapshot of the invalid-request window, as replied to an
/// `invalidRequest` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InvalidRequestSnapshot {
    /// Invalid requests recorded in the current window.
    pub count: u64,
    /// Absolute time (ms) when the window resets.
    pub reset: i64,
}

/// A coordinator reply, correlated to the request that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorReply {
    Hash { hash: Option<String> },
    Handler(HandlerInfo),
    /// Acknowledgement for a `bucket` update.
    Ack,
    InvalidRequest(InvalidRequestSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_observation_from_headers() {
        let now = chrono::Utc::now();
        let date = now.to_rfc2822();
        let map = headers(&[
            ("date", date.as_str()),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1700000000.5"),
            ("x-ratelimit-bucket", "abcd1234"),
            ("retry-after", "2"),
        ]);

        let observation = RateLimitObservation::from_headers(&map, false);
        assert_eq!(observation.limit, Some(5));
        assert_eq!(observation.remaining, Some(0));
        assert_eq!(observation.reset, Some(1_700_000_000.5));
        assert_eq!(observation.hash.as_deref(), Some("abcd1234"));
        assert_eq!(observation.after_ms(), 2000);
        assert!(!observation.global);
    }

    #[test]
    fn test_observation_missing_headers() {
        let observation = RateLimitObservation::from_headers(&HeaderMap::new(), true);
        assert!(observation.limit.is_none());
        assert!(observation.hash.is_none());
        assert_eq!(observation.after_ms(), -1);
        assert!(observation.reactions);
    }

    #[test]
    fn test_global_flag_from_header_presence() {
        let map = headers(&[("x-ratelimit-global", "true")]);
        let observation = RateLimitObservation::from_headers(&map, false);
        assert!(observation.global);
    }

    #[test]
    fn test_calculate_reset_corrects_skew() {
        // A remote clock running 5 seconds ahead should pull the local
        // deadline 5 seconds earlier.
        let ahead = chrono::Utc::now() + chrono::Duration::seconds(5);
        let reset_secs = (now_ms() as f64 + 10_000.0) / 1000.0;
        let reset = calculate_reset(reset_secs, &ahead.to_rfc2822());
        let delta = reset - now_ms();
        assert!((4_000..6_500).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn test_calculate_reset_unparseable_date() {
        let reset_secs = (now_ms() as f64 + 10_000.0) / 1000.0;
        let reset = calculate_reset(reset_secs, "not a date");
        let delta = reset - now_ms();
        assert!((9_000..11_000).contains(&delta), "delta was {delta}");
    }

    #[test]
    fn test_wire_message_json_shape() {
        let message = WireMessage::new(CoordinatorRequest::Hash {
            id: "GET:/channels/:id".to_string(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["op"], OP);
        assert_eq!(json["type"], "hash");
        assert_eq!(json["id"], "GET:/channels/:id");
    }

    #[test]
    fn test_wire_message_roundtrip() {
        let message = WireMessage::new(CoordinatorRequest::Bucket {
            id: "abcd:1234".to_string(),
            hash: "abcd".to_string(),
            method: "GET".to_string(),
            route: "/channels/:id".to_string(),
            data: RateLimitObservation {
                limit: Some(5),
                global: true,
                ..Default::default()
            },
        });
        let json = serde_json::to_string(&message).unwrap();
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        match decoded.request {
            CoordinatorRequest::Bucket { id, data, .. } => {
                assert_eq!(id, "abcd:1234");
                assert_eq!(data.limit, Some(5));
                assert!(data.global);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
