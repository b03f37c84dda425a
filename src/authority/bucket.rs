//! Per-bucket rate limit state.

use tracing::debug;

use crate::protocol::{calculate_reset, now_ms, remote_now_ms, RateLimitObservation};

/// Sentinel for "no value observed yet".
pub const UNKNOWN: i64 = -1;

/// Rate limit state for one bucket, identified by `hash:major`.
///
/// Created lazily on first reference with unknown values and mutated only
/// by the coordinator in response to worker reports.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Unique key, `<hash>:<major parameter>`.
    pub id: String,
    /// The API-assigned bucket hash; may change over the bucket's lifetime.
    pub hash: String,
    /// Normalized route template, kept for diagnostics.
    pub route: String,
    /// Max requests per window. `-1` unknown, `i64::MAX` unlimited.
    pub limit: i64,
    /// Requests left in the current window, `-1` unknown.
    pub remaining: i64,
    /// When `remaining` refills, in local-clock milliseconds.
    pub reset_at: i64,
    /// Last observed explicit retry delay in ms, `-1` when none.
    pub retry_after: i64,
}

/// Side effects of a bucket update that belong to the coordinator, not the
/// bucket: hash cache healing and the global throttle.
#[derive(Debug, Default)]
pub struct UpdateEffects {
    /// The bucket hash changed; the route-key mapping must be re-recorded.
    pub new_hash: Option<String>,
    /// The response signalled a global throttle for this many milliseconds.
    pub global_after: Option<i64>,
}

impl Bucket {
    pub fn new(id: impl Into<String>, hash: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            route: route.into(),
            limit: UNKNOWN,
            remaining: UNKNOWN,
            reset_at: UNKNOWN,
            retry_after: UNKNOWN,
        }
    }

    /// Whether the bucket is exhausted for the current window.
    ///
    /// A bucket with no observed constraint is never limited.
    pub fn limited(&self, now: i64) -> bool {
        self.remaining <= 0 && now < self.reset_at
    }

    /// How long a held request should wait before this bucket refills.
    pub fn timeout(&self, now: i64, request_offset: i64) -> i64 {
        (self.reset_at - now + request_offset).max(0)
    }

    /// Apply one observed response to this bucket's state.
    ///
    /// Absent `limit` means the route is unlimited, not unknown: the API
    /// omits the header entirely on unbucketed routes.
    pub fn update(&mut self, observation: &RateLimitObservation, reaction_window: i64) -> UpdateEffects {
        let mut effects = UpdateEffects::default();
        let date = observation.date.as_deref().unwrap_or("");

        self.limit = observation.limit.unwrap_or(i64::MAX);
        self.remaining = observation.remaining.unwrap_or(UNKNOWN);
        self.reset_at = match observation.reset {
            Some(reset) => calculate_reset(reset, date),
            None => now_ms(),
        };
        self.retry_after = observation.after_ms();

        // Buckets can be repartitioned by the API at any time; converge the
        // route-key mapping on the newly reported hash.
        if let Some(hash) = observation.hash.as_deref() {
            if hash != self.hash {
                debug!(
                    route = %self.route,
                    old_hash = %self.hash,
                    new_hash = %hash,
                    "Received a bucket hash update"
                );
                self.hash = hash.to_string();
                effects.new_hash = Some(hash.to_string());
            }
        }

        // Reaction routes enforce a materially shorter window than their
        // headers report. https://github.com/discord/discord-api-docs/issues/182
        if observation.reactions {
            self.reset_at = remote_now_ms(date) + reaction_window;
        }

        if observation.global {
            effects.global_after = Some(self.retry_after.max(0));
        }

        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(remaining: i64, reset_in_ms: i64, limit: i64) -> RateLimitObservation {
        RateLimitObservation {
            date: Some(chrono::Utc::now().to_rfc2822()),
            limit: Some(limit),
            remaining: Some(remaining),
            reset: Some((now_ms() + reset_in_ms) as f64 / 1000.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_bucket_is_not_limited() {
        let bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        assert_eq!(bucket.limit, UNKNOWN);
        assert_eq!(bucket.remaining, UNKNOWN);
        assert!(!bucket.limited(now_ms()));
    }

    #[test]
    fn test_exhausted_bucket_is_limited_until_reset() {
        let mut bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        bucket.update(&observation(0, 5_000, 5), 250);

        let now = now_ms();
        assert!(bucket.limited(now));
        let timeout = bucket.timeout(now, 500);
        assert!((4_500..7_000).contains(&timeout), "timeout was {timeout}");
        assert!(!bucket.limited(bucket.reset_at + 1));
    }

    #[test]
    fn test_update_replay_is_idempotent() {
        let mut a = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        let mut b = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        let updates = [
            observation(4, 3_000, 5),
            observation(3, 3_000, 5),
            observation(0, 2_000, 5),
        ];

        for update in &updates {
            a.update(update, 250);
        }
        for update in &updates {
            b.update(update, 250);
        }

        assert_eq!(a.limit, b.limit);
        assert_eq!(a.remaining, b.remaining);
        assert_eq!(a.reset_at, b.reset_at);
    }

    #[test]
    fn test_missing_limit_means_unlimited() {
        let mut bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        bucket.update(&RateLimitObservation::default(), 250);
        assert_eq!(bucket.limit, i64::MAX);
        assert_eq!(bucket.remaining, UNKNOWN);
        assert!(!bucket.limited(now_ms() + 1));
    }

    #[test]
    fn test_hash_change_is_reported() {
        let mut bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        let mut update = observation(4, 3_000, 5);
        update.hash = Some("efgh".to_string());

        let effects = bucket.update(&update, 250);
        assert_eq!(effects.new_hash.as_deref(), Some("efgh"));
        assert_eq!(bucket.hash, "efgh");

        // Same hash again is not a change.
        let effects = bucket.update(&update, 250);
        assert!(effects.new_hash.is_none());
    }

    #[test]
    fn test_reaction_route_forces_short_window() {
        let mut bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id/messages/:id/reactions/:reaction");
        let mut update = observation(0, 60_000, 1);
        update.reactions = true;

        bucket.update(&update, 250);
        let delta = bucket.reset_at - now_ms();
        assert!(delta <= 1_000, "reset delta was {delta}");
    }

    #[test]
    fn test_global_signal_carries_retry_after() {
        let mut bucket = Bucket::new("abcd:1234", "abcd", "/channels/:id");
        let mut update = observation(0, 1_000, 5);
        update.global = true;
        update.after = Some(2.0);

        let effects = bucket.update(&update, 250);
        assert_eq!(effects.global_after, Some(2_000));
    }
}
