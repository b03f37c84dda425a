//! The authority-side coordinator.
//!
//! Single point of serialization for all rate limit state: the hash cache,
//! the bucket table, the global throttle and the invalid-request window.
//! Messages are dispatched one at a time, so no worker ever observes a
//! half-applied update.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::bucket::Bucket;
use super::throttle::{GlobalThrottle, InvalidRequestWindow};
use crate::config::CoordinationConfig;
use crate::protocol::{
    now_ms, CoordinatorReply, CoordinatorRequest, HandlerInfo, InvalidRequestSnapshot,
    RateLimitObservation, WireMessage, OP,
};
use crate::transport::{channel, ChannelTransport, MessageReceiver};

/// Governs the shared rate limit state for every worker.
pub struct Coordinator {
    config: Arc<CoordinationConfig>,
    /// Route-key (`method:route`) to canonical bucket hash.
    hashes: Cache<String, String>,
    /// Bucket id (`hash:major`) to bucket state.
    buckets: Cache<String, Arc<Mutex<Bucket>>>,
    global: Mutex<GlobalThrottle>,
    invalid: Mutex<InvalidRequestWindow>,
}

impl Coordinator {
    pub fn new(config: Arc<CoordinationConfig>) -> Self {
        let ttl = Duration::from_millis(config.inactive_timeout);
        Self {
            hashes: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_idle(ttl)
                .build(),
            buckets: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_idle(ttl)
                .build(),
            global: Mutex::new(GlobalThrottle::new()),
            invalid: Mutex::new(InvalidRequestWindow::new(config.invalid_request_window)),
            config,
        }
    }

    /// Construct a coordinator and serve it on an in-process channel.
    ///
    /// Returns the worker-side transport; the serve loop runs until every
    /// transport clone is dropped.
    pub fn spawn(config: Arc<CoordinationConfig>) -> (Arc<Self>, ChannelTransport) {
        let (transport, rx) = channel(128);
        let coordinator = Arc::new(Self::new(config));
        tokio::spawn(Arc::clone(&coordinator).serve(rx));
        (coordinator, transport)
    }

    /// Process messages until the channel closes.
    pub async fn serve(self: Arc<Self>, mut rx: MessageReceiver) {
        info!("Coordinator serving rate limit state");
        while let Some(envelope) = rx.recv().await {
            if let Some(reply) = self.dispatch(envelope.message) {
                // A worker that went away mid-request is not our problem.
                let _ = envelope.reply.send(reply);
            }
        }
        info!("Coordinator channel closed, stopping");
    }

    /// Handle one message atomically. Returns `None` for messages that do
    /// not carry this protocol's opcode; the transport may be multiplexed
    /// with unrelated traffic.
    pub fn dispatch(&self, message: WireMessage) -> Option<CoordinatorReply> {
        if message.op != OP {
            trace!(op = %message.op, "Ignoring message with foreign opcode");
            return None;
        }
        let reply = match message.request {
            CoordinatorRequest::Hash { id } => CoordinatorReply::Hash {
                hash: self.resolve_hash(&id),
            },
            CoordinatorRequest::Handler { id, hash, route } => {
                CoordinatorReply::Handler(self.handler_info(&id, &hash, &route))
            }
            CoordinatorRequest::Bucket {
                id,
                hash,
                method,
                route,
                data,
            } => {
                self.apply_update(&id, &hash, &method, &route, &data);
                CoordinatorReply::Ack
            }
            CoordinatorRequest::InvalidRequest { id } => {
                CoordinatorReply::InvalidRequest(self.record_invalid(&id))
            }
        };
        Some(reply)
    }

    /// The cached canonical hash for a route key, if one has been learned.
    pub fn resolve_hash(&self, route_key: &str) -> Option<String> {
        self.hashes.get(route_key)
    }

    fn record_hash(&self, route_key: String, hash: String) {
        self.hashes.insert(route_key, hash);
    }

    /// Milliseconds until the global throttle lifts, 0 when inactive.
    pub fn global_timeout(&self) -> i64 {
        self.global.lock().remaining(now_ms())
    }

    /// Look up a bucket, creating it with unknown state on first reference.
    fn bucket(&self, id: &str, hash: &str, route: &str) -> Arc<Mutex<Bucket>> {
        self.buckets.get_with_by_ref(id, || {
            debug!(id = %id, route = %route, "Creating bucket");
            Arc::new(Mutex::new(Bucket::new(id, hash, route)))
        })
    }

    /// Compute the throttle state a worker must respect before calling out
    /// on this bucket.
    pub fn handler_info(&self, id: &str, hash: &str, route: &str) -> HandlerInfo {
        let now = now_ms();
        let bucket = self.bucket(id, hash, route);
        let bucket = bucket.lock();

        let global_timeout = self.global.lock().remaining(now);
        let global = global_timeout > 0;
        let timeout = if global {
            global_timeout
        } else {
            bucket.timeout(now, self.config.request_offset)
        };
        let (invalid_request_count, invalid_request_timeout) = self.invalid.lock().snapshot(now);

        HandlerInfo {
            limit: bucket.limit,
            remaining: bucket.remaining,
            limited: bucket.limited(now),
            timeout,
            global,
            invalid_request_timeout,
            invalid_request_count,
        }
    }

    /// Apply an observed response to the bucket and to any cross-bucket
    /// state it carries.
    pub fn apply_update(
        &self,
        id: &str,
        hash: &str,
        method: &str,
        route: &str,
        observation: &RateLimitObservation,
    ) {
        let bucket = self.bucket(id, hash, route);
        let effects = bucket.lock().update(observation, self.config.reaction_window);

        if let Some(new_hash) = effects.new_hash {
            self.record_hash(format!("{method}:{route}"), new_hash);
        }
        if let Some(after) = effects.global_after {
            debug!(after_ms = after, "Global rate limit signalled, halting all requests");
            self.global.lock().activate(now_ms(), after);
        }
    }

    /// Record one invalid request against the rolling window.
    pub fn record_invalid(&self, id: &str) -> InvalidRequestSnapshot {
        let snapshot = self.invalid.lock().record(now_ms());
        trace!(
            id = %id,
            count = snapshot.count,
            "Recorded invalid request"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(CoordinationConfig::default()))
    }

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
    fn test_fresh_bucket_reports_unlimited() {
        let coordinator = coordinator();
        let info = coordinator.handler_info("abcd:1234", "abcd", "/channels/:id");
        assert_eq!(info.limit, -1);
        assert_eq!(info.remaining, -1);
        assert!(!info.limited);
        assert!(!info.global);
        assert_eq!(info.timeout, 0);
    }

    #[test]
    fn test_update_then_query_is_limited() {
        let coordinator = coordinator();
        coordinator.apply_update(
            "abcd:1234",
            "abcd",
            "GET",
            "/channels/:id",
            &observation(0, 5_000, 5),
        );

        let info = coordinator.handler_info("abcd:1234", "abcd", "/channels/:id");
        assert!(info.limited);
        assert_eq!(info.limit, 5);
        assert_eq!(info.remaining, 0);
        // timeout ≈ reset delta + request offset
        assert!((4_500..7_000).contains(&info.timeout), "timeout was {}", info.timeout);
    }

    #[test]
    fn test_limited_survives_other_message_types() {
        let coordinator = coordinator();
        coordinator.apply_update(
            "abcd:1234",
            "abcd",
            "GET",
            "/channels/:id",
            &observation(0, 5_000, 5),
        );

        // Unrelated traffic between queries must not disturb the bucket.
        coordinator.resolve_hash("GET:/users/@me");
        coordinator.record_invalid("abcd:1234");

        let info = coordinator.handler_info("abcd:1234", "abcd", "/channels/:id");
        assert!(info.limited);
    }

    #[test]
    fn test_hash_remap_converges() {
        let coordinator = coordinator();
        let mut update = observation(4, 3_000, 5);
        update.hash = Some("h1".to_string());
        coordinator.apply_update("h1:1234", "h1", "GET", "/channels/:id", &update);
        assert_eq!(coordinator.resolve_hash("GET:/channels/:id"), None);

        update.hash = Some("h2".to_string());
        coordinator.apply_update("h1:1234", "h1", "GET", "/channels/:id", &update);
        assert_eq!(
            coordinator.resolve_hash("GET:/channels/:id").as_deref(),
            Some("h2")
        );
    }

    #[test]
    fn test_global_update_overrides_bucket_timeout() {
        let coordinator = coordinator();
        let mut update = observation(3, 1_000, 5);
        update.global = true;
        update.after = Some(3.0);
        coordinator.apply_update("abcd:1234", "abcd", "GET", "/channels/:id", &update);

        assert!(coordinator.global_timeout() > 0);
        let info = coordinator.handler_info("efgh:9999", "efgh", "/guilds/:id");
        assert!(info.global);
        assert!((2_000..=3_000).contains(&info.timeout), "timeout was {}", info.timeout);
    }

    #[test]
    fn test_dispatch_ignores_foreign_opcode() {
        let coordinator = coordinator();
        let mut message = WireMessage::new(CoordinatorRequest::InvalidRequest {
            id: "abcd:1234".to_string(),
        });
        message.op = "SOMETHING_ELSE".to_string();

        assert!(coordinator.dispatch(message).is_none());
        // The foreign message must not have touched the window.
        let info = coordinator.handler_info("abcd:1234", "abcd", "/channels/:id");
        assert_eq!(info.invalid_request_count, 0);
    }

    #[test]
    fn test_dispatch_hash_roundtrip() {
        let coordinator = coordinator();
        let reply = coordinator
            .dispatch(WireMessage::new(CoordinatorRequest::Hash {
                id: "GET:/channels/:id".to_string(),
            }))
            .unwrap();
        assert!(matches!(reply, CoordinatorReply::Hash { hash: None }));
    }

    #[test]
    fn test_invalid_request_counts_accumulate() {
        let coordinator = coordinator();
        assert_eq!(coordinator.record_invalid("a").count, 1);
        assert_eq!(coordinator.record_invalid("b").count, 2);
        assert_eq!(coordinator.record_invalid("c").count, 3);

        let info = coordinator.handler_info("abcd:1234", "abcd", "/channels/:id");
        assert_eq!(info.invalid_request_count, 3);
        assert!(info.invalid_request_timeout > 0);
    }

    #[tokio::test]
    async fn test_serve_replies_over_channel() {
        use crate::transport::Transport;

        let (coordinator, transport) = Coordinator::spawn(Arc::new(CoordinationConfig::default()));
        coordinator.apply_update(
            "abcd:1234",
            "abcd",
            "GET",
            "/channels/:id",
            &observation(0, 5_000, 5),
        );

        let reply = transport
            .send(WireMessage::new(CoordinatorRequest::Handler {
                id: "abcd:1234".to_string(),
                hash: "abcd".to_string(),
                route: "/channels/:id".to_string(),
            }))
            .await
            .unwrap();
        match reply {
            CoordinatorReply::Handler(info) => assert!(info.limited),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
