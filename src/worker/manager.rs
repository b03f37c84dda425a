//! Worker-side request manager.
//!
//! Owns the per-bucket handler registry and the typed client for talking
//! to the coordinator. Everything here is disposable: the registry can be
//! rebuilt from scratch at any time without correctness loss, since all
//! authoritative state lives with the coordinator.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::handler::BucketHandler;
use super::perform::{ApiRequest, ApiResponse, Perform};
use crate::config::CoordinationConfig;
use crate::error::{RatebridgeError, Result};
use crate::protocol::{
    now_ms, CoordinatorReply, CoordinatorRequest, HandlerInfo, InvalidRequestSnapshot,
    RateLimitObservation, WireMessage, GLOBAL_MAJOR,
};
use crate::transport::Transport;

/// Typed request/reply client for the coordinator.
#[derive(Clone)]
pub struct CoordinatorClient {
    transport: Arc<dyn Transport>,
}

impl CoordinatorClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// The cached canonical hash for a route key, if the authority has
    /// learned one.
    pub async fn fetch_hash(&self, route_key: &str) -> Result<Option<String>> {
        let reply = self
            .transport
            .send(WireMessage::new(CoordinatorRequest::Hash {
                id: route_key.to_string(),
            }))
            .await?;
        match reply {
            CoordinatorReply::Hash { hash } => Ok(hash),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Current throttle state for a bucket.
    pub async fn fetch_info(&self, id: &str, hash: &str, route: &str) -> Result<HandlerInfo> {
        let reply = self
            .transport
            .send(WireMessage::new(CoordinatorRequest::Handler {
                id: id.to_string(),
                hash: hash.to_string(),
                route: route.to_string(),
            }))
            .await?;
        match reply {
            CoordinatorReply::Handler(info) => Ok(info),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Report an observed response's rate limit state.
    pub async fn update_info(
        &self,
        id: &str,
        hash: &str,
        method: &str,
        route: &str,
        data: RateLimitObservation,
    ) -> Result<()> {
        let reply = self
            .transport
            .send(WireMessage::new(CoordinatorRequest::Bucket {
                id: id.to_string(),
                hash: hash.to_string(),
                method: method.to_string(),
                route: route.to_string(),
                data,
            }))
            .await?;
        match reply {
            CoordinatorReply::Ack => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Record one invalid request and read back the window.
    pub async fn record_invalid(&self, id: &str) -> Result<InvalidRequestSnapshot> {
        let reply = self
            .transport
            .send(WireMessage::new(CoordinatorRequest::InvalidRequest {
                id: id.to_string(),
            }))
            .await?;
        match reply {
            CoordinatorReply::InvalidRequest(snapshot) => Ok(snapshot),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn unexpected_reply(reply: CoordinatorReply) -> RatebridgeError {
    RatebridgeError::Coordinator(format!("unexpected reply: {reply:?}"))
}

/// Entry point for one worker's outbound API calls.
pub struct RequestManager {
    coordinator: CoordinatorClient,
    performer: Arc<dyn Perform>,
    config: Arc<CoordinationConfig>,
    handlers: DashMap<String, Arc<BucketHandler>>,
}

impl RequestManager {
    /// Create a manager and start its registry sweeper.
    pub fn new(
        transport: Arc<dyn Transport>,
        performer: Arc<dyn Perform>,
        config: Arc<CoordinationConfig>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            coordinator: CoordinatorClient::new(transport),
            performer,
            config,
            handlers: DashMap::new(),
        });

        // The sweeper holds only a weak reference so dropping the last
        // manager handle also stops the task.
        let weak = Arc::downgrade(&manager);
        let interval = Duration::from_millis(manager.config.sweep_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.sweep(),
                    None => break,
                }
            }
        });

        manager
    }

    /// Execute one logical API call, serialized on its bucket.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let route_key = request.info.key(&request.method);
        let hash = self.coordinator.fetch_hash(&route_key).await?;

        // While the hash is unknown, calls share a conservative pseudo
        // bucket keyed only by the route; once a response teaches the real
        // hash, traffic re-partitions by major parameter.
        let (hash, major) = match hash {
            Some(hash) => (hash, request.info.major.clone()),
            None => (format!("Global({route_key})"), GLOBAL_MAJOR.to_string()),
        };
        let id = format!("{hash}:{major}");

        let handler = self
            .handlers
            .entry(id.clone())
            .or_insert_with(|| {
                trace!(id = %id, route = %request.info.route, "Creating bucket handler");
                Arc::new(BucketHandler::new(
                    id.clone(),
                    hash,
                    self.coordinator.clone(),
                    Arc::clone(&self.performer),
                    Arc::clone(&self.config),
                ))
            })
            .clone();

        handler.push(request).await
    }

    /// Drop handlers that have been idle past the inactive timeout.
    pub fn sweep(&self) {
        let cutoff = now_ms() - self.config.inactive_timeout as i64;
        let before = self.handlers.len();
        self.handlers
            .retain(|_, handler| !handler.inactive() || handler.last_active() > cutoff);
        let swept = before - self.handlers.len();
        if swept > 0 {
            debug!(swept, remaining = self.handlers.len(), "Swept inactive bucket handlers");
        }
    }

    /// Number of live bucket handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
