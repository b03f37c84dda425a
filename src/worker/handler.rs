//! Per-bucket request execution pipeline.
//!
//! One handler exists per `hash:major` bucket. Its queue admits one call
//! at a time in FIFO order; the pipeline then resolves throttle state with
//! the coordinator, performs the exchange, reports the observed headers
//! back, and decides between returning, retrying and failing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::manager::CoordinatorClient;
use super::perform::{ApiRequest, ApiResponse, Perform};
use super::queue::AsyncQueue;
use crate::config::{CoordinationConfig, RateLimitInfo};
use crate::error::{RatebridgeError, Result};
use crate::protocol::{now_ms, HandlerInfo, RateLimitObservation};

/// Extra sleep added on top of an unexpected 429's retry-after, covering
/// the margin by which the local prediction was off.
const RATE_LIMIT_SAFETY_MARGIN_MS: i64 = 500;

/// Stand-in delay for a 429 that arrives without a `retry-after` header,
/// so a header-stripping proxy cannot induce a tight retry loop.
const MISSING_RETRY_AFTER_MS: i64 = 1_000;

/// Executes requests for one bucket, strictly serialized.
pub struct BucketHandler {
    /// Bucket id, `<hash>:<major parameter>`.
    pub id: String,
    /// The bucket hash this handler was created under.
    pub hash: String,
    coordinator: CoordinatorClient,
    performer: Arc<dyn Perform>,
    config: Arc<CoordinationConfig>,
    queue: AsyncQueue,
    /// Last push or completion, in ms; drives registry sweeping.
    last_active: AtomicI64,
}

impl BucketHandler {
    pub fn new(
        id: String,
        hash: String,
        coordinator: CoordinatorClient,
        performer: Arc<dyn Perform>,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            id,
            hash,
            coordinator,
            performer,
            config,
            queue: AsyncQueue::new(),
            last_active: AtomicI64::new(now_ms()),
        }
    }

    /// Whether nothing is queued or running on this handler.
    pub fn inactive(&self) -> bool {
        self.queue.is_idle()
    }

    /// Last time this handler was touched, in ms.
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Queue a request behind the bucket's in-flight calls and execute it
    /// once admitted.
    ///
    /// The pipeline runs on its own task: dropping the returned future
    /// (a caller-side timeout, say) detaches the call instead of aborting
    /// it, so the remote exchange still completes, its headers are still
    /// reported, and the queue slot is still released.
    pub async fn push(self: Arc<Self>, request: ApiRequest) -> Result<ApiResponse> {
        self.last_active.store(now_ms(), Ordering::Relaxed);
        let handler = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let mut request = request;
            handler.queue.wait().await;
            let result = handler.execute(&mut request).await;
            handler.queue.shift();
            handler.last_active.store(now_ms(), Ordering::Relaxed);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(err) => Err(RatebridgeError::Coordinator(format!(
                "request task failed: {err}"
            ))),
        }
    }

    async fn execute(&self, request: &mut ApiRequest) -> Result<ApiResponse> {
        // The outer loop re-resolves throttle state; the inner loop retries
        // the exchange itself. A 429 re-enters the outer loop, transport
        // failures and 5xx stay in the inner one. The bucket assignment
        // never changes across retries of the same logical call.
        'call: loop {
            let info = self
                .coordinator
                .fetch_info(&self.id, &self.hash, &request.info.route)
                .await?;

            if info.global || info.limited {
                debug!(
                    method = %request.method,
                    route = %request.info.route,
                    hash = %self.hash,
                    timeout = info.timeout,
                    global = info.global,
                    "Rate limit reached, holding request"
                );
                self.check_reject(request, &info)?;
                sleep(Duration::from_millis(info.timeout.max(0) as u64)).await;
            }

            if info.invalid_request_timeout > 0 {
                if let Some(threshold) = self.config.invalid_request_reject_on_amount {
                    if info.invalid_request_count > threshold {
                        warn!(
                            count = info.invalid_request_count,
                            timeout = info.invalid_request_timeout,
                            "Too many invalid requests in the current window, waiting out the reset"
                        );
                        sleep(Duration::from_millis(info.invalid_request_timeout as u64)).await;
                        continue 'call;
                    }
                }
            }

            loop {
                let response = match self.performer.perform(request).await {
                    Ok(response) => response,
                    Err(source) => {
                        if request.retries >= self.config.retry_limit {
                            return Err(RatebridgeError::Request {
                                method: request.method.to_string(),
                                path: request.path.clone(),
                                retries: request.retries,
                                source,
                            });
                        }
                        request.retries += 1;
                        continue;
                    }
                };

                // Report whatever the response taught us, success or not;
                // this is how the shared state stays current.
                let observation =
                    RateLimitObservation::from_headers(&response.headers, request.info.reactions);
                let after_ms = observation.after_ms();
                if !response.headers.is_empty() {
                    self.coordinator
                        .update_info(
                            &self.id,
                            &self.hash,
                            request.method.as_str(),
                            &request.info.route,
                            observation,
                        )
                        .await?;
                }

                if response.is_ok() {
                    return response.parse().map_err(|err| RatebridgeError::Request {
                        method: request.method.to_string(),
                        path: request.path.clone(),
                        retries: request.retries,
                        source: Box::new(err),
                    });
                }

                let status = response.status;
                if status == 401 || status == 403 || status == 429 {
                    let snapshot = self.coordinator.record_invalid(&self.id).await?;
                    let interval = self.config.invalid_request_warning_interval;
                    if interval > 0 && snapshot.count % interval == 0 {
                        warn!(
                            count = snapshot.count,
                            remaining_ms = snapshot.reset - now_ms(),
                            "Invalid request count is approaching the ban threshold"
                        );
                    }
                    if let Some(threshold) = self.config.invalid_request_reject_on_amount {
                        if snapshot.count > threshold {
                            return Err(RatebridgeError::RateLimited {
                                timeout: (snapshot.reset - now_ms()).max(0),
                                limit: threshold as i64,
                                method: request.method.to_string(),
                                path: request.path.clone(),
                                route: request.info.route.clone(),
                                global: false,
                            });
                        }
                    }
                }

                if status == 429 {
                    // The local throttle logic under-predicted.
                    let after = if after_ms < 0 {
                        warn!(
                            route = %request.info.route,
                            method = %request.method,
                            id = %self.id,
                            "Encountered 429 without a retry-after header"
                        );
                        MISSING_RETRY_AFTER_MS
                    } else {
                        warn!(
                            route = %request.info.route,
                            method = %request.method,
                            id = %self.id,
                            after_ms,
                            "Encountered unexpected 429 rate limit"
                        );
                        after_ms
                    };
                    sleep(Duration::from_millis(
                        (after + RATE_LIMIT_SAFETY_MARGIN_MS) as u64,
                    ))
                    .await;
                    // Not counted against the retry budget.
                    continue 'call;
                }

                if (400..500).contains(&status) {
                    let payload = match response.parse() {
                        Ok(ApiResponse::Json(value)) => value,
                        Ok(_) => serde_json::Value::Null,
                        Err(err) => {
                            return Err(RatebridgeError::Request {
                                method: request.method.to_string(),
                                path: request.path.clone(),
                                retries: request.retries,
                                source: Box::new(err),
                            })
                        }
                    };
                    return Err(RatebridgeError::Api {
                        status,
                        method: request.method.to_string(),
                        path: request.path.clone(),
                        payload,
                    });
                }

                if (500..600).contains(&status) {
                    if request.retries >= self.config.retry_limit {
                        return Err(RatebridgeError::Server {
                            status,
                            method: request.method.to_string(),
                            path: request.path.clone(),
                        });
                    }
                    request.retries += 1;
                    continue;
                }

                // Statuses outside 200..=599 carry nothing usable.
                return Ok(ApiResponse::Empty);
            }
        }
    }

    /// Fail fast instead of waiting when the configured reject policy
    /// matches the held request.
    fn check_reject(&self, request: &ApiRequest, info: &HandlerInfo) -> Result<()> {
        let rate_limit = RateLimitInfo {
            timeout: info.timeout,
            limit: info.limit,
            method: request.method.to_string(),
            path: request.path.clone(),
            route: request.info.route.clone(),
            global: info.global,
        };
        if self.config.reject_on_rate_limit.should_reject(&rate_limit) {
            return Err(RatebridgeError::RateLimited {
                timeout: rate_limit.timeout,
                limit: rate_limit.limit,
                method: rate_limit.method,
                path: rate_limit.path,
                route: rate_limit.route,
                global: rate_limit.global,
            });
        }
        Ok(())
    }
}
