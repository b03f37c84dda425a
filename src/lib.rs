//! Ratebridge - Distributed Rate Limit Coordination
//!
//! This crate lets many worker processes sharing one API client identity
//! respect a single remote rate limit budget. One authority process holds
//! the canonical bucket state; workers consult it over a request/reply
//! transport before and after every outbound HTTP call, serialize calls
//! per bucket, and react to 429s, server errors and invalid-request
//! accounting without ever exceeding the remote budget.

pub mod authority;
pub mod config;
pub mod error;
pub mod protocol;
pub mod routes;
pub mod transport;
pub mod worker;

pub use authority::Coordinator;
pub use config::{CoordinationConfig, RejectPolicy};
pub use error::{RatebridgeError, Result};
pub use worker::{ApiRequest, ApiResponse, RequestManager};
