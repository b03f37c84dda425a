//! Worker-side request execution: queues, handlers and the manager.

mod handler;
mod manager;
mod perform;
mod queue;

pub use handler::BucketHandler;
pub use manager::{CoordinatorClient, RequestManager};
pub use perform::{ApiRequest, ApiResponse, HttpResponse, Perform, PerformError, ReqwestPerformer};
pub use queue::AsyncQueue;
