//! Authority-side state: the coordinator and everything it owns.

mod bucket;
mod coordinator;
mod throttle;

pub use bucket::{Bucket, UpdateEffects, UNKNOWN};
pub use coordinator::Coordinator;
pub use throttle::{GlobalThrottle, InvalidRequestWindow};
