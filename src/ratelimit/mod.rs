//! Sliding window admission logic.

pub mod clock;
pub mod engine;
mod limiter;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AdmissionArgs, AdmissionCode, BucketId, BucketSet, ADMISSION_ROUTINE};
pub use limiter::SlidingWindowLimiter;
pub use window::Window;
