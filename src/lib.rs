//! Slidegate - Sliding Window Admission Control
//!
//! This crate decides whether an event for a key is admitted, based on how many
//! events that key accumulated within a trailing window. Bucket state lives in a
//! shared key-value store and every decision runs there as one atomic routine,
//! so concurrent callers on the same key cannot race past the threshold.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use crate::config::{LimiterConfig, Settings};
pub use crate::error::{Result, SlidegateError};
pub use crate::ratelimit::SlidingWindowLimiter;
pub use crate::store::{MemoryStore, RedisStore, Store};
