//! Store capability consumed by the limiter.
//!
//! A store runs a named routine atomically against a single key. Restricting
//! each call to one key keeps the contract usable on partitioned stores such as
//! Redis Cluster, where a script may only touch keys in one slot.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while reaching a store or running a routine on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unknown routine: {0}")]
    UnknownRoutine(String),
}

/// A server-side routine, identified by name and carrying its script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Routine {
    name: &'static str,
    source: &'static str,
}

impl Routine {
    /// Declare a routine.
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    /// Identifier of the routine.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Script body, for stores that execute scripts.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// What a routine returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// An integer reply
    Integer(i64),
    /// A string reply
    Text(String),
    /// No value
    Nil,
    /// Any other shape, rendered for diagnostics
    Other(String),
}

/// Atomic keyed execution.
///
/// Implementations must run `routine` as one indivisible unit with respect to
/// every other `eval` on the same `key`. Calls on different keys need not
/// exclude each other.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run `routine` against `key` with positional arguments.
    async fn eval(&self, routine: &Routine, key: &str, argv: &[String]) -> Result<Reply, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn eval(&self, routine: &Routine, key: &str, argv: &[String]) -> Result<Reply, StoreError> {
        (**self).eval(routine, key, argv).await
    }
}
