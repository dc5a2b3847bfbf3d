//! Client-side entry point for admission checks.

use std::sync::Arc;

use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::engine::{AdmissionArgs, AdmissionCode, ADMISSION_ROUTINE};
use super::window::{duration_secs, Window};
use crate::config::LimiterConfig;
use crate::error::{Result, SlidegateError};
use crate::store::{Reply, Store, StoreError};

/// A sliding window limiter whose state lives in a [`Store`].
///
/// The limiter holds no bucket state of its own. Every call is one round trip
/// that runs the admission routine atomically in the store, so any number of
/// limiters (in any number of processes) can share a store safely.
///
/// Errors are never turned into a decision: callers choose whether to fail
/// open or closed.
pub struct SlidingWindowLimiter<S> {
    store: S,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
}

impl<S: Store> SlidingWindowLimiter<S> {
    /// Create a limiter reading time from the system clock.
    pub fn new(store: S, config: LimiterConfig) -> Self {
        Self::with_clock(store, config, SystemClock::new())
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(store: S, config: LimiterConfig, clock: impl Clock + 'static) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(clock),
        }
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Window boundaries this limiter uses at `now`.
    pub fn window_at(&self, now: i64) -> Window {
        Window::at(now, self.config.window_size(), self.config.bucket_precision())
    }

    /// Key under which `key`'s buckets are stored.
    pub fn store_key(&self, key: &str) -> String {
        match self.config.key_prefix() {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Admit or deny an event for `key` now.
    ///
    /// Dropping the returned future before the store starts running the
    /// routine has no effect. Once it has started, a timeout cannot tell a
    /// committed call from a lost reply, so retrying may count an extra event.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        self.allow_at(key, self.clock.now()).await
    }

    /// Admit or deny an event for `key` as of `now` (Unix seconds).
    pub async fn allow_at(&self, key: &str, now: i64) -> Result<bool> {
        if key.is_empty() {
            return Err(SlidegateError::Argument("key must not be empty".to_string()));
        }

        let window = self.window_at(now);
        let args = AdmissionArgs {
            now,
            start_of_window: window.start,
            end_of_window: window.end,
            precision_secs: duration_secs(self.config.bucket_precision()),
            stale_age_secs: duration_secs(self.config.stale_bucket_age()),
            threshold: self.config.threshold(),
        };
        let store_key = self.store_key(key);

        trace!(
            key = %store_key,
            start = window.start,
            end = window.end,
            "Checking admission"
        );

        let reply = self.eval(&store_key, &args.to_argv()).await?;
        let admitted = interpret(reply, &window)?;

        if !admitted {
            debug!(
                key = %store_key,
                threshold = args.threshold,
                "Admission denied"
            );
        }

        Ok(admitted)
    }

    async fn eval(&self, key: &str, argv: &[String]) -> std::result::Result<Reply, StoreError> {
        let call = self.store.eval(&ADMISSION_ROUTINE, key, argv);
        match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => call.await,
        }
    }
}

/// Map a routine reply onto a decision or a typed error.
fn interpret(reply: Reply, window: &Window) -> Result<bool> {
    let raw = match reply {
        Reply::Integer(n) => n,
        Reply::Text(s) => s.trim().parse::<i64>().map_err(|_| {
            SlidegateError::Type(format!("could not convert {:?} to an admission code", s))
        })?,
        Reply::Nil => {
            return Err(SlidegateError::Type(
                "could not convert nil to an admission code".to_string(),
            ))
        }
        Reply::Other(other) => {
            return Err(SlidegateError::Type(format!(
                "could not convert {} to an admission code",
                other
            )))
        }
    };

    match AdmissionCode::try_from(raw) {
        Ok(AdmissionCode::Admit) => Ok(true),
        Ok(AdmissionCode::Deny) => Ok(false),
        Ok(AdmissionCode::WindowInvalid) => Err(SlidegateError::Config(format!(
            "window size is less than 0 seconds: {} seconds",
            window.length()
        ))),
        Ok(AdmissionCode::ThresholdInvalid) => Err(SlidegateError::Config(
            "threshold must be an integer greater than 0".to_string(),
        )),
        Ok(AdmissionCode::ArgsInvalid) => Err(SlidegateError::Argument(
            "invalid arguments provided to the admission routine".to_string(),
        )),
        Err(unknown) => Err(SlidegateError::Type(format!(
            "unexpected admission code {}",
            unknown
        ))),
    }
}
