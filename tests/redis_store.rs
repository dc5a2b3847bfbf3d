//! Integration tests for the Redis store.
//!
//! These tests need a Redis server at `REDIS_URL` (e.g. `redis://127.0.0.1:6379/`).
//! Each test is skipped with a message when the variable is unset or the server
//! cannot be reached.

use std::time::Duration;

use redis::AsyncCommands;
use slidegate::ratelimit::window::truncate;
use slidegate::ratelimit::{AdmissionArgs, BucketId, ManualClock, ADMISSION_ROUTINE};
use slidegate::store::{Reply, Store};
use slidegate::{LimiterConfig, RedisStore, SlidingWindowLimiter};

const NOW: i64 = 1_664_832_874;

async fn redis_store() -> Option<(RedisStore, redis::aio::ConnectionManager)> {
    let url = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: REDIS_URL is not set");
            return None;
        }
    };

    let client = redis::Client::open(url.as_str()).ok()?;
    let conn = match client.get_connection_manager().await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Skipping test: Redis not available at {}: {}", url, e);
            return None;
        }
    };
    let store = RedisStore::new(conn.clone());
    Some((store, conn))
}

fn unique_key() -> String {
    format!("slidegate_test_{}", rand::random::<u64>())
}

fn field(position: i64, precision: i64) -> String {
    BucketId {
        timestamp: truncate(NOW - position * precision, precision),
        precision_secs: precision,
    }
    .to_string()
}

fn args(window_secs: i64, threshold: i64) -> AdmissionArgs {
    AdmissionArgs {
        now: NOW,
        start_of_window: truncate(NOW - window_secs, 60),
        end_of_window: truncate(NOW, 60),
        precision_secs: 60,
        stale_age_secs: 3600,
        threshold,
    }
}

#[tokio::test]
async fn test_redis_first_call_creates_hash_with_ttl() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();

    let reply = store.eval(&ADMISSION_ROUTINE, &key, &args(60, 2).to_argv()).await.unwrap();
    assert_eq!(reply, Reply::Integer(1));

    let ttl: i64 = conn.ttl(&key).await.unwrap();
    assert!(ttl > 0 && ttl <= 120, "ttl was {}", ttl);

    let count: i64 = conn.hget(&key, field(0, 60)).await.unwrap();
    assert_eq!(count, 1);

    let _: () = conn.del(&key).await.unwrap();
}

#[tokio::test]
async fn test_redis_denies_past_threshold() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();
    let argv = args(60, 2).to_argv();

    let mut codes = Vec::new();
    for _ in 0..3 {
        codes.push(store.eval(&ADMISSION_ROUTINE, &key, &argv).await.unwrap());
    }
    assert_eq!(
        codes,
        vec![Reply::Integer(1), Reply::Integer(1), Reply::Integer(0)]
    );

    let count: i64 = conn.hget(&key, field(0, 60)).await.unwrap();
    assert_eq!(count, 2);

    let _: () = conn.del(&key).await.unwrap();
}

#[tokio::test]
async fn test_redis_prunes_mixed_precision_record() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();

    let seeded = [
        (field(5, 60), 2),
        (field(5, 900), 2),
        (field(1, 900), 2),
        (field(4, 60), 2),
        (field(1, 60), 2),
        (field(0, 60), 2),
        ("garbage".to_string(), 2),
    ];
    let _: () = conn.hset_multiple(&key, &seeded).await.unwrap();

    let reply = store.eval(&ADMISSION_ROUTINE, &key, &args(300, 7).to_argv()).await.unwrap();
    assert_eq!(reply, Reply::Integer(1));

    let fields: std::collections::HashMap<String, i64> = conn.hgetall(&key).await.unwrap();
    assert_eq!(fields.len(), 4);
    assert!(fields.contains_key(&field(1, 900)));
    assert_eq!(fields.get(&field(0, 60)), Some(&3));

    let ttl: i64 = conn.ttl(&key).await.unwrap();
    assert!(ttl > 0);

    let _: () = conn.del(&key).await.unwrap();
}

#[tokio::test]
async fn test_redis_ttl_is_never_lowered() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();

    let _: () = conn.hset(&key, field(0, 60), 1).await.unwrap();
    let _: () = conn.expire(&key, 10_000).await.unwrap();

    store.eval(&ADMISSION_ROUTINE, &key, &args(60, 5).to_argv()).await.unwrap();

    let ttl: i64 = conn.ttl(&key).await.unwrap();
    assert!(ttl > 9_000, "ttl was {}", ttl);

    let _: () = conn.del(&key).await.unwrap();
}

#[tokio::test]
async fn test_redis_validation_codes() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();

    let reply = store.eval(&ADMISSION_ROUTINE, &key, &args(60, 0).to_argv()).await.unwrap();
    assert_eq!(reply, Reply::Integer(-2));

    let mut inverted = args(60, 1);
    std::mem::swap(&mut inverted.start_of_window, &mut inverted.end_of_window);
    let reply = store.eval(&ADMISSION_ROUTINE, &key, &inverted.to_argv()).await.unwrap();
    assert_eq!(reply, Reply::Integer(-1));

    let mut argv = args(60, 1).to_argv();
    argv[2] = "later".to_string();
    let reply = store.eval(&ADMISSION_ROUTINE, &key, &argv).await.unwrap();
    assert_eq!(reply, Reply::Integer(-3));

    let exists: bool = conn.exists(&key).await.unwrap();
    assert!(!exists);
}

#[tokio::test]
async fn test_redis_limiter_end_to_end() {
    let Some((store, mut conn)) = redis_store().await else {
        return;
    };
    let key = unique_key();

    let config = LimiterConfig::builder(2)
        .window_size(Duration::from_secs(60))
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let limiter = SlidingWindowLimiter::with_clock(store, config, ManualClock::new(NOW));

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(limiter.allow(&key).await.unwrap());
    }
    assert_eq!(results, vec![true, true, false]);

    let _: () = conn.del(&key).await.unwrap();
}
