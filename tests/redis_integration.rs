//! Integration tests for the Redis-backed limiter and sticky store.
//!
//! These tests require Docker (via testcontainers) and are skipped in
//! environments without Docker by simply failing at container startup.
//!
//! Run with: `cargo test --test redis_integration`

use std::sync::Arc;
use std::time::Duration;

use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tollgate::config::{RateLimitConfig, RedisConfig};
use tollgate::gray::StickyStore;
use tollgate::kv::KvClient;
use tollgate::ratelimit::{DistributedLimiter, LocalBuckets, RateLimiter};

/// Start a Redis container and return a connected client.
async fn start_redis() -> (Arc<KvClient>, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379_u16.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("failed to start redis container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(6379).await.expect("get port");

    let cfg = RedisConfig {
        url: Some(format!("redis://{}:{}", host, port)),
        timeout_ms: 1000,
        connect_timeout_ms: 5000,
    };
    let kv = KvClient::from_config(&cfg)
        .expect("valid url")
        .expect("url configured");
    kv.ping().await.expect("redis ping");

    (Arc::new(kv), container)
}

#[tokio::test]
async fn test_token_bucket_shared_across_limiters() {
    let (kv, _container) = start_redis().await;
    let first = DistributedLimiter::redis(kv.clone(), "it:");
    let second = DistributedLimiter::redis(kv, "it:");

    let mut allowed = 0;
    for i in 0..6 {
        let limiter = if i % 2 == 0 { &first } else { &second };
        let d = limiter
            .check_and_consume("bucket:alice", 1.0, 5, 1)
            .await
            .expect("redis call");
        if d.allowed {
            allowed += 1;
        } else {
            assert!(d.retry_after_secs >= 1);
            assert_eq!(d.remaining, 0);
        }
        assert_eq!(d.limit, 5);
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn test_sliding_window_expires() {
    let (kv, _container) = start_redis().await;
    let limiter = DistributedLimiter::redis(kv, "it:");
    let window = Duration::from_secs(1);

    for _ in 0..3 {
        let d = limiter
            .check_sliding_window("window:bob", 3, window)
            .await
            .expect("redis call");
        assert!(d.allowed);
    }
    let d = limiter
        .check_sliding_window("window:bob", 3, window)
        .await
        .expect("redis call");
    assert!(!d.allowed);
    assert_eq!(d.remaining, 0);
    assert!(d.retry_after_secs >= 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let d = limiter
        .check_sliding_window("window:bob", 3, window)
        .await
        .expect("redis call");
    assert!(d.allowed);
}

#[tokio::test]
async fn test_sticky_assignment_visible_to_other_instance() {
    let (kv, _container) = start_redis().await;
    let writer = StickyStore::new(Duration::from_secs(60)).with_remote(kv.clone(), "it:sticky:");
    let reader = StickyStore::new(Duration::from_secs(60)).with_remote(kv, "it:sticky:");

    assert_eq!(reader.get("orders", "alice").await, None);
    writer.put("orders", "alice", "v2").await;
    assert_eq!(reader.get("orders", "alice").await.as_deref(), Some("v2"));
    // Now cached locally as well.
    assert_eq!(reader.len(), 1);
}

#[tokio::test]
async fn test_unreachable_redis_degrades() {
    // Nothing listens on port 1; no container needed.
    let cfg = RedisConfig {
        url: Some("redis://127.0.0.1:1".to_string()),
        timeout_ms: 200,
        connect_timeout_ms: 200,
    };
    let kv = Arc::new(KvClient::from_config(&cfg).unwrap().unwrap());
    assert!(kv.ping().await.is_err());

    let limiter = RateLimiter::new(
        &RateLimitConfig::default(),
        Arc::new(LocalBuckets::new(Duration::from_secs(300))),
        Arc::new(DistributedLimiter::redis(kv, "it:")),
    );
    let limit = tollgate::ratelimit::Limit {
        name: "r".to_string(),
        algorithm: tollgate::config::LimitAlgorithm::SlidingWindow,
        rate: 2.0,
        capacity: 2,
        window: Duration::from_secs(1),
        max_requests: 2,
    };

    // The shared store fails, so the degraded bucket (capacity 1) decides.
    assert!(limiter.check(&limit, "carol").await.allowed);
    assert!(limiter.is_degraded());
    assert!(!limiter.check(&limit, "carol").await.allowed);
}
