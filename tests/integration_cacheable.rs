//! Read-through caching with jittered TTLs
//!
//! Covers the S1 scenario (random TTL within bounds, second read served
//! from cache) plus the basic put/get/evict lifecycle and envelope
//! versioning.

mod common;

use std::time::Duration;

use common::*;
use cache_shield::ValueEnvelope;

#[tokio::test]
async fn cacheable_with_random_ttl() {
    let mut t = test_shield().await;
    let op = t
        .shield
        .manager()
        .register_operation(
            t.shield
                .manager()
                .operation_for("users")
                .ttl_seconds(300)
                .random_ttl(0.5)
                .build()
                .unwrap(),
        )
        .unwrap();

    let loader = CountingLoader::returning(test_data::user(1, "David"));

    // First GET misses and invokes the origin exactly once.
    let value = t
        .shield
        .manager()
        .get_or_load(&op, "1", loader.clone())
        .await
        .unwrap();
    assert_eq!(value, Some(test_data::user(1, "David")));
    assert_eq!(loader.calls(), 1);

    // The stored TTL is jittered but bounded: [1, 600] seconds.
    let ttl = t
        .redis
        .remaining_ttl("users::1")
        .unwrap_or_else(|| panic!("entry should have an expiry"));
    assert!(ttl >= Duration::from_secs(1) && ttl <= Duration::from_secs(600), "ttl {ttl:?}");

    // Second GET hits without touching the origin again.
    let again = t
        .shield
        .manager()
        .get_or_load(&op, "1", loader.clone())
        .await
        .unwrap();
    assert_eq!(again, Some(test_data::user(1, "David")));
    assert_eq!(loader.calls(), 1);

    let stats = t.shield.stats();
    assert!(stats.hits >= 1);
    assert!(stats.misses >= 1);
}

#[tokio::test]
async fn put_get_evict_lifecycle() {
    let t = test_shield().await;
    let op = t
        .shield
        .manager()
        .register_operation(
            t.shield
                .manager()
                .operation_for("products")
                .ttl_seconds(120)
                .build()
                .unwrap(),
        )
        .unwrap();

    t.shield
        .manager()
        .put(&op, "9", Some(test_data::product(9)))
        .await
        .unwrap();
    assert_eq!(
        t.shield.manager().get(&op, "9").await.unwrap(),
        Some(test_data::product(9))
    );

    let evicted = t.shield.manager().evict(&op, Some("9")).await.unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(t.shield.manager().get(&op, "9").await.unwrap(), None);
}

#[tokio::test]
async fn put_if_absent_first_write_wins() {
    let t = test_shield().await;
    let op = t
        .shield
        .manager()
        .register_operation(
            t.shield
                .manager()
                .operation_for("config")
                .ttl_seconds(60)
                .build()
                .unwrap(),
        )
        .unwrap();

    assert!(t
        .shield
        .manager()
        .put_if_absent(&op, "mode", Some(serde_json::json!("primary")))
        .await
        .unwrap());
    assert!(!t
        .shield
        .manager()
        .put_if_absent(&op, "mode", Some(serde_json::json!("secondary")))
        .await
        .unwrap());
    assert_eq!(
        t.shield.manager().get(&op, "mode").await.unwrap(),
        Some(serde_json::json!("primary"))
    );
}

#[tokio::test]
async fn envelope_version_is_monotonic_across_overwrites() {
    let t = test_shield().await;
    let op = t
        .shield
        .manager()
        .register_operation(
            t.shield
                .manager()
                .operation_for("users")
                .ttl_seconds(60)
                .build()
                .unwrap(),
        )
        .unwrap();

    t.shield
        .manager()
        .put(&op, "7", Some(test_data::user(7, "First")))
        .await
        .unwrap();
    t.shield
        .manager()
        .put(&op, "7", Some(test_data::user(7, "Second")))
        .await
        .unwrap();
    t.shield
        .manager()
        .put(&op, "7", Some(test_data::user(7, "Third")))
        .await
        .unwrap();

    let raw = t.redis.raw("users::7").unwrap_or_else(|| panic!("entry missing"));
    let envelope: ValueEnvelope = serde_json::from_slice(&raw).unwrap();
    assert_eq!(envelope.version, 3);
    assert_eq!(envelope.value, test_data::user(7, "Third"));
}

#[tokio::test]
async fn expired_entries_miss_and_reload() {
    let mut t = test_shield().await;
    let op = t
        .shield
        .manager()
        .register_operation(
            t.shield
                .manager()
                .operation_for("sessions")
                .ttl_seconds(100)
                .build()
                .unwrap(),
        )
        .unwrap();

    let loader = CountingLoader::returning(serde_json::json!({"token": "abc"}));
    t.shield
        .manager()
        .get_or_load(&op, "s1", loader.clone())
        .await
        .unwrap();
    assert_eq!(loader.calls(), 1);

    // Jump past the TTL: the policy declares the entry dead even though the
    // backing store still has the bytes.
    t.clock.advance(101_000);
    t.shield
        .manager()
        .get_or_load(&op, "s1", loader.clone())
        .await
        .unwrap();
    assert_eq!(loader.calls(), 2);

    let events = drain_events(&mut t.events);
    assert!(events
        .iter()
        .any(|e| e.kind == cache_shield::CacheEventKind::CacheExpired));
}

#[tokio::test]
async fn health_check_reports_redis_reachability() {
    let t = test_shield().await;
    assert!(t.shield.health_check().await);
}
