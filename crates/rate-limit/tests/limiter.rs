use std::time::Duration;

use mempool_common::RateLimiterConfig;
use mempool_rate_limit::RateLimiter;
use tokio_util::sync::CancellationToken;

fn config() -> RateLimiterConfig {
    RateLimiterConfig {
        cleanup_duration_secs: 5,
        capacity: 10,
        allowed_occurrences: 10,
    }
}

#[tokio::test]
async fn test_allowed_occurrences_and_capacity() {
    let token = CancellationToken::new();
    let limiter = RateLimiter::new(&config()).unwrap();
    let sweeper = tokio::spawn({
        let limiter = limiter.clone();
        let token = token.clone();
        async move { limiter.run(token).await }
    });

    // Creating the key.
    assert!(limiter.is_allowed("event"));

    // 10 occurrences.
    for _ in 0..10 {
        assert!(limiter.is_allowed("event"));
    }

    // Limited.
    assert!(!limiter.is_allowed("event"));

    // 9 more distinct keys fill the table (including "event").
    for i in 1..10 {
        assert!(limiter.is_allowed(&format!("event{}", i)));
    }

    assert!(!limiter.is_allowed("last"));

    token.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_evicted_key_is_created_fresh() {
    let token = CancellationToken::new();
    let limiter = RateLimiter::new(&config()).unwrap();
    let sweeper = tokio::spawn({
        let limiter = limiter.clone();
        let token = token.clone();
        async move { limiter.run(token).await }
    });

    for i in 0..10 {
        assert!(limiter.is_allowed(&format!("event{}", i)));
    }
    for _ in 0..10 {
        limiter.is_allowed("event0");
    }
    assert!(!limiter.is_allowed("event0"));
    assert!(!limiter.is_allowed("last"));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(limiter.is_empty());

    assert!(limiter.is_allowed("last"));
    assert!(limiter.is_allowed("event0"));

    token.cancel();
    sweeper.await.unwrap();
}
