mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingTokenSource, FailingTokenSource};
use lark_base_relay::clock::{Clock, ManualClock};
use lark_base_relay::datasource::CredentialCache;

const LIFETIME: Duration = Duration::from_secs(7200);
const MARGIN: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_token_reused_before_margin_and_refreshed_at_it() {
    let source = CountingTokenSource::new(LIFETIME);
    let clock = Arc::new(ManualClock::new());
    let shared: Arc<dyn Clock> = clock.clone();
    let cache = CredentialCache::new(source.clone(), shared, MARGIN);

    assert_eq!(cache.get_token().await.unwrap().value(), "t-1");

    clock.advance(Duration::from_secs(7139));
    assert_eq!(cache.get_token().await.unwrap().value(), "t-1");
    assert_eq!(source.calls(), 1);

    clock.advance(Duration::from_secs(1));
    assert_eq!(cache.get_token().await.unwrap().value(), "t-2");
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_callers_share_a_fresh_token() {
    let source = CountingTokenSource::new(LIFETIME);
    let cache = Arc::new(CredentialCache::new(source.clone(), Arc::new(ManualClock::new()), MARGIN));
    cache.get_token().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get_token().await.unwrap().value().to_string() }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), "t-1");
    }
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_exchange_failure_propagates() {
    let cache = CredentialCache::new(Arc::new(FailingTokenSource), Arc::new(ManualClock::new()), MARGIN);
    let err = cache.get_token().await.unwrap_err();
    assert!(err.to_string().contains("10003"));
}
