//! Client pool retention, identity, and one-shot construction tests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::errors::GatewayError;
use crate::pool::ClientPool;
use crate::testutil::{StubBuilder, image_spec};

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_stateful_backend_returns_identical_session() {
    let builder = StubBuilder::new();
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("grafana", true);
    let config = BackendConfig::default();

    let first = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    let first_session = Arc::clone(first.session());
    pool.release(first).await;

    let second = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    assert!(
        Arc::ptr_eq(&first_session, second.session()),
        "stateful backend must reuse the same session across acquires"
    );
    assert!(!first_session.is_closed(), "retained session must survive release");
    assert_eq!(builder.constructions(), 1);
    pool.release(second).await;

    pool.close().await;
    assert!(first_session.is_closed(), "pool close must close retained sessions");
}

#[tokio::test]
async fn test_stateless_backend_gets_fresh_sessions() {
    let builder = StubBuilder::new();
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("fetch", false);
    let config = BackendConfig::default();

    let first = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    let first_session = Arc::clone(first.session());
    pool.release(first).await;
    assert!(
        first_session.is_closed(),
        "non-retained session must be closed on release"
    );

    let second = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    assert!(
        !Arc::ptr_eq(&first_session, second.session()),
        "stateless backend must get a distinct session per acquisition"
    );
    assert_eq!(builder.constructions(), 2);
    pool.release(second).await;
    pool.close().await;
}

#[tokio::test]
async fn test_force_retain_keeps_stateless_sessions() {
    let builder = StubBuilder::new();
    let pool = ClientPool::with_builder(builder.clone(), true);
    let spec = image_spec("fetch", false);
    let config = BackendConfig::default();

    let first = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    let first_session = Arc::clone(first.session());
    pool.release(first).await;
    assert!(!first_session.is_closed());

    let second = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    assert!(Arc::ptr_eq(&first_session, second.session()));
    assert_eq!(builder.constructions(), 1);
    pool.release(second).await;
    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_acquires_construct_once() {
    let builder = StubBuilder::with_delay(Duration::from_millis(50));
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("grafana", true);
    let config = BackendConfig::default();

    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let spec = spec.clone();
        let config = config.clone();
        join_set.spawn(async move {
            let handle = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
            let session = Arc::clone(handle.session());
            pool.release(handle).await;
            session
        });
    }

    let mut sessions = Vec::new();
    while let Some(result) = join_set.join_next().await {
        sessions.push(result.unwrap());
    }

    assert_eq!(builder.constructions(), 1, "initialize must run exactly once");
    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }
    pool.close().await;
}

#[tokio::test]
async fn test_failed_construction_is_cached() {
    let builder = StubBuilder::failing();
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("broken", true);
    let config = BackendConfig::default();

    let first = pool.acquire(&ctx(), &spec, &config, false).await.unwrap_err();
    let second = pool.acquire(&ctx(), &spec, &config, false).await.unwrap_err();

    assert_eq!(first, second, "every caller observes the cached first error");
    assert!(matches!(first, GatewayError::Transport(_)));
    assert_eq!(
        builder.constructions(),
        1,
        "a failed stateful session is never re-driven"
    );
    pool.close().await;
}

#[tokio::test]
async fn test_failed_stateless_construction_retries_fresh_slot() {
    let builder = StubBuilder::failing();
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("flaky", false);
    let config = BackendConfig::default();

    pool.acquire(&ctx(), &spec, &config, false).await.unwrap_err();
    pool.acquire(&ctx(), &spec, &config, false).await.unwrap_err();

    // Non-retained entries are not cached, so each acquire constructs.
    assert_eq!(builder.constructions(), 2);
    pool.close().await;
}

#[tokio::test]
async fn test_acquires_for_different_names_proceed_in_parallel() {
    let builder = StubBuilder::with_delay(Duration::from_millis(100));
    let pool = ClientPool::with_builder(builder.clone(), false);
    let config = BackendConfig::default();

    let start = std::time::Instant::now();
    let (a, b) = tokio::join!(
        pool.acquire(&ctx(), &image_spec("a", true), &config, false),
        pool.acquire(&ctx(), &image_spec("b", true), &config, false),
    );
    let elapsed = start.elapsed();

    let a = a.unwrap();
    let b = b.unwrap();
    assert!(
        elapsed < Duration::from_millis(190),
        "distinct backends must construct concurrently, took {elapsed:?}"
    );
    pool.release(a).await;
    pool.release(b).await;
    pool.close().await;
}

#[tokio::test]
async fn test_cancelled_acquire_leaves_construction_resumable() {
    let builder = StubBuilder::with_delay(Duration::from_millis(100));
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("slow", true);
    let config = BackendConfig::default();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pool.acquire(&cancel, &spec, &config, false).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)), "{err}");

    // The entry stays in the retained set; the next acquire drives the
    // same lazy session to completion.
    let handle = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    assert_eq!(builder.constructions(), 1);
    pool.release(handle).await;
    pool.close().await;
}

#[tokio::test]
async fn test_acquire_after_close_is_rejected() {
    let pool = ClientPool::with_builder(StubBuilder::new(), false);
    pool.close().await;

    let err = pool
        .acquire(&ctx(), &image_spec("late", true), &BackendConfig::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}

#[tokio::test]
async fn test_release_is_idempotent_for_closed_pool_sessions() {
    let builder = StubBuilder::new();
    let pool = ClientPool::with_builder(builder.clone(), false);
    let spec = image_spec("grafana", true);
    let config = BackendConfig::default();

    let handle = pool.acquire(&ctx(), &spec, &config, false).await.unwrap();
    let session = Arc::clone(handle.session());
    pool.close().await;

    // Release after close: the retained set is gone, so the handle's slot
    // no longer matches and the (already closed) session is closed again.
    pool.release(handle).await;
    assert!(session.is_closed());
}
