use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future;

use caching_loader::{CachingLoader, LoadHandle};
use caching_loader_test::{self as test, TestError, counting_loader};

#[tokio::test]
async fn test_loading_a_key_resolves_to_the_correct_value() {
    test::setup();
    let (loader, _calls) = counting_loader();

    assert_eq!(loader.load("another-key").await, Ok("another-key"));
}

#[tokio::test]
async fn test_loading_different_keys() {
    test::setup();
    let (loader, calls) = counting_loader();

    let result1 = loader.load("some-key");
    let result2 = loader.load("another-key");

    assert_ne!(result1, result2);
    assert_eq!(result1.await, Ok("some-key"));
    assert_eq!(result2.await, Ok("another-key"));
    assert_eq!(calls.keys(), ["some-key", "another-key"]);
}

#[tokio::test]
async fn test_loading_a_key_multiple_times_returns_cached_handle() {
    test::setup();
    let (loader, calls) = counting_loader();

    let result1 = loader.load("some-key");
    let result2 = loader.load("some-key");

    assert_eq!(result1, result2);
    assert_eq!(calls.len(), 1);
    assert_eq!(result1.await, result2.await);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_invocation() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = CachingLoader::new(move |key: &'static str| {
        counter.fetch_add(1, Ordering::Relaxed);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, TestError>(key.len())
        }
    });

    let first = loader.load("a");
    let second = loader.load("a");
    assert!(!first.is_settled());
    assert_eq!(first, second);

    let (first, second) = futures::join!(first, second);
    assert_eq!(first, Ok(1));
    assert_eq!(second, Ok(1));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_loading_a_key_that_fails_propagates_the_error() {
    test::setup();
    let loader = CachingLoader::<_, (), _>::new(|key: &'static str| future::err(TestError::new(key)));

    assert_eq!(loader.load("some-key").await, Err(TestError::new("some-key")));
}

#[tokio::test]
async fn test_immediate_failure_is_evicted_right_away() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = CachingLoader::<u32, (), _>::new(move |key| {
        counter.fetch_add(1, Ordering::Relaxed);
        future::err(TestError::new(key))
    });

    let result1 = loader.load(1);
    let result2 = loader.load(1);

    // The failure settles while `load` is still running, so it is gone from the cache by the
    // time the second load happens.
    assert_ne!(result1, result2);
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    assert_eq!(result1.clone().await, Err(TestError::new(1)));

    let result3 = loader.load(1);
    assert_ne!(result1, result3);
    assert_ne!(result2, result3);
    assert_eq!(calls.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn test_failure_is_evicted_before_it_is_observed() {
    test::setup();
    let (resolver, pending) = LoadHandle::<u32, TestError>::pending();
    let pending = Arc::new(std::sync::Mutex::new(Some(pending)));
    let loader = CachingLoader::new(move |key: u32| {
        match pending.lock().unwrap().take() {
            Some(handle) => future::Either::Left(handle),
            None => future::Either::Right(future::ok(key)),
        }
    });

    let failing = loader.load(1);
    assert!(!failing.is_settled());
    assert!(loader.contains(&1));

    resolver.reject(TestError::new("boom"));
    assert_eq!(failing.clone().await, Err(TestError::new("boom")));
    assert!(!loader.contains(&1));

    // the retry invokes the load function again, which succeeds this time
    let retried = loader.load(1);
    assert_ne!(retried, failing);
    assert_eq!(retried.await, Ok(1));
}

#[tokio::test]
async fn test_loading_a_future_adapts_it() {
    test::setup();
    let loader = CachingLoader::new(|key: u64| async move {
        tokio::time::sleep(Duration::from_millis(key)).await;
        Ok::<_, TestError>(key * 2)
    });

    let result = loader.load(5);
    assert_eq!(result.await, Ok(10));
}

#[tokio::test]
async fn test_loading_a_handle_adapts_it() {
    test::setup();
    let loader = CachingLoader::new(|key: u32| LoadHandle::<_, TestError>::resolved(key + 1));

    assert_eq!(loader.load(1).peek(), Some(Ok(2)));
}

#[tokio::test]
async fn test_failure_while_nobody_waits_is_evicted() {
    test::setup();
    let (resolver, pending) = LoadHandle::<u32, TestError>::pending();
    let pending = Arc::new(std::sync::Mutex::new(Some(pending)));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = CachingLoader::new(move |key: u32| {
        counter.fetch_add(1, Ordering::Relaxed);
        match pending.lock().unwrap().take() {
            Some(handle) => future::Either::Left(handle),
            None => future::Either::Right(future::ok(key)),
        }
    });

    // the only caller gives up on the load before it fails
    drop(loader.load(1));
    resolver.reject(TestError::new("backend down"));

    // the load keeps running on the runtime and evicts itself
    for _ in 0..10 {
        if !loader.contains(&1) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!loader.contains(&1));

    assert_eq!(loader.load(1).await, Ok(1));
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_loads_publish_one_handle() {
    test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = Arc::new(CachingLoader::new(move |key: u32| {
        counter.fetch_add(1, Ordering::Relaxed);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, TestError>(key)
        }
    }));
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let tasks = (0..8).map(|_| {
        let loader = Arc::clone(&loader);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            loader.load(1)
        })
    });
    let handles = future::try_join_all(tasks).await.unwrap();

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert!(handles.iter().all(|handle| *handle == handles[0]));
    for handle in handles {
        assert_eq!(handle.await, Ok(1));
    }
}
