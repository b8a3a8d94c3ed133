use caching_loader::LoadHandle;
use caching_loader_test::{self as test, TestError, counting_loader};

#[test]
fn test_prime_puts_element_into_cache_without_calling_load_fn() {
    test::setup();
    let (loader, calls) = counting_loader();

    loader.prime(&"some-key", LoadHandle::resolved("hello"));

    assert!(loader.contains(&"some-key"));
    assert!(calls.is_empty());
}

#[tokio::test]
async fn test_can_preload_value_into_cache_if_key_is_free() {
    test::setup();
    let (loader, calls) = counting_loader();
    let primed = LoadHandle::resolved("hello");

    let result = loader.prime(&"some-key", primed.clone()).load("some-key");

    assert!(calls.is_empty());
    assert_eq!(result, primed);
    assert_eq!(result.await, Ok("hello"));
}

#[tokio::test]
async fn test_prime_does_nothing_if_key_is_already_populated() {
    test::setup();
    let (loader, calls) = counting_loader();

    let result1 = loader.load("some-key");
    let result2 = loader
        .prime(&"some-key", LoadHandle::resolved("great new value"))
        .load("some-key");

    assert_eq!(result1, result2);
    assert_eq!(calls.len(), 1);
    assert_eq!(result2.await, Ok("some-key"));
}

#[tokio::test]
async fn test_can_preload_error_into_cache_if_key_is_free() {
    test::setup();
    let (loader, calls) = counting_loader();

    let result = loader
        .prime(&"some-key", Err::<&str, _>(TestError::new("Why would you do that?")))
        .load("some-key");

    assert_eq!(result.clone().await, Err(TestError::new("Why would you do that?")));

    // primed failures are not evicted
    assert_eq!(loader.load("some-key"), result);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn test_can_prime_pending_handle() {
    test::setup();
    let (loader, calls) = counting_loader();
    let (resolver, pending) = LoadHandle::pending();

    let result = loader.prime(&7, pending).load(7);
    assert!(!result.is_settled());

    resolver.resolve(49);
    assert_eq!(result.await, Ok(49));
    assert!(calls.is_empty());
}
