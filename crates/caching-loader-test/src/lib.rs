//! Helpers for testing caching loaders.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`counting_loader`] to find out how often, and for which keys, the load function was
//!    actually invoked. The returned [`LoadCalls`] can be inspected at any time.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::future;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use caching_loader::{Abandoned, CacheMap, CachingLoader, Panicked};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `caching_loader` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("caching_loader=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error type used by test loaders.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

impl TestError {
    /// Creates an error with the given message.
    pub fn new(message: impl Display) -> Self {
        Self(message.to_string())
    }
}

impl From<Abandoned> for TestError {
    fn from(error: Abandoned) -> Self {
        Self::new(error)
    }
}

impl From<Panicked> for TestError {
    fn from(error: Panicked) -> Self {
        Self::new(error)
    }
}

/// Records the keys a load function was invoked with.
#[derive(Debug)]
pub struct LoadCalls<K>(Arc<Mutex<Vec<K>>>);

impl<K> Clone for LoadCalls<K> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<K: Clone> LoadCalls<K> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn record(&self, key: K) {
        self.0.lock().unwrap().push(key);
    }

    /// The number of times the load function was invoked.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Whether the load function was never invoked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys the load function was invoked with, in order.
    pub fn keys(&self) -> Vec<K> {
        self.0.lock().unwrap().clone()
    }
}

/// Creates a loader that resolves every key to itself, and records all its invocations.
pub fn counting_loader<K>() -> (CachingLoader<K, K, TestError>, LoadCalls<K>)
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    let calls = LoadCalls::new();
    let recorder = calls.clone();
    let loader = CachingLoader::new(move |key: K| {
        recorder.record(key.clone());
        future::ok(key)
    });

    (loader, calls)
}

/// A cache map that can only ever hold a single entry.
///
/// Inserting a second, different key panics.
#[derive(Debug)]
pub struct SingleEntryMap<K, V>(HashMap<K, V>);

impl<K, V> Default for SingleEntryMap<K, V> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<K, V> CacheMap<K, V> for SingleEntryMap<K, V>
where
    K: Eq + Hash + Debug,
{
    fn get(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<V> {
        assert!(
            self.0.is_empty() || self.0.contains_key(&key),
            "Cannot set key {key:?}. This map can only hold one item at a time"
        );
        self.0.insert(key, value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.0.remove(key)
    }

    fn clear(&mut self) {
        self.0.clear()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}
