use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt};
use rustc_hash::FxHashMap;

use crate::config::LoaderConfig;
use crate::handle::{HandleId, LoadHandle, Panicked};
use crate::map::CacheMap;

type LoadFn<K, V, E> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;
type CacheKeyFn<K, C> = Arc<dyn Fn(&K) -> C + Send + Sync>;

/// The backing store a [`CachingLoader`] uses unless told otherwise.
pub type DefaultCacheMap<C, V, E> = FxHashMap<C, LoadHandle<V, E>>;

/// Deduplicates and memoizes calls to an asynchronous load function.
///
/// Every key is mapped to a cache key, by default the key itself. The first [`load`] of a cache
/// key publishes a new [`LoadHandle`] and invokes the load function; every later `load` of the
/// same cache key returns a clone of that very handle, until it is removed again by [`clear`],
/// [`clear_all`], or by failing.
///
/// A handle whose load fails removes itself from the cache before anyone can observe the error,
/// so the next `load` of that key invokes the load function again. Successful results stay
/// cached for the lifetime of the loader; there is no expiration or size limit.
///
/// The cache is guarded by a lock that is never held while the load function runs, so the load
/// function may itself call into the loader.
///
/// [`load`]: Self::load
/// [`clear`]: Self::clear
/// [`clear_all`]: Self::clear_all
pub struct CachingLoader<K, V, E, C = K, M = DefaultCacheMap<C, V, E>> {
    config: LoaderConfig,
    load_fn: LoadFn<K, V, E>,
    cache_key_fn: CacheKeyFn<K, C>,
    cache: Arc<Mutex<M>>,
}

impl<K, V, E> CachingLoader<K, V, E>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a loader around `load_fn`, using the keys themselves as cache keys.
    pub fn new<F, Fut>(load_fn: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        CachingLoader {
            config: LoaderConfig::default(),
            load_fn: Arc::new(move |key| load_fn(key).boxed()),
            cache_key_fn: Arc::new(|key: &K| key.clone()),
            cache: Default::default(),
        }
    }
}

impl<K, V, E, C> CachingLoader<K, V, E, C> {
    /// Derives cache keys with `cache_key_fn` instead.
    ///
    /// Keys with equal cache keys share one cache entry. The cache map is keyed by cache keys, so
    /// this is only available before a custom map is given via [`with_cache_map`].
    ///
    /// [`with_cache_map`]: Self::with_cache_map
    pub fn with_cache_key_fn<C2, F>(self, cache_key_fn: F) -> CachingLoader<K, V, E, C2>
    where
        F: Fn(&K) -> C2 + Send + Sync + 'static,
        C2: Eq + Hash,
    {
        CachingLoader {
            config: self.config,
            load_fn: self.load_fn,
            cache_key_fn: Arc::new(cache_key_fn),
            cache: Default::default(),
        }
    }
}

impl<K, V, E, C, M> CachingLoader<K, V, E, C, M> {
    /// Stores handles in `cache_map` instead of the default map.
    pub fn with_cache_map<M2>(self, cache_map: M2) -> CachingLoader<K, V, E, C, M2> {
        CachingLoader {
            config: self.config,
            load_fn: self.load_fn,
            cache_key_fn: self.cache_key_fn,
            cache: Arc::new(Mutex::new(cache_map)),
        }
    }

    /// Applies the given options.
    pub fn with_config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// The name of this loader, as used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The options of this loader.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

impl<K, V, E, C, M> CachingLoader<K, V, E, C, M>
where
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + From<Panicked> + Send + Sync + 'static,
    C: Clone + Send + 'static,
    M: CacheMap<C, LoadHandle<V, E>> + Send + 'static,
{
    /// Loads `key`, returning the handle that settles with its value.
    ///
    /// Returns the cached handle if there is one. Otherwise a new handle is published into the
    /// cache first, and only then is the load function invoked. With
    /// [`eager`](LoaderConfig::eager) set, the new handle is polled once before it is returned, so
    /// a load that completes right away has already settled, and has already been evicted again
    /// in case it failed. A load that does not complete right away is then driven to completion
    /// on the current tokio runtime, if there is one.
    ///
    /// This never panics because of the load function. A panicking load function rejects the
    /// handle with [`Panicked`] instead.
    pub fn load(&self, key: K) -> LoadHandle<V, E> {
        let name = self.name();
        let cache_key = (self.cache_key_fn)(&key);

        let mut cache = self.lock_cache();
        let cached = cache.get(&cache_key).cloned();
        if let Some(handle) = cached {
            drop(cache);
            metric!(counter("caching_loader.hit") += 1, "loader" => name);
            tracing::trace!(loader = name, "Returning cached load handle");
            return self.revisit(key, &cache_key, handle);
        }

        metric!(counter("caching_loader.miss") += 1, "loader" => name);
        tracing::trace!(loader = name, "Publishing new load handle");

        let handle = self.create_handle(key, cache_key.clone());
        let evicted = cache.insert(cache_key, handle.clone());
        debug_assert!(evicted.is_none());
        metric!(gauge("caching_loader.entries") = cache.len() as u64, "loader" => name);
        drop(cache);

        if self.config.eager {
            self.drive(&handle);
        }

        handle
    }

    /// Starts running a freshly published load.
    fn drive(&self, handle: &LoadHandle<V, E>) {
        // The load function runs as part of this poll, the lock must not be held here.
        if handle.poll_now() {
            tracing::trace!(loader = self.name(), "Load settled synchronously");
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            // Runs the load to completion even if every caller drops its handle, so a failure is
            // evicted as soon as it happens.
            runtime.spawn(handle.clone().map(drop));
        }
    }

    /// Checks a cached handle before handing it out again.
    ///
    /// A load that failed while nobody was polling its handle has not evicted itself yet. Polling
    /// it here does, in which case the key is loaded anew.
    fn revisit(&self, key: K, cache_key: &C, handle: LoadHandle<V, E>) -> LoadHandle<V, E> {
        if !self.config.eager || handle.is_settled() || !handle.poll_now() {
            return handle;
        }

        let failed = handle.peek().is_some_and(|result| result.is_err());
        if failed && !self.is_cached(cache_key, &handle) {
            tracing::trace!(loader = self.name(), "Cached load failed meanwhile, loading again");
            return self.load(key);
        }

        handle
    }

    /// Creates the handle for a new load.
    ///
    /// The load function is only invoked once the handle is first polled. A failing load evicts
    /// its own handle from the cache before the error is handed out to anyone. Panics of the load
    /// function, or of the future it returns, count as failures.
    fn create_handle(&self, key: K, cache_key: C) -> LoadHandle<V, E> {
        let id = HandleId::next();
        let load_fn = Arc::clone(&self.load_fn);
        let cache = Arc::downgrade(&self.cache);
        let name = self.config.name.clone();

        let computation = async move {
            let started = panic::catch_unwind(AssertUnwindSafe(|| load_fn(key)));
            let result = match started {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            let result = result.unwrap_or_else(|payload| {
                let panicked = Panicked::from_payload(payload);
                tracing::error!(loader = name.as_str(), error = %panicked, "Load function panicked");
                Err(panicked.into())
            });

            if result.is_err() {
                let evicted = evict::<C, V, E, M>(&cache, &cache_key, id);
                metric!(counter("caching_loader.failure") += 1, "loader" => name.as_str());
                tracing::debug!(loader = name.as_str(), evicted, "Load failed");
            }

            result
        };

        LoadHandle::with_id(id, computation)
    }
}

impl<K, V, E, C, M> CachingLoader<K, V, E, C, M>
where
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    C: Clone + Send + 'static,
    M: CacheMap<C, LoadHandle<V, E>> + Send + 'static,
{
    /// Removes the entry for `key` from the cache, if there is one.
    ///
    /// Handles handed out earlier stay valid, but later loads of `key` start over.
    pub fn clear(&self, key: &K) -> &Self {
        let cache_key = (self.cache_key_fn)(key);
        if self.lock_cache().remove(&cache_key).is_none() {
            tracing::trace!(loader = self.name(), "Nothing to clear");
        }
        self
    }

    /// Removes all entries from the cache.
    pub fn clear_all(&self) -> &Self {
        self.lock_cache().clear();
        tracing::trace!(loader = self.name(), "Cleared all load handles");
        self
    }

    /// Puts `handle` into the cache for `key`, unless `key` is cached already.
    ///
    /// The load function is not invoked, and an existing entry is never replaced. Primed handles
    /// are owned by the caller and stay cached even when they fail.
    pub fn prime(&self, key: &K, handle: impl Into<LoadHandle<V, E>>) -> &Self {
        let cache_key = (self.cache_key_fn)(key);
        let handle = handle.into();

        let mut cache = self.lock_cache();
        if cache.get(&cache_key).is_none() {
            cache.insert(cache_key, handle);
            metric!(counter("caching_loader.prime") += 1, "loader" => self.name());
        }

        self
    }

    /// Whether `key` currently has an entry in the cache.
    pub fn contains(&self, key: &K) -> bool {
        let cache_key = (self.cache_key_fn)(key);
        self.lock_cache().get(&cache_key).is_some()
    }

    /// The number of cache entries.
    pub fn len(&self) -> usize {
        self.lock_cache().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_cache().is_empty()
    }

    fn is_cached(&self, cache_key: &C, handle: &LoadHandle<V, E>) -> bool {
        self.lock_cache()
            .get(cache_key)
            .is_some_and(|cached| cached.ptr_eq(handle))
    }

    fn lock_cache(&self) -> MutexGuard<'_, M> {
        lock(&self.cache)
    }
}

impl<K, V, E, C, M> fmt::Debug for CachingLoader<K, V, E, C, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<M>(cache: &Mutex<M>) -> MutexGuard<'_, M> {
    // map operations never leave the map in an inconsistent state
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the entry for `cache_key`, if it is still the handle with the given `id`.
///
/// The entry may have been cleared, and replaced by a newer load, since the failed load started.
fn evict<C, V, E, M>(cache: &Weak<Mutex<M>>, cache_key: &C, id: HandleId) -> bool
where
    M: CacheMap<C, LoadHandle<V, E>>,
{
    // the loader is gone, and its cache with it
    let Some(cache) = cache.upgrade() else {
        return false;
    };

    let mut cache = lock(&cache);
    let is_current = cache
        .get(cache_key)
        .is_some_and(|handle| handle.id() == id);
    if is_current {
        cache.remove(cache_key);
    }
    is_current
}
