use std::any::Any;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

/// The error a [`LoadHandle`] settles with when its [`Resolver`] is dropped without settling it.
///
/// Handles created via [`LoadHandle::pending`] require their error type to be constructible from
/// this, so that awaiting such a handle can never hang forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("load handle was abandoned before it was settled")]
pub struct Abandoned;

/// The error a load settles with when its load function panicked.
///
/// The [`CachingLoader`](crate::CachingLoader) requires its error type to be constructible from
/// this, so that a panicking load is rejected and evicted like any other failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("load function panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(message) => (*message).to_owned(),
                None => "Box<dyn Any>".to_owned(),
            },
        };
        Self { message }
    }

    /// The message the load function panicked with.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Process-wide unique identity of a [`LoadHandle`], shared by all of its clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A clonable handle to a value that might not be known yet.
///
/// All clones of a handle share one underlying computation, which is driven by whoever polls
/// first, and they all settle with the same `Result`. Handles compare equal if and only if they
/// are clones of one another; the values they settle with are irrelevant for that comparison.
///
/// The computation is lazy: it only runs when the handle is polled (or awaited). The
/// [`CachingLoader`](crate::CachingLoader) polls the handles it creates once right away, so a
/// load function which completes without suspending settles before `load` returns.
pub struct LoadHandle<V, E> {
    id: HandleId,
    inner: Shared<BoxFuture<'static, Result<V, E>>>,
}

impl<V, E> Clone for LoadHandle<V, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        LoadHandle {
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> LoadHandle<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Adapts any future resolving to a `Result` into a handle.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self::with_id(HandleId::next(), future)
    }

    pub(crate) fn with_id<F>(id: HandleId, future: F) -> Self
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        LoadHandle {
            id,
            inner: future.boxed().shared(),
        }
    }

    /// Creates a handle that is already resolved with `value`.
    pub fn resolved(value: V) -> Self {
        Self::settled(Ok(value))
    }

    /// Creates a handle that is already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<V, E>) -> Self {
        let handle = Self::from_future(future::ready(result));
        handle.poll_now();
        handle
    }

    /// Creates a pending handle, along with the [`Resolver`] that settles it.
    ///
    /// Dropping the resolver without settling rejects the handle with [`Abandoned`].
    pub fn pending() -> (Resolver<V, E>, Self)
    where
        E: From<Abandoned>,
    {
        let (sender, receiver) = oneshot::channel();
        let future = receiver.map(|result| result.unwrap_or_else(|_canceled| Err(Abandoned.into())));

        (Resolver { sender }, Self::from_future(future))
    }

    /// Drives the underlying computation as far as it goes without waiting.
    ///
    /// Returns `true` if the handle is settled afterwards.
    pub(crate) fn poll_now(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }

    /// Returns the result of this handle if it has already settled.
    ///
    /// This never drives the computation, it only reports what an earlier poll produced.
    pub fn peek(&self) -> Option<Result<V, E>> {
        self.inner.peek().cloned()
    }

    /// Whether the handle has settled with either a value or an error.
    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl<V, E> LoadHandle<V, E> {
    /// Returns `true` if both handles are clones of the same handle.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.id == other.id
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }
}

impl<V, E> PartialEq for LoadHandle<V, E> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<V, E> Eq for LoadHandle<V, E> {}

impl<V, E> Hash for LoadHandle<V, E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<V, E> fmt::Debug for LoadHandle<V, E>
where
    V: Clone + fmt::Debug,
    E: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("id", &self.id.0)
            .field("result", &self.inner.peek())
            .finish()
    }
}

impl<V, E> Future for LoadHandle<V, E>
where
    V: Clone,
    E: Clone,
{
    type Output = Result<V, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<V, E> From<Result<V, E>> for LoadHandle<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn from(result: Result<V, E>) -> Self {
        Self::settled(result)
    }
}

/// The settling side of a pending [`LoadHandle`].
#[derive(Debug)]
pub struct Resolver<V, E> {
    sender: oneshot::Sender<Result<V, E>>,
}

impl<V, E> Resolver<V, E> {
    /// Resolves the handle with `value`.
    pub fn resolve(self, value: V) {
        self.settle(Ok(value))
    }

    /// Rejects the handle with `error`.
    pub fn reject(self, error: E) {
        self.settle(Err(error))
    }

    /// Settles the handle with the given `result`.
    pub fn settle(self, result: Result<V, E>) {
        // nobody is listening anymore if every clone of the handle was dropped
        self.sender.send(result).ok();
    }

    /// Whether every clone of the handle has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_canceled()
    }
}
