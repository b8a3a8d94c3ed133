//! A request-deduplicating, memoizing loader for asynchronous computations.
//!
//! Server applications often need the same service call from independent parts of a single
//! request. The [`CachingLoader`] wraps the actual load function and makes sure every distinct
//! cache key is only loaded once, handing out the very same [`LoadHandle`] to every caller.
//! Handles can be compared by identity to detect a cache hit without awaiting them.
//!
//! Failed loads are evicted from the cache before their error is observed, so the next
//! [`load`](CachingLoader::load) for that key tries again.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

pub mod config;
pub mod logging;

mod handle;
mod loader;
mod map;

pub use handle::*;
pub use loader::*;
pub use map::*;
