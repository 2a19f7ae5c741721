//! A streaming deduplication cache.
//!
//! Callers ask for the output of an expensive production by key. The first caller starts the
//! production, which writes into a backing file, and every caller (including the first one)
//! gets a [`Stream`] tailing that file while it is being written. Whether the production
//! succeeded is reported separately through [`Stream::wait`].

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod error;
mod filestore;
pub mod logging;
mod null;
mod sink;
mod stream;
pub mod sweeper;
mod waiter;


use std::io;

pub use cache::Cache;
pub use config::StreamCacheConfig;
pub use error::{CacheError, ProductionError, WaitError};
pub use null::NullCache;
pub use sink::{ProduceFuture, Sink};
pub use stream::Stream;
pub use sweeper::{SweepStats, Timer, TokioTimer, sweep_directory};
pub use waiter::Waiter;

/// Either a real [`Cache`] or a [`NullCache`], depending on configuration.
#[derive(Debug, Clone)]
pub enum StreamCache {
    Enabled(Cache),
    Disabled(NullCache),
}

impl StreamCache {
    /// Creates the cache selected by [`StreamCacheConfig::enabled`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &StreamCacheConfig) -> io::Result<Self> {
        if config.enabled {
            Ok(Self::Enabled(Cache::from_config(config)?))
        } else {
            Ok(Self::Disabled(NullCache::new()))
        }
    }

    /// See [`Cache::find_or_create`].
    pub fn find_or_create<F>(&self, key: &str, producer: F) -> Result<(Stream, bool), CacheError>
    where
        F: for<'a> FnOnce(&'a mut Sink) -> ProduceFuture<'a> + Send + 'static,
    {
        match self {
            Self::Enabled(cache) => cache.find_or_create(key, producer),
            Self::Disabled(cache) => cache.find_or_create(key, producer),
        }
    }

    pub fn stop(&self) {
        match self {
            Self::Enabled(cache) => cache.stop(),
            Self::Disabled(cache) => cache.stop(),
        }
    }
}
