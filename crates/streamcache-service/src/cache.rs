use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use sentry::{Hub, SentryFutureExt};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::StreamCacheConfig;
use crate::error::{CacheError, ProductionError};
use crate::filestore::Filestore;
use crate::sink::{ProduceFuture, Progress, Sink, run_producer};
use crate::stream::Stream;
use crate::sweeper::{self, Timer, TokioTimer, catch_not_found};
use crate::waiter::{AbortGuard, Waiter};

/// One production, as tracked by the index.
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    waiter: Arc<Waiter>,
    progress: watch::Receiver<Progress>,
    created: Instant,
}

impl Entry {
    /// Opens a new stream over the backing file.
    ///
    /// Fails if the backing file is no longer reachable.
    fn open(&self) -> io::Result<Stream> {
        let file = File::open(&self.path)?;
        Ok(Stream::tail(
            tokio::fs::File::from_std(file),
            self.progress.clone(),
            Arc::clone(&self.waiter),
        ))
    }
}

#[derive(Debug)]
struct Inner {
    index: Mutex<HashMap<String, Arc<Entry>>>,
    filestore: Filestore,
    max_age: Duration,
    shutdown: CancellationToken,
    _stop_sweepers: DropGuard,
}

impl Inner {
    fn index(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes `entry` from the index unless it has already been replaced, and deletes its
    /// backing file.
    fn forget(&self, key: &str, entry: &Arc<Entry>) {
        {
            let mut index = self.index();
            if index.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                index.remove(key);
            }
            metric!(gauge("streamcache.index.entries") = index.len() as u64);
        }
        remove_backing_file(&entry.path);
    }

    /// Removes all entries that reached the maximum age, along with their backing files.
    fn sweep_index(&self) {
        let mut removed = Vec::new();
        {
            let mut index = self.index();
            index.retain(|_, entry| {
                let keep = entry.created.elapsed() < self.max_age;
                if !keep {
                    removed.push(entry.path.clone());
                }
                keep
            });
            metric!(gauge("streamcache.index.entries") = index.len() as u64);
        }

        let mut files_removed: i64 = 0;
        for path in &removed {
            if remove_backing_file(path) {
                files_removed += 1;
            }
        }

        if !removed.is_empty() {
            tracing::debug!("Swept {} stale entries from the index", removed.len());
        }
        metric!(counter("streamcache.sweep.entries_removed") += removed.len() as i64, "sweep" => "index");
        metric!(counter("streamcache.sweep.files_removed") += files_removed, "sweep" => "index");
    }
}

/// Removes a backing file, returning `true` if this call removed it.
fn remove_backing_file(path: &Path) -> bool {
    match catch_not_found(|| std::fs::remove_file(path)) {
        Ok(removed) => removed.is_some(),
        Err(e) => {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to remove cache file: {:?}", e),
            );
            false
        }
    }
}

/// Drops the entry of a production that did not succeed, so that the next caller starts over.
///
/// Streams that are already open keep reading whatever was written.
fn discard(inner: &Weak<Inner>, key: &str, entry: &Arc<Entry>) {
    match inner.upgrade() {
        Some(inner) => inner.forget(key, entry),
        None => {
            remove_backing_file(&entry.path);
        }
    }
}

/// A streaming deduplication cache.
///
/// The cache runs at most one production per key at a time and lets any number of callers
/// read its output while it is being written to a backing file. Handles are cheap to clone and
/// share the same index.
///
/// The cache sweeps stale entries in the background until [`stop`](Self::stop) is called or
/// the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Creates a cache in the configured directory, sweeping it on the tokio clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &StreamCacheConfig) -> io::Result<Self> {
        Self::with_timers(config, Arc::new(TokioTimer), Arc::new(TokioTimer))
    }

    /// Creates a cache whose index and disk sweeps are driven by the given timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timers(
        config: &StreamCacheConfig,
        index_timer: Arc<dyn Timer>,
        disk_timer: Arc<dyn Timer>,
    ) -> io::Result<Self> {
        Self::with_filestore(
            config,
            Filestore::new(&config.dir),
            index_timer,
            disk_timer,
        )
    }

    pub(crate) fn with_filestore(
        config: &StreamCacheConfig,
        filestore: Filestore,
        index_timer: Arc<dyn Timer>,
        disk_timer: Arc<dyn Timer>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(filestore.dir())?;
        tracing::info!("Using stream cache in {}", filestore.dir().display());

        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            index: Mutex::new(HashMap::new()),
            filestore,
            max_age: config.max_age,
            _stop_sweepers: shutdown.clone().drop_guard(),
            shutdown,
        });

        sweeper::spawn_loop(
            "index",
            Arc::downgrade(&inner),
            index_timer,
            config.sweep_interval(),
            inner.shutdown.clone(),
            |inner: Arc<Inner>| async move { inner.sweep_index() },
        );

        sweeper::spawn_loop(
            "disk",
            Arc::downgrade(&inner),
            disk_timer,
            config.disk_sweep_interval(),
            inner.shutdown.clone(),
            |inner: Arc<Inner>| {
                let dir = inner.filestore.root().to_owned();
                let max_age = inner.max_age;
                drop(inner);
                async move {
                    let result = tokio::task::spawn_blocking(move || {
                        sweeper::sweep_directory(&dir, max_age, false)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            tracing::error!(error = &e as &dyn std::error::Error, "Disk sweep failed")
                        }
                        Err(e) => {
                            tracing::error!(error = &e as &dyn std::error::Error, "Disk sweep panicked")
                        }
                    }
                }
            },
        );

        Ok(Self { inner })
    }

    /// Returns a stream over the output of the production for `key`, starting `producer` if
    /// there is none yet.
    ///
    /// The boolean is `true` if this call started a new production. Otherwise, `producer` is
    /// dropped without being called and the stream reads the output of the existing one.
    ///
    /// The production runs in a separate task that is not tied to the returned stream. Its
    /// outcome is available through [`Stream::wait`]. Only failures to set up a new backing
    /// file are returned here.
    ///
    /// Must be called from within a tokio runtime.
    pub fn find_or_create<F>(&self, key: &str, producer: F) -> Result<(Stream, bool), CacheError>
    where
        F: for<'a> FnOnce(&'a mut Sink) -> ProduceFuture<'a> + Send + 'static,
    {
        let mut index = self.inner.index();

        if let Some(entry) = index.get(key) {
            match entry.open() {
                Ok(stream) => {
                    tracing::trace!(key, "Stream cache hit");
                    metric!(counter("streamcache.lookup") += 1, "result" => "hit");
                    return Ok((stream, false));
                }
                Err(e) => {
                    tracing::debug!(
                        key,
                        path = %entry.path.display(),
                        error = &e as &dyn std::error::Error,
                        "Cache file unreachable, recreating"
                    );
                    metric!(counter("streamcache.lookup") += 1, "result" => "storage_miss");
                    index.remove(key);
                }
            }
        } else {
            tracing::trace!(key, "Stream cache miss");
            metric!(counter("streamcache.lookup") += 1, "result" => "miss");
        }

        let (path, file) = self.inner.filestore.create().map_err(|e| {
            metric!(counter("streamcache.lookup") += 1, "result" => "create_error");
            CacheError::Create(e)
        })?;

        let (progress, progress_rx) = watch::channel(Progress::default());
        let entry = Arc::new(Entry {
            path,
            waiter: Arc::new(Waiter::new()),
            progress: progress_rx,
            created: Instant::now(),
        });

        let stream = match entry.open() {
            Ok(stream) => stream,
            Err(e) => {
                remove_backing_file(&entry.path);
                return Err(CacheError::Open(e));
            }
        };

        index.insert(key.to_owned(), Arc::clone(&entry));
        metric!(gauge("streamcache.index.entries") = index.len() as u64);
        drop(index);

        let sink = Sink::file(tokio::fs::File::from_std(file), progress);
        self.spawn_production(key.to_owned(), entry, sink, producer);

        Ok((stream, true))
    }

    fn spawn_production<F>(&self, key: String, entry: Arc<Entry>, mut sink: Sink, producer: F)
    where
        F: for<'a> FnOnce(&'a mut Sink) -> ProduceFuture<'a> + Send + 'static,
    {
        let inner = Arc::downgrade(&self.inner);
        let production = async move {
            let _abort = AbortGuard::new(Arc::clone(&entry.waiter)).on_abort({
                let inner = inner.clone();
                let key = key.clone();
                let entry = Arc::clone(&entry);
                move || discard(&inner, &key, &entry)
            });

            let result = run_producer(&mut sink, producer).await;

            metric!(counter("streamcache.production") += 1, "status" => production_status(&result));
            metric!(counter("streamcache.bytes_written") += sink.bytes_written() as i64);
            metric!(time_raw("streamcache.production.size") = sink.bytes_written());

            if let Err(e) = &result {
                match e {
                    ProductionError::Panicked(_) => tracing::error!(
                        key = key.as_str(),
                        error = e as &dyn std::error::Error,
                        "Stream producer panicked"
                    ),
                    _ => tracing::warn!(
                        key = key.as_str(),
                        error = e as &dyn std::error::Error,
                        "Stream production failed"
                    ),
                }

                discard(&inner, &key, &entry);
            }

            entry.waiter.resolve(result);
        };

        tokio::spawn(production.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// The number of entries currently in the index.
    pub fn entry_count(&self) -> usize {
        self.inner.index().len()
    }

    /// The directory backing files of this cache are created in.
    pub fn dir(&self) -> &Path {
        self.inner.filestore.dir()
    }

    /// Stops the background sweeps.
    ///
    /// The cache can still be used afterwards, but stale entries are no longer removed.
    pub fn stop(&self) {
        tracing::debug!("Stopping stream cache sweeps");
        self.inner.shutdown.cancel();
    }
}

fn production_status(result: &Result<(), ProductionError>) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(ProductionError::Failed(_)) => "failed",
        Err(ProductionError::Panicked(_)) => "panicked",
        Err(ProductionError::Write(_)) => "write_error",
        Err(ProductionError::Close(_)) => "close_error",
        Err(ProductionError::Aborted) => "aborted",
    }
}
