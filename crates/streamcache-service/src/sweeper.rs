//! Background removal of stale cache entries.
//!
//! The cache runs two independent loops. The index sweep drops entries from the in-memory
//! index once they reach the maximum age and deletes their backing files. The disk sweep walks
//! the whole cache directory and deletes every file whose modification time is older than the
//! maximum age, which also catches files left behind by previous processes.
//!
//! Streams that are still reading a removed file are not affected, as they hold their own open
//! handle to it.

use std::fs::{read_dir, remove_dir, remove_file};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The time source for the sweep loops.
pub trait Timer: Send + Sync + 'static {
    /// Returns a future that completes once `duration` has passed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// A [`Timer`] backed by [`tokio::time::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Spawns a loop that runs `pass` on `target` immediately and then once every `interval`.
///
/// The loop ends when `token` is cancelled or `target` has been dropped. `pass` receives a
/// strong reference only for the duration of a single pass.
pub(crate) fn spawn_loop<T, F, Fut>(
    name: &'static str,
    target: Weak<T>,
    timer: Arc<dyn Timer>,
    interval: Duration,
    token: CancellationToken,
    pass: F,
) where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let Some(target) = target.upgrade() else {
                break;
            };
            tracing::trace!("Running {name} sweep");
            pass(target).await;

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = timer.sleep(interval) => {}
            }
        }
        tracing::debug!("Stopped {name} sweep");
    });
}

/// Statistics of a single sweep over a cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Removes all files below `dir` that were last modified at least `max_age` ago, along with
/// directories that end up empty.
///
/// `dir` itself is never removed. If `dry_run` is `true`, nothing is actually deleted, but the
/// returned stats reflect what would have been.
pub fn sweep_directory(dir: &Path, max_age: Duration, dry_run: bool) -> io::Result<SweepStats> {
    let mut stats = SweepStats::default();
    sweep_directory_recursive(dir, max_age, &mut stats, dry_run)?;

    tracing::debug!(
        "Retained {} directories and {} files, totaling {} bytes",
        stats.retained_dirs,
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::debug!(
        "Removed {} directories and {} files, totaling {} bytes",
        stats.removed_dirs,
        stats.removed_files,
        stats.removed_bytes
    );

    if !dry_run {
        metric!(counter("streamcache.sweep.files_removed") += stats.removed_files as i64, "sweep" => "disk");
        metric!(counter("streamcache.sweep.bytes_removed") += stats.removed_bytes as i64, "sweep" => "disk");
    }

    Ok(stats)
}

/// Sweeps `directory` recursively, returning `true` if it is left empty.
fn sweep_directory_recursive(
    directory: &Path,
    max_age: Duration,
    stats: &mut SweepStats,
    dry_run: bool,
) -> io::Result<bool> {
    let entries = match catch_not_found(|| read_dir(directory))? {
        Some(x) => x,
        None => {
            tracing::debug!("Directory not found: `{}`", directory.display());
            return Ok(true);
        }
    };

    let mut is_empty = true;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            let mut dir_is_empty = sweep_directory_recursive(&path, max_age, stats, dry_run)?;
            if dir_is_empty && !dry_run {
                tracing::trace!("Removing directory `{}`", path.display());
                match catch_not_found(|| remove_dir(&path)) {
                    Ok(_) => {}
                    // a new backing file was created in the meantime
                    Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => dir_is_empty = false,
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to remove cache directory: {:?}", e),
                        );
                        dir_is_empty = false;
                    }
                }
            }
            if dir_is_empty {
                stats.removed_dirs += 1;
            } else {
                stats.retained_dirs += 1;
            }
            is_empty &= dir_is_empty;
        } else {
            match try_sweep_file(&path, max_age, stats, dry_run) {
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to remove cache file: {:?}", e),
                    );
                    is_empty = false;
                }
                Ok(file_removed) => is_empty &= file_removed,
            }
        }
    }

    Ok(is_empty)
}

/// Removes the file at `path` if it is old enough, returning `true` if it is gone.
fn try_sweep_file(
    path: &Path,
    max_age: Duration,
    stats: &mut SweepStats,
    dry_run: bool,
) -> io::Result<bool> {
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(true);
    };
    let size = metadata.len();

    // A modification time in the future counts as brand new.
    let age = SystemTime::now()
        .duration_since(metadata.modified()?)
        .unwrap_or_default();

    if age >= max_age {
        tracing::trace!("Removing file `{}`", path.display());
        if !dry_run {
            catch_not_found(|| remove_file(path))?;
        }

        stats.removed_bytes += size;
        stats.removed_files += 1;

        return Ok(true);
    }
    stats.retained_bytes += size;
    stats.retained_files += 1;

    Ok(false)
}

/// Runs `f`, turning a [`NotFound`](io::ErrorKind::NotFound) error into `None`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
