//! Helpers for testing the stream cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache will silently recreate
//!    the directory and leak it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).

use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `streamcache` crates and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "streamcache_service=trace,streamcache=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns all regular files below `dir`, recursively and sorted.
///
/// A missing directory counts as empty.
pub fn list_files(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, files);
            } else {
                files.push(path);
            }
        }
    }

    let mut files = Vec::new();
    walk(dir.as_ref(), &mut files);
    files.sort();
    files
}

/// Asserts that exactly `n` regular files exist below `dir`.
#[track_caller]
pub fn assert_file_count(dir: impl AsRef<Path>, n: usize) {
    let files = list_files(dir);
    assert_eq!(files.len(), n, "unexpected cache files: {files:?}");
}
