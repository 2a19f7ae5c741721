use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Creates a new, empty backing file at the given path, opened for writing.
pub(crate) type CreateFile = Arc<dyn Fn(&Path) -> io::Result<File> + Send + Sync>;

/// Names of backing files are unique within the process, even across cache instances.
static NEXT_FILE: AtomicU64 = AtomicU64::new(0);

/// Allocates backing files below the cache directory.
///
/// Every store writes into its own subdirectory named by a random instance id, so that multiple
/// caches can share one directory. File names are derived from a counter and are unrelated to
/// cache keys:
///
/// ```text
/// <root>/<instance-id>/<counter % 256>/<counter>
/// ```
pub(crate) struct Filestore {
    root: PathBuf,
    dir: PathBuf,
    create_file: CreateFile,
}

impl Filestore {
    pub fn new(root: &Path) -> Self {
        let instance = uuid::Uuid::new_v4();
        Self {
            root: root.to_owned(),
            dir: root.join(instance.simple().to_string()),
            create_file: Arc::new(create_new),
        }
    }

    /// Replaces the function that creates backing files.
    #[cfg(test)]
    pub fn with_create_file(mut self, create_file: CreateFile) -> Self {
        self.create_file = create_file;
        self
    }

    /// The directory shared with other instances.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory this store creates files in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a new backing file and returns its path along with a handle open for writing.
    pub fn create(&self) -> io::Result<(PathBuf, File)> {
        let n = NEXT_FILE.fetch_add(1, Ordering::Relaxed);
        let bucket = self.dir.join(format!("{:02x}", n % 256));
        let path = bucket.join(format!("{n:016x}"));

        // The sweeper removes empty directories, potentially the ones we are about to create a
        // file in, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&bucket) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", bucket.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match (self.create_file)(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::NotFound && retries <= MAX_RETRIES => {
                    tracing::debug!("Cache directory vanished, retrying: {}", bucket.display());
                }
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    return Err(e);
                }
            }
        }
    }
}

impl fmt::Debug for Filestore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filestore").field("dir", &self.dir).finish()
    }
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}
