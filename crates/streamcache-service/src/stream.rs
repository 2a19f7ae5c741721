use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ProductionError, WaitError};
use crate::sink::Progress;
use crate::waiter::Waiter;

/// A caller's read handle onto the bytes of one cache entry.
///
/// The stream yields everything the producer writes, in order, starting at offset zero, and
/// independently of any other stream on the same entry. Reading never fails because of the
/// production itself: once the producer is done, successful or not, the stream simply ends.
/// Call [`wait`](Self::wait) after reaching the end of the stream to find out whether the
/// production actually succeeded.
pub struct Stream {
    reader: Reader,
    waiter: Arc<Waiter>,
    bytes_read: u64,
}

enum Reader {
    File(FileTail),
    Pipe(DuplexStream),
}

/// Tails a backing file that may still be growing.
///
/// The stream holds its own open handle, so it keeps working even when the file is removed
/// from the cache directory.
struct FileTail {
    file: File,
    offset: u64,
    progress: watch::Receiver<Progress>,
}

impl FileTail {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Progress { written, finished } = *self.progress.borrow_and_update();

            if self.offset < written {
                let available = usize::try_from(written - self.offset).unwrap_or(usize::MAX);
                let len = buf.len().min(available);
                let n = self.file.read(&mut buf[..len]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "cache file is shorter than the amount of bytes written to it",
                    ));
                }
                self.offset += n as u64;
                return Ok(n);
            }

            if finished {
                return Ok(0);
            }

            if self.progress.changed().await.is_err() {
                // The production task went away without finishing, so nothing will be
                // written anymore. `wait` reports this as an aborted production.
                return Ok(0);
            }
        }
    }
}

impl Stream {
    pub(crate) fn tail(file: File, progress: watch::Receiver<Progress>, waiter: Arc<Waiter>) -> Self {
        Self::new(
            Reader::File(FileTail {
                file,
                offset: 0,
                progress,
            }),
            waiter,
        )
    }

    pub(crate) fn pipe(pipe: DuplexStream, waiter: Arc<Waiter>) -> Self {
        Self::new(Reader::Pipe(pipe), waiter)
    }

    fn new(reader: Reader, waiter: Arc<Waiter>) -> Self {
        Self {
            reader,
            waiter,
            bytes_read: 0,
        }
    }

    /// Reads the next bytes of the stream into `buf`.
    ///
    /// If no bytes are available yet, this waits until the producer writes more or finishes.
    /// Returns `Ok(0)` at the end of the stream, or if `buf` is empty.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = match &mut self.reader {
            Reader::File(tail) => tail.read(buf).await?,
            Reader::Pipe(pipe) => pipe.read(buf).await?,
        };
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Reads the remainder of the stream, appending it to `out`.
    ///
    /// Returns the number of bytes appended.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut buf = vec![0; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// The number of bytes read from this stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Waits for the production backing this stream to finish and returns its result.
    pub async fn wait(&self) -> Result<(), ProductionError> {
        self.waiter.wait().await
    }

    /// Like [`wait`](Self::wait), but gives up once `token` is cancelled.
    ///
    /// Cancelling only affects this call, and never the production itself.
    pub async fn wait_with_cancel(&self, token: &CancellationToken) -> Result<(), WaitError> {
        self.waiter.wait_with_cancel(token).await
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        self.waiter.wait_timeout(timeout).await
    }

    #[cfg(test)]
    pub(crate) fn waiter(&self) -> Arc<Waiter> {
        Arc::clone(&self.waiter)
    }

    /// Releases this stream.
    ///
    /// This is the same as dropping it. The producer and all other streams on the same entry
    /// are unaffected.
    pub fn close(self) {}
}

impl Drop for Stream {
    fn drop(&mut self) {
        metric!(counter("streamcache.bytes_read") += self.bytes_read as i64);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Stream");
        match &self.reader {
            Reader::File(tail) => s.field("offset", &tail.offset),
            Reader::Pipe(_) => s.field("backing", &"pipe"),
        };
        s.field("bytes_read", &self.bytes_read)
            .field("waiter", &self.waiter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_tail_growing_file() {
        streamcache_test::setup();
        let dir = streamcache_test::tempdir();
        let path = dir.path().join("growing");
        let mut writer = std::fs::File::create(&path).unwrap();

        let (progress, rx) = watch::channel(Progress::default());
        let waiter = Arc::new(Waiter::new());
        let file = File::open(&path).await.unwrap();
        let mut stream = Stream::tail(file, rx, Arc::clone(&waiter));

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            (stream, out)
        });

        for chunk in [&b"hello"[..], b", ", b"world"] {
            writer.write_all(chunk).unwrap();
            progress.send_modify(|p| p.written += chunk.len() as u64);
            tokio::task::yield_now().await;
        }
        assert!(!reader.is_finished());

        // bytes beyond the published progress are never handed out
        writer.write_all(b"unpublished").unwrap();
        progress.send_modify(|p| p.finished = true);
        waiter.resolve(Err(ProductionError::Failed("test".into())));

        let (stream, out) = reader.await.unwrap();
        assert_eq!(out, b"hello, world");
        assert_eq!(stream.bytes_read(), 12);
        assert_eq!(
            stream.wait().await,
            Err(ProductionError::Failed("test".into()))
        );
    }

    #[tokio::test]
    async fn test_tail_survives_removal() {
        let dir = streamcache_test::tempdir();
        let path = dir.path().join("removed");
        std::fs::write(&path, b"still here").unwrap();

        let (progress, rx) = watch::channel(Progress {
            written: 10,
            finished: true,
        });
        let file = File::open(&path).await.unwrap();
        let mut stream = Stream::tail(file, rx, Arc::new(Waiter::new()));
        drop(progress);

        std::fs::remove_file(&path).unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"still here");
    }

    #[tokio::test]
    async fn test_tail_abandoned_production() {
        let dir = streamcache_test::tempdir();
        let path = dir.path().join("abandoned");
        std::fs::write(&path, b"").unwrap();

        let (progress, rx) = watch::channel(Progress::default());
        let file = File::open(&path).await.unwrap();
        let mut stream = Stream::tail(file, rx, Arc::new(Waiter::new()));

        drop(progress);
        let mut buf = [0; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
