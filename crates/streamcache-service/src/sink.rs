use std::any::Any;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use crate::error::ProductionError;

/// The future returned by a producer.
pub type ProduceFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// How far production of a backing file has progressed.
///
/// Readers tail the file up to `written` bytes, and treat reaching that point as the end of
/// the stream once `finished` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    pub written: u64,
    pub finished: bool,
}

/// The write end handed to a producer.
///
/// Everything written into the sink becomes visible to all streams of the same entry, in
/// order. Use it through [`AsyncWriteExt`], or pass it to [`tokio::io::copy`].
pub struct Sink {
    inner: SinkInner,
    bytes_written: u64,
    /// The first write failure, kept in case the producer swallows it.
    write_error: Option<String>,
}

enum SinkInner {
    File(FileSink),
    Pipe(DuplexStream),
}

struct FileSink {
    file: File,
    progress: watch::Sender<Progress>,
    /// Bytes accepted by the last `poll_write` on `file` that have not been flushed yet.
    unflushed: Option<usize>,
}

impl FileSink {
    fn publish(&self, n: usize) {
        self.progress.send_modify(|p| p.written += n as u64);
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        // Bytes are only reported as written once they reached the file, because readers open
        // their own handles and would otherwise observe a short file.
        loop {
            if let Some(n) = self.unflushed {
                let flushed = ready!(Pin::new(&mut self.file).poll_flush(cx));
                self.unflushed = None;
                flushed?;
                self.publish(n);
                return Poll::Ready(Ok(n));
            }

            let n = ready!(Pin::new(&mut self.file).poll_write(cx, buf))?;
            if n == 0 {
                return Poll::Ready(Ok(0));
            }
            self.unflushed = Some(n);
        }
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let flushed = ready!(Pin::new(&mut self.file).poll_flush(cx));
        if let Some(n) = self.unflushed.take() {
            if flushed.is_ok() {
                self.publish(n);
            }
        }
        Poll::Ready(flushed)
    }
}

impl Sink {
    pub(crate) fn file(file: File, progress: watch::Sender<Progress>) -> Self {
        Self::new(SinkInner::File(FileSink {
            file,
            progress,
            unflushed: None,
        }))
    }

    pub(crate) fn pipe(pipe: DuplexStream) -> Self {
        Self::new(SinkInner::Pipe(pipe))
    }

    fn new(inner: SinkInner) -> Self {
        Self {
            inner,
            bytes_written: 0,
            write_error: None,
        }
    }

    /// The number of bytes successfully written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn record<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(ref err) = result {
            self.write_error.get_or_insert_with(|| err.to_string());
        }
        result
    }

    /// Closes the sink for writing and signals the end of the stream to all readers.
    ///
    /// The backing file is synced to disk, so that deferred storage errors are reported here.
    /// Readers are released even if closing fails.
    async fn close(&mut self) -> io::Result<()> {
        match &mut self.inner {
            SinkInner::File(sink) => {
                let mut result = futures::future::poll_fn(|cx| sink.poll_flush(cx)).await;
                if result.is_ok() {
                    result = sink.file.sync_all().await;
                }
                sink.progress.send_modify(|p| p.finished = true);
                result
            }
            SinkInner::Pipe(pipe) => pipe.shutdown().await,
        }
    }
}

impl AsyncWrite for Sink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = ready!(match &mut this.inner {
            SinkInner::File(sink) => sink.poll_write(cx, buf),
            SinkInner::Pipe(pipe) => Pin::new(pipe).poll_write(cx, buf),
        });
        let result = this.record(result);
        if let Ok(n) = result {
            this.bytes_written += n as u64;
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(match &mut this.inner {
            SinkInner::File(sink) => sink.poll_flush(cx),
            SinkInner::Pipe(pipe) => Pin::new(pipe).poll_flush(cx),
        });
        Poll::Ready(this.record(result))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The sink is closed by the cache once the producer returns, so shutting it down early
        // only makes sure everything is flushed.
        self.poll_flush(cx)
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match self.inner {
            SinkInner::File(_) => "file",
            SinkInner::Pipe(_) => "pipe",
        };
        f.debug_struct("Sink")
            .field("backing", &backing)
            .field("bytes_written", &self.bytes_written)
            .field("write_error", &self.write_error)
            .finish()
    }
}

/// Runs `producer` against `sink` and closes the sink afterwards.
///
/// Errors and panics of the producer are turned into a [`ProductionError`]. Storage failures
/// take precedence over the producer's own error, as producers usually just forward them.
pub(crate) async fn run_producer<F>(sink: &mut Sink, producer: F) -> Result<(), ProductionError>
where
    F: for<'a> FnOnce(&'a mut Sink) -> ProduceFuture<'a> + Send + 'static,
{
    let outcome = AssertUnwindSafe(async { producer(&mut *sink).await })
        .catch_unwind()
        .await;
    let closed = sink.close().await;

    let result = match outcome {
        Err(payload) => Err(ProductionError::Panicked(panic_message(&*payload))),
        Ok(result) => match (sink.write_error.take(), result) {
            (Some(write_error), _) => Err(ProductionError::Write(write_error)),
            (None, Err(err)) => Err(ProductionError::Failed(format!("{err:#}"))),
            (None, Ok(())) => Ok(()),
        },
    };

    result.and(closed.map_err(|e| ProductionError::Close(e.to_string())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
