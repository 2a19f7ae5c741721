use std::sync::Arc;

use sentry::{Hub, SentryFutureExt};

use crate::error::CacheError;
use crate::sink::{ProduceFuture, Sink, run_producer};
use crate::stream::Stream;
use crate::waiter::{AbortGuard, Waiter};

/// How many bytes a producer may run ahead of its reader.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A cache that does not cache.
///
/// Every call runs its own production and streams the output straight to the caller through
/// an in-memory pipe. Nothing is written to disk, and identical requests are not
/// deduplicated. The producer is paced by its reader: once the pipe is full, writes wait until
/// the stream is read, and they fail once the stream is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }

    /// Starts `producer` and returns a stream over its output.
    ///
    /// The boolean is always `true`. Must be called from within a tokio runtime.
    pub fn find_or_create<F>(&self, key: &str, producer: F) -> Result<(Stream, bool), CacheError>
    where
        F: for<'a> FnOnce(&'a mut Sink) -> ProduceFuture<'a> + Send + 'static,
    {
        tracing::trace!(key, "Stream cache disabled, producing directly");

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let waiter = Arc::new(Waiter::new());
        let stream = Stream::pipe(reader, Arc::clone(&waiter));

        let mut sink = Sink::pipe(writer);
        let production = async move {
            let _abort = AbortGuard::new(Arc::clone(&waiter));

            let result = run_producer(&mut sink, producer).await;
            metric!(counter("streamcache.bytes_written") += sink.bytes_written() as i64, "cache" => "null");
            waiter.resolve(result);
        };
        tokio::spawn(production.bind_hub(Hub::new_from_top(Hub::current())));

        Ok((stream, true))
    }

    /// Does nothing, there is nothing running in the background.
    pub fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::error::ProductionError;

    #[tokio::test]
    async fn test_streams_directly() {
        streamcache_test::setup();
        let cache = NullCache::new();

        let (mut stream, created) = cache
            .find_or_create("key", |sink| {
                Box::pin(async move {
                    // larger than the pipe, so the producer has to wait for the reader
                    sink.write_all(&vec![b'x'; 3 * PIPE_CAPACITY]).await?;
                    anyhow::Ok(())
                })
            })
            .unwrap();
        assert!(created);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 3 * PIPE_CAPACITY);
        assert_eq!(stream.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_producer_error() {
        let cache = NullCache::new();

        let (mut stream, created) = cache
            .find_or_create("key", |sink| {
                Box::pin(async move {
                    sink.write_all(b"partial").await?;
                    Err::<(), _>(anyhow::anyhow!("broken"))
                })
            })
            .unwrap();
        assert!(created);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"partial");
        assert_eq!(
            stream.wait().await,
            Err(ProductionError::Failed("broken".into()))
        );
    }

    #[tokio::test]
    async fn test_dropped_stream() {
        let cache = NullCache::new();

        let (stream, _) = cache
            .find_or_create("key", |sink| {
                Box::pin(async move {
                    sink.write_all(&vec![0; 2 * PIPE_CAPACITY]).await?;
                    anyhow::Ok(())
                })
            })
            .unwrap();

        let waiter = stream.waiter();
        stream.close();

        // the producer is not stuck writing into a pipe nobody reads
        assert!(matches!(waiter.wait().await, Err(ProductionError::Write(_))));
    }
}
