use streamcache_service::{NullCache, StreamCache};
use streamcache_test::assert_file_count;
use tokio::io::AsyncWriteExt;

use crate::{read_ok, setup_config};

const CONTENT: &[u8] = b"hello world";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_caller_produces() {
    let cache = NullCache::new();

    let tasks: Vec<_> = (0..1000)
        .map(|_| {
            tokio::spawn(async move {
                let (stream, created) = cache
                    .find_or_create("k", |sink| {
                        Box::pin(async move {
                            // one byte at a time, to interleave with reading
                            for byte in CONTENT {
                                sink.write_all(&[*byte]).await?;
                            }
                            anyhow::Ok(())
                        })
                    })
                    .unwrap();
                assert!(created);
                read_ok(stream).await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), CONTENT);
    }
}

#[tokio::test]
async fn test_disabled_config() {
    let (config, cache_dir) = setup_config(|config| config.enabled = false);
    let cache = StreamCache::from_config(&config).unwrap();
    assert!(matches!(cache, StreamCache::Disabled(_)));

    for _ in 0..2 {
        let (stream, created) = cache
            .find_or_create("k", |sink| {
                Box::pin(async move {
                    sink.write_all(CONTENT).await?;
                    anyhow::Ok(())
                })
            })
            .unwrap();
        assert!(created);
        assert_eq!(read_ok(stream).await, CONTENT);
    }

    // nothing touches the disk
    assert_file_count(cache_dir.path(), 0);
    cache.stop();
}
