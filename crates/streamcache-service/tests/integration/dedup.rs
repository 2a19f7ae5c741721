use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use streamcache_service::{Cache, StreamCache};
use streamcache_test::assert_file_count;
use tokio::io::AsyncWriteExt;
use tokio::sync::Barrier;

use crate::{read_ok, setup_config};

#[tokio::test]
async fn test_hit_returns_first_output() {
    let (config, cache_dir) = setup_config(|_| {});
    let cache = Cache::from_config(&config).unwrap();

    let (stream, created) = cache
        .find_or_create("k", |sink| {
            Box::pin(async move {
                sink.write_all(b"hello").await?;
                anyhow::Ok(())
            })
        })
        .unwrap();
    assert!(created);
    assert_eq!(read_ok(stream).await, b"hello");

    let (stream, created) = cache
        .find_or_create("k", |sink| {
            Box::pin(async move {
                sink.write_all(b"world").await?;
                anyhow::Ok(())
            })
        })
        .unwrap();
    assert!(!created);
    assert_eq!(read_ok(stream).await, b"hello");

    assert_file_count(cache_dir.path(), 1);
    cache.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_production() {
    let (config, cache_dir) = setup_config(|_| {});
    let cache = Cache::from_config(&config).unwrap();
    let productions = Arc::new(AtomicUsize::new(0));
    // all callers start together, so they race for the same production
    let start = Arc::new(Barrier::new(1000));

    let mut tasks = Vec::new();
    for _ in 0..1000 {
        let mut payload = vec![0u8; 4096];
        rand::rng().fill(&mut payload[..]);

        let cache = cache.clone();
        let productions = Arc::clone(&productions);
        let start = Arc::clone(&start);
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            let (stream, created) = cache
                .find_or_create("k", move |sink| {
                    Box::pin(async move {
                        productions.fetch_add(1, Ordering::SeqCst);
                        sink.write_all(&payload).await?;
                        anyhow::Ok(())
                    })
                })
                .unwrap();
            (created, read_ok(stream).await)
        }));
    }

    let mut created_count = 0;
    let mut outputs = Vec::new();
    for task in tasks {
        let (created, output) = task.await.unwrap();
        created_count += usize::from(created);
        outputs.push(output);
    }

    assert_eq!(created_count, 1);
    assert_eq!(productions.load(Ordering::SeqCst), 1);
    assert_eq!(outputs[0].len(), 4096);
    assert!(outputs.iter().all(|output| *output == outputs[0]));
    assert_file_count(cache_dir.path(), 1);
}

#[tokio::test]
async fn test_instances_share_directory() {
    let (config, cache_dir) = setup_config(|_| {});

    let caches: Vec<_> = (0..100)
        .map(|_| Cache::from_config(&config).unwrap())
        .collect();

    for (i, cache) in caches.iter().enumerate() {
        let (stream, created) = cache
            .find_or_create("k", move |sink| {
                Box::pin(async move {
                    sink.write_all(format!("instance {i}").as_bytes()).await?;
                    anyhow::Ok(())
                })
            })
            .unwrap();
        assert!(created);
        assert_eq!(read_ok(stream).await, format!("instance {i}").as_bytes());
    }

    for (i, cache) in caches.iter().enumerate() {
        assert_ne!(cache.dir(), caches[(i + 1) % caches.len()].dir());
        let (stream, created) = cache
            .find_or_create("k", |_sink| {
                Box::pin(async move { Err::<(), _>(anyhow::anyhow!("not a hit")) })
            })
            .unwrap();
        assert!(!created);
        assert_eq!(read_ok(stream).await, format!("instance {i}").as_bytes());
    }

    assert_file_count(cache_dir.path(), 100);
}

#[tokio::test]
async fn test_from_config() {
    let (config, cache_dir) = setup_config(|_| {});
    let cache = StreamCache::from_config(&config).unwrap();
    assert!(matches!(cache, StreamCache::Enabled(_)));

    let (stream, created) = cache
        .find_or_create("k", |sink| {
            Box::pin(async move {
                sink.write_all(b"cached").await?;
                anyhow::Ok(())
            })
        })
        .unwrap();
    assert!(created);
    assert_eq!(read_ok(stream).await, b"cached");
    assert_file_count(cache_dir.path(), 1);
    cache.stop();
}
