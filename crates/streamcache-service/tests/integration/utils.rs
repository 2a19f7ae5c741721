use std::time::Duration;

use streamcache_service::{Stream, StreamCacheConfig};
use streamcache_test as test;

/// Setup tests and create a cache configuration.
///
/// This function returns the configuration of an enabled cache, and its temporary directory.
/// The directory is cleaned up when the [`TempDir`](test::TempDir) instance is dropped. Keep it
/// as guard until the test has finished.
pub fn setup_config(
    update_config: impl FnOnce(&mut StreamCacheConfig),
) -> (StreamCacheConfig, test::TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = StreamCacheConfig {
        enabled: true,
        dir: cache_dir.path().to_owned(),
        max_age: Duration::from_secs(3600),
        ..Default::default()
    };
    update_config(&mut config);

    (config, cache_dir)
}

/// Reads `stream` to the end, and checks that its production succeeded.
pub async fn read_ok(mut stream: Stream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    stream.wait().await.unwrap();
    stream.close();
    out
}
