use std::process::Stdio;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use streamcache_service::StreamCache;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs `argv` through `cache` and copies its output to stdout.
///
/// Fails if the program could not be run or did not exit successfully, which is only known
/// once its output has been copied entirely.
pub async fn exec(cache: &StreamCache, key: Option<String>, argv: Vec<String>) -> Result<()> {
    let key = key.unwrap_or_else(|| default_key(&argv));
    let (program, args) = argv.split_first().context("no program given")?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true);
    let display = argv.join(" ");

    let (mut stream, created) = cache.find_or_create(&key, move |sink| {
        Box::pin(async move {
            let mut child = command
                .spawn()
                .with_context(|| format!("failed to run `{display}`"))?;
            let mut stdout = child.stdout.take().context("missing stdout pipe")?;
            tokio::io::copy(&mut stdout, sink)
                .await
                .context("failed to copy program output")?;

            let status = child.wait().await?;
            anyhow::ensure!(status.success(), "`{display}` failed with {status}");
            anyhow::Ok(())
        })
    })?;
    tracing::debug!(key = key.as_str(), created, "Streaming program output");

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
    }
    stdout.flush().await?;

    stream.wait().await.context("production failed")?;
    Ok(())
}

/// Derives a cache key from a command line.
fn default_key(argv: &[String]) -> String {
    let mut hasher = Sha256::new();
    for arg in argv {
        hasher.update(arg.as_bytes());
        // separate arguments, so that `a bc` and `ab c` differ
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}
