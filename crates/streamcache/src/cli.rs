//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streamcache_service::config::Config;
use streamcache_service::{StreamCache, metrics, sweep_directory};

use crate::exec;
use crate::logging;

/// Streamcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program through the cache and copy its output to stdout.
    Exec {
        /// The cache key. Defaults to a hash of the command line.
        #[arg(long)]
        key: Option<String>,

        /// The program to run, followed by its arguments.
        #[arg(last = true, required = true, value_name = "PROGRAM")]
        argv: Vec<String>,
    },

    /// Remove stale files from the cache directory.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "streamcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is only started below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to set up metrics")?;
    }

    match cli.command {
        Command::Exec { key, argv } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the runtime")?;
            runtime.block_on(async {
                let cache = StreamCache::from_config(&config.stream_cache)
                    .context("failed to set up the stream cache")?;
                let result = exec::exec(&cache, key, argv).await;
                cache.stop();
                result
            })?
        }
        Command::Cleanup { dry_run } => {
            let cache = &config.stream_cache;
            tracing::info!("Cleaning up `{}`", cache.dir.display());
            let stats = sweep_directory(&cache.dir, cache.max_age, dry_run)
                .context("failed to clean up the stream cache")?;
            tracing::info!(
                "Retained {} directories and {} files, totaling {} bytes",
                stats.retained_dirs,
                stats.retained_files,
                stats.retained_bytes,
            );
            tracing::info!(
                "Removed {} directories and {} files, totaling {} bytes",
                stats.removed_dirs,
                stats.removed_files,
                stats.removed_bytes
            );
        }
    }

    Ok(())
}
