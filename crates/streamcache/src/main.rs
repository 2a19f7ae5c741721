//! Streamcache.
//!
//! Runs programs through a streaming deduplication cache: concurrent requests for the output of
//! the same command line are served from a single execution, while it is still running.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod exec;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
