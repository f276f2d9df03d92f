//! Rescache.
//!
//! A command line tool that polls an expiring JSON resource through a
//! [`ResourceCache`](resource_cache::ResourceCache), showing how concurrent requests are
//! coalesced into single fetches and refreshed ahead of expiration.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod config;
mod logging;
mod watch;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
