//! Mediacache.
//!
//! Command line front end to the media cache. It resolves media locators (HTTP URLs, local
//! paths and content locators) into local files, fetching each of them at most once, and
//! maintains the cache's work directory.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
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
