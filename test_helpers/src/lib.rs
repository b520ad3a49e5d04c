//! Utilities shared by the workspace's test suites.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs, clippy::use_self)]

use tracing_subscriber::{fmt, EnvFilter};

/// Start tracing output for a test if `LOG_FILTER` (or `RUST_LOG`) is set.
///
/// Safe to call from every test; only the first caller installs a subscriber.
pub fn maybe_start_logging() {
    if std::env::var("LOG_FILTER").is_ok() || std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally start test logging at the configured filter level.
pub fn start_logging() {
    let filter = EnvFilter::try_from_env("LOG_FILTER")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    // A global default may already be installed by a sibling test; that one wins.
    let _ = tracing_log::LogTracer::init();
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
