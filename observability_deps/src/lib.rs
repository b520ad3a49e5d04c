//! This crate exists to add a level of indirection between the observability
//! dependencies and the rest of the workspace, so that the version of
//! `tracing` in use is pinned in exactly one place.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
