//! Telemetry intake from the flask fleet.
//!
//! Every active flask publishes a stream of multipart frames on its funnel
//! port. This crate owns the bit-exact frame codec, the transport abstraction
//! over the PUB/SUB socket, and the fan-in subscriber that feeds decoded keys
//! into the repository and liveness errors toward the investigator.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod codec;
pub mod subscriber;
pub mod transport;

pub use subscriber::{run_subscriber, NewKey};
pub use transport::{MockTransport, Subscription, Transport};
