//! The lifecycle interpreter: from cloud auto-scaling events to concrete
//! fleet mutations and rebalancing actions.
//!
//! The run loop blocks on the cloud event queue, parses each message, lets
//! the [`Interpreter`](interpreter::Interpreter) mutate the repository and
//! compute an [`Action`](interpreter::Action), pushes the action through the
//! [`DistributeSink`](sink::DistributeSink), and only then acknowledges the
//! message. Re-delivery after a crash is therefore possible and safe: every
//! repository operation involved is idempotent.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod codec;
pub mod interpreter;
pub mod queue;
pub mod run;
pub mod sink;

pub use interpreter::{Action, Interpreter, Outcome};
pub use queue::{EventQueue, MockEventQueue, QueueMessage};
pub use run::{run_lifecycle, LifecycleHandle};
pub use sink::{DistributeSink, FlaskDistributor};
