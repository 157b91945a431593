//! Partition receiver.
//!
//! [`MessageReceiver`] owns one receive link at a time and hides link
//! failures from the application: transient errors replace the link after a
//! backoff, resuming from the last delivered offset. Batches reach the
//! application through [`MessageReceiver::receive`] or a registered
//! [`ReceiveHandler`].

mod completion;
mod handler;
mod link_callbacks;
mod message_receiver;
mod options;
mod state;

pub use completion::{CloseFuture, OpenFuture, ReceiveFuture};
pub use handler::ReceiveHandler;
pub use message_receiver::MessageReceiver;
pub use options::{ReceiverOptions, START_OF_STREAM, StartPosition};
pub use state::LinkLifecycle;
