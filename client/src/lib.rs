//! # Hubstream Client Library
//!
//! Event-stream partition receiver over AMQP 1.0 links.
//! A [`MessagingFactory`] owns the connection to a namespace and the reactor
//! that runs engine callbacks and timers; each [`MessageReceiver`] reads one
//! partition, keeping link credit topped up and recovering from transient
//! link failures according to a [`RetryPolicy`](retry::RetryPolicy).
//!
//! ## Modules
//!
//! - [`amqp`] - Engine capability traits and an in-memory engine
//! - [`auth`] - Connection strings and SAS token generation
//! - [`common`] - Errors, timeout tracking and work items
//! - [`config`] - Client settings, defaults and limits
//! - [`factory`] - Connection ownership shared by receivers
//! - [`reactor`] - Single-threaded event loop for callbacks and timers
//! - [`receiver`] - The partition receiver
//! - [`retry`] - Retry policies and exponential backoff
//! - [`utils`] - Utility functions and helpers

pub mod amqp;
pub mod auth;
pub mod common;
pub mod config;
pub mod factory;
pub mod reactor;
pub mod receiver;
pub mod retry;
pub mod utils;

pub use factory::{ConnectionParameters, MessagingFactory};
pub use reactor::Reactor;
pub use receiver::{MessageReceiver, ReceiveHandler, ReceiverOptions, StartPosition};
