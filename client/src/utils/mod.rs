//! # Client Utilities
//!
//! Small helpers shared across the client.
//!
//! - [`env`] - validated access to environment variables, used when loading
//!   [`ClientSettings`](crate::config::ClientSettings) overrides
//! - [`sync`] - mutex access that survives a poisoned lock
//!
//! ```no_run
//! use client::utils::EnvUtils;
//!
//! if let Some(connection_string) = EnvUtils::get_optional_var("HUBSTREAM_CONNECTION_STRING") {
//!     println!("connecting with {} bytes of connection string", connection_string.len());
//! }
//! ```

pub mod env;
pub mod sync;

pub use env::{EnvUtils, EnvVarError};
