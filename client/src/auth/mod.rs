//! Credentials for opening connections.
//!
//! A connection string is parsed into a [`ConnectionStringBuilder`]; the
//! shared access key it carries is turned into a short-lived SAS token by
//! [`SasTokenGenerator`] each time a connection is opened.

pub mod connection_string;
pub mod sas_token_generator;

pub use connection_string::ConnectionStringBuilder;
pub use sas_token_generator::SasTokenGenerator;
