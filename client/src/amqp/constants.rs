//! Well-known AMQP symbols used on the receive path.

/// Filter key for SQL-like string selectors on the link source.
pub const STRING_FILTER: &str = "apache.org:selector-filter:string";

/// Link property asserting exclusive ownership of a partition.
pub const EPOCH: &str = "com.microsoft:epoch";

pub const OFFSET_ANNOTATION: &str = "x-opt-offset";
pub const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";

/// Error condition symbols the client recognizes.
pub mod error_symbols {
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const LINK_STOLEN: &str = "amqp:link:stolen";
    pub const LINK_DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const CONNECTION_FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const TIMEOUT: &str = "com.microsoft:timeout";
    pub const SERVER_BUSY: &str = "com.microsoft:server-busy";
    pub const ARGUMENT_ERROR: &str = "com.microsoft:argument-error";
    pub const ARGUMENT_OUT_OF_RANGE: &str = "com.microsoft:argument-out-of-range";
}
