use crate::amqp::{ErrorCondition, constants::error_symbols};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the messaging client.
///
/// Errors fall into four groups:
///
/// ## Transient service errors
/// - [`ServerBusy`], [`ServiceTimeout`], [`LinkDetached`], [`ConnectionLost`]
/// - [`Service`] when the service flagged the condition as transient
///
/// These are eligible for retry through the configured
/// [`RetryPolicy`](crate::retry::RetryPolicy).
///
/// ## Permanent service errors
/// - [`Unauthorized`], [`EntityNotFound`], [`ReceiverDisconnected`],
///   [`QuotaExceeded`], non-transient [`Service`] errors
///
/// ## Local errors
/// - [`OperationTimeout`] - an open or close deadline fired locally
/// - [`InvalidArgument`], [`InvalidOperation`] - usage errors
/// - [`ClientClosed`], [`Configuration`], [`Authentication`], [`Handler`],
///   [`Internal`]
///
/// # Examples
///
/// ```no_run
/// use client::common::MessagingError;
///
/// fn describe(error: &MessagingError) -> &'static str {
///     if error.is_transient() {
///         "retry later"
///     } else {
///         "give up"
///     }
/// }
/// ```
///
/// [`ServerBusy`]: MessagingError::ServerBusy
/// [`ServiceTimeout`]: MessagingError::ServiceTimeout
/// [`LinkDetached`]: MessagingError::LinkDetached
/// [`ConnectionLost`]: MessagingError::ConnectionLost
/// [`Service`]: MessagingError::Service
/// [`Unauthorized`]: MessagingError::Unauthorized
/// [`EntityNotFound`]: MessagingError::EntityNotFound
/// [`ReceiverDisconnected`]: MessagingError::ReceiverDisconnected
/// [`QuotaExceeded`]: MessagingError::QuotaExceeded
/// [`OperationTimeout`]: MessagingError::OperationTimeout
/// [`InvalidArgument`]: MessagingError::InvalidArgument
/// [`InvalidOperation`]: MessagingError::InvalidOperation
/// [`ClientClosed`]: MessagingError::ClientClosed
/// [`Configuration`]: MessagingError::Configuration
/// [`Authentication`]: MessagingError::Authentication
/// [`Handler`]: MessagingError::Handler
/// [`Internal`]: MessagingError::Internal
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessagingError {
    /// The service is throttling this client.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// The service reported that an operation timed out on its side.
    #[error("Service timeout: {0}")]
    ServiceTimeout(String),

    /// The link was detached by the peer without a more specific reason.
    #[error("Link detached: {0}")]
    LinkDetached(String),

    /// The underlying connection was dropped or forced closed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Any other condition reported by the service.
    #[error("Service error {condition}: {description}")]
    Service {
        condition: String,
        description: String,
        transient: bool,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Another receiver with a higher epoch took ownership of the partition.
    #[error("Receiver disconnected: {0}")]
    ReceiverDisconnected(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A local open/close deadline expired before the peer answered.
    ///
    /// This is distinct from [`MessagingError::ServiceTimeout`] and is never
    /// retried for the operation that produced it.
    #[error("{operation} did not complete within {timeout:?}")]
    OperationTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call is not valid in the current state of the client.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Client closed: {0}")]
    ClientClosed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A registered receive handler failed while processing a batch.
    #[error("Receive handler failed: {0}")]
    Handler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MessagingError {
    /// Translate an AMQP error condition reported by the engine.
    pub fn from_condition(condition: &ErrorCondition) -> Self {
        let description = condition
            .description
            .clone()
            .unwrap_or_else(|| condition.condition.clone());

        match condition.condition.as_str() {
            error_symbols::UNAUTHORIZED_ACCESS => MessagingError::Unauthorized(description),
            error_symbols::NOT_FOUND => MessagingError::EntityNotFound(description),
            error_symbols::LINK_STOLEN => MessagingError::ReceiverDisconnected(description),
            error_symbols::TIMEOUT => MessagingError::ServiceTimeout(description),
            error_symbols::SERVER_BUSY => MessagingError::ServerBusy(description),
            error_symbols::RESOURCE_LIMIT_EXCEEDED => MessagingError::QuotaExceeded(description),
            error_symbols::LINK_DETACH_FORCED | error_symbols::LINK_REDIRECT => {
                MessagingError::LinkDetached(description)
            }
            error_symbols::CONNECTION_FORCED | error_symbols::CONNECTION_FRAMING_ERROR => {
                MessagingError::ConnectionLost(description)
            }
            error_symbols::ARGUMENT_ERROR | error_symbols::ARGUMENT_OUT_OF_RANGE => {
                MessagingError::InvalidArgument(description)
            }
            error_symbols::NOT_ALLOWED | error_symbols::NOT_IMPLEMENTED => {
                MessagingError::InvalidOperation(description)
            }
            error_symbols::INTERNAL_ERROR => MessagingError::Service {
                condition: condition.condition.clone(),
                description,
                transient: true,
            },
            other => MessagingError::Service {
                condition: other.to_string(),
                description,
                transient: false,
            },
        }
    }

    /// Whether the error is a recognized transient protocol or service error.
    pub fn is_transient(&self) -> bool {
        match self {
            MessagingError::ServerBusy(_)
            | MessagingError::ServiceTimeout(_)
            | MessagingError::LinkDetached(_)
            | MessagingError::ConnectionLost(_) => true,
            MessagingError::Service { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        matches!(self, MessagingError::ServerBusy(_))
    }

    pub(crate) fn operation_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        MessagingError::OperationTimeout {
            operation: operation.into(),
            timeout,
        }
    }
}

/// Error returned by a [`ReceiveHandler`](crate::receiver::ReceiveHandler)
/// when it cannot process a batch.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<HandlerError> for MessagingError {
    fn from(err: HandlerError) -> Self {
        MessagingError::Handler(err.reason)
    }
}

impl From<tokio::time::error::Elapsed> for MessagingError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MessagingError::ServiceTimeout(err.to_string())
    }
}

// Result type alias for convenience
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(symbol: &str) -> ErrorCondition {
        ErrorCondition::new(symbol, Some("boom"))
    }

    #[test]
    fn test_transient_conditions_are_classified() {
        for symbol in [
            error_symbols::SERVER_BUSY,
            error_symbols::TIMEOUT,
            error_symbols::LINK_DETACH_FORCED,
            error_symbols::CONNECTION_FORCED,
            error_symbols::INTERNAL_ERROR,
        ] {
            let error = MessagingError::from_condition(&condition(symbol));
            assert!(error.is_transient(), "{symbol} should be transient");
        }
    }

    #[test]
    fn test_permanent_conditions_are_classified() {
        for symbol in [
            error_symbols::UNAUTHORIZED_ACCESS,
            error_symbols::NOT_FOUND,
            error_symbols::LINK_STOLEN,
            error_symbols::RESOURCE_LIMIT_EXCEEDED,
            error_symbols::ARGUMENT_OUT_OF_RANGE,
            "vendor:something-else",
        ] {
            let error = MessagingError::from_condition(&condition(symbol));
            assert!(!error.is_transient(), "{symbol} should not be transient");
        }
    }

    #[test]
    fn test_condition_description_falls_back_to_symbol() {
        let error =
            MessagingError::from_condition(&ErrorCondition::new(error_symbols::SERVER_BUSY, None));
        assert_eq!(
            error,
            MessagingError::ServerBusy(error_symbols::SERVER_BUSY.to_string())
        );
    }

    #[test]
    fn test_local_timeout_is_not_transient() {
        let error = MessagingError::operation_timeout("open", Duration::from_secs(1));
        assert!(!error.is_transient());
        assert!(error.to_string().contains("open"));
    }
}
