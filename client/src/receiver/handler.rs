use crate::amqp::Message;
use crate::common::{HandlerError, MessagingError};

/// Push-style consumer registered with
/// [`MessageReceiver::set_receive_handler`](super::MessageReceiver::set_receive_handler).
///
/// Both methods run on the reactor thread and must not block. An `Err` or a
/// panic from [`on_receive_messages`](Self::on_receive_messages) is reported
/// back through [`on_error`](Self::on_error); the receiver keeps delivering.
pub trait ReceiveHandler: Send + Sync {
    fn on_receive_messages(&self, messages: Vec<Message>) -> Result<(), HandlerError>;

    /// Called with receive failures that were not retried, and with
    /// failures raised by this handler.
    fn on_error(&self, error: MessagingError);
}
