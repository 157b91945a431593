use super::MessageReceiver;
use crate::amqp::{ErrorCondition, LinkEventHandler, Message};
use std::sync::Weak;

/// Engine-facing handler for one link generation.
///
/// The receiver owns the only strong reference and drops it when the link is
/// replaced, so events from a retired link never reach the receiver.
pub(crate) struct LinkCallbacks {
    receiver: Weak<MessageReceiver>,
    generation: u64,
}

impl LinkCallbacks {
    pub(crate) fn new(receiver: Weak<MessageReceiver>, generation: u64) -> Self {
        Self {
            receiver,
            generation,
        }
    }
}

impl LinkEventHandler for LinkCallbacks {
    fn on_open_complete(&self, error: Option<ErrorCondition>) {
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.on_link_open_complete(self.generation, error);
        }
    }

    fn on_delivery(&self, messages: Vec<Message>) {
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.on_link_delivery(self.generation, messages);
        }
    }

    fn on_error(&self, error: ErrorCondition) {
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.on_link_error(self.generation, error);
        }
    }

    fn on_close(&self, error: Option<ErrorCondition>) {
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.on_link_close(self.generation, error);
        }
    }
}
