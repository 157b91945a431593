use super::errors::{MessagingError, MessagingResult};
use super::timeout_tracker::TimeoutTracker;
use crate::amqp::Message;
use std::time::Duration;
use tokio::sync::oneshot;

/// One outstanding operation: a completion handle plus its deadline.
#[derive(Debug)]
pub struct WorkItem<T> {
    completion: oneshot::Sender<MessagingResult<T>>,
    tracker: TimeoutTracker,
}

/// An outstanding `receive()` call. `None` means the call timed out.
pub type PendingReceive = WorkItem<Option<Vec<Message>>>;

impl<T> WorkItem<T> {
    /// Create the item together with the receiving half of its completion.
    pub fn new(timeout: Duration) -> (Self, oneshot::Receiver<MessagingResult<T>>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                completion,
                tracker: TimeoutTracker::start(timeout),
            },
            rx,
        )
    }

    pub fn tracker(&self) -> &TimeoutTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut TimeoutTracker {
        &mut self.tracker
    }

    pub fn is_expired(&mut self) -> bool {
        self.tracker.is_expired()
    }

    /// The caller may have dropped its future; that is not an error here.
    pub fn complete(self, value: T) {
        if self.completion.send(Ok(value)).is_err() {
            log::trace!("Work item completed after its caller went away");
        }
    }

    pub fn fail(self, error: MessagingError) {
        if self.completion.send(Err(error)).is_err() {
            log::trace!("Work item failed after its caller went away");
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }
}

/// A [`WorkItem`] that also keeps the encoded request so it can be sent again
/// on a fresh link after a reconnect.
///
/// Intended for request/response links (management operations and sends),
/// where an in-flight request must be replayed once the link is rebuilt.
/// The receive path never replays anything and uses [`PendingReceive`]
/// instead, so nothing in this crate constructs one yet.
#[derive(Debug)]
pub struct ReplayableWorkItem<T> {
    item: WorkItem<T>,
    payload: Vec<u8>,
    last_known_error: Option<MessagingError>,
}

impl<T> ReplayableWorkItem<T> {
    pub fn new(
        payload: Vec<u8>,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<MessagingResult<T>>) {
        let (item, rx) = WorkItem::new(timeout);
        (
            Self {
                item,
                payload,
                last_known_error: None,
            },
            rx,
        )
    }

    pub fn replay_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn last_known_error(&self) -> Option<&MessagingError> {
        self.last_known_error.as_ref()
    }

    pub fn set_last_known_error(&mut self, error: MessagingError) {
        self.last_known_error = Some(error);
    }

    pub fn tracker_mut(&mut self) -> &mut TimeoutTracker {
        self.item.tracker_mut()
    }

    pub fn complete(self, value: T) {
        self.item.complete(value);
    }

    /// Fail with the last recorded error if there is one, otherwise with
    /// `error`.
    pub fn fail(self, error: MessagingError) {
        let error = self.last_known_error.unwrap_or(error);
        self.item.fail(error);
    }
}
