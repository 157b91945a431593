use super::ReceiveHandler;
use super::link_callbacks::LinkCallbacks;
use crate::amqp::{Message, ReceiveLink};
use crate::common::{MessagingResult, PendingReceive, TimeoutTracker};
use crate::reactor::TimerHandle;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLifecycle {
    Uninitialized,
    Opening,
    Active,
    Recreating,
    Closing,
    Closed,
}

/// How delivered batches reach the application.
///
/// `Pending` never holds an empty queue; it falls back to `Idle` instead.
/// A handler's `backlog` holds messages buffered before it was registered;
/// they go out ahead of any later delivery.
pub(crate) enum ConsumptionMode {
    Idle { prefetched: Vec<Message> },
    Pending(VecDeque<PendingReceive>),
    Handler {
        handler: Arc<dyn ReceiveHandler>,
        backlog: Vec<Message>,
    },
}

impl ConsumptionMode {
    pub(crate) fn idle() -> Self {
        ConsumptionMode::Idle {
            prefetched: Vec::new(),
        }
    }

    /// Messages held by the receiver that the application has not seen.
    pub(crate) fn prefetched_len(&self) -> usize {
        match self {
            ConsumptionMode::Idle { prefetched } => prefetched.len(),
            ConsumptionMode::Handler { backlog, .. } => backlog.len(),
            ConsumptionMode::Pending(_) => 0,
        }
    }

    pub(crate) fn is_handler(&self) -> bool {
        matches!(self, ConsumptionMode::Handler { .. })
    }

    /// Tracker of the oldest pending receive, if any.
    pub(crate) fn head_tracker(&self) -> Option<TimeoutTracker> {
        match self {
            ConsumptionMode::Pending(queue) => queue.front().map(|head| head.tracker().clone()),
            _ => None,
        }
    }
}

/// Everything a receiver mutates, kept behind one lock.
pub(crate) struct ReceiverState {
    pub lifecycle: LinkLifecycle,
    pub link: Option<Arc<dyn ReceiveLink>>,
    /// Keeps the current link's event handler alive; the engine only holds
    /// a weak reference to it.
    pub link_callbacks: Option<Arc<LinkCallbacks>>,
    pub link_generation: u64,
    pub mode: ConsumptionMode,

    /// Budget of the operation in flight, consulted when an error arrives.
    pub current_operation: Option<TimeoutTracker>,
    pub operation_timer: Option<TimerHandle>,
    pub operation_timer_generation: u64,

    pub open_waiter: Option<oneshot::Sender<MessagingResult<()>>>,
    pub open_timer: Option<TimerHandle>,

    pub recreate_scheduled: bool,
    pub last_received_offset: Option<String>,
    pub ping_flow_count: u32,
    pub last_communicated_at: Instant,

    pub close_requested: bool,
    pub close_waiters: Vec<oneshot::Sender<MessagingResult<()>>>,
    pub close_timer: Option<TimerHandle>,
}

impl ReceiverState {
    pub(crate) fn new(open_waiter: oneshot::Sender<MessagingResult<()>>) -> Self {
        Self {
            lifecycle: LinkLifecycle::Uninitialized,
            link: None,
            link_callbacks: None,
            link_generation: 0,
            mode: ConsumptionMode::idle(),
            current_operation: None,
            operation_timer: None,
            operation_timer_generation: 0,
            open_waiter: Some(open_waiter),
            open_timer: None,
            recreate_scheduled: false,
            last_received_offset: None,
            ping_flow_count: 0,
            last_communicated_at: Instant::now(),
            close_requested: false,
            close_waiters: Vec::new(),
            close_timer: None,
        }
    }

    /// Also retires any timer callback already queued behind the lock.
    pub(crate) fn cancel_operation_timer(&mut self) {
        self.operation_timer_generation += 1;
        if let Some(timer) = self.operation_timer.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_open_timer(&mut self) {
        if let Some(timer) = self.open_timer.take() {
            timer.cancel();
        }
    }

    pub(crate) fn cancel_close_timer(&mut self) {
        if let Some(timer) = self.close_timer.take() {
            timer.cancel();
        }
    }

    /// Remove every pending receive and return to idle.
    pub(crate) fn drain_pending(&mut self) -> VecDeque<PendingReceive> {
        match std::mem::replace(&mut self.mode, ConsumptionMode::idle()) {
            ConsumptionMode::Pending(queue) => {
                self.current_operation = None;
                self.cancel_operation_timer();
                queue
            }
            other => {
                self.mode = other;
                VecDeque::new()
            }
        }
    }

    /// Remaining budget of the operation in flight; zero when nothing is
    /// tracked or the budget is spent.
    pub(crate) fn remaining_operation_time(&mut self) -> std::time::Duration {
        match self.current_operation.as_mut() {
            Some(tracker) => tracker.remaining(),
            None => std::time::Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NullHandler;

    impl ReceiveHandler for NullHandler {
        fn on_receive_messages(
            &self,
            _messages: Vec<Message>,
        ) -> Result<(), crate::common::HandlerError> {
            Ok(())
        }

        fn on_error(&self, _error: crate::common::MessagingError) {}
    }

    fn state() -> ReceiverState {
        let (tx, _rx) = oneshot::channel();
        ReceiverState::new(tx)
    }

    #[test]
    fn test_drain_returns_to_idle() {
        let mut state = state();
        let (item, _rx) = PendingReceive::new(Duration::from_secs(1));
        state.mode = ConsumptionMode::Pending(VecDeque::from([item]));
        state.current_operation = Some(TimeoutTracker::start(Duration::from_secs(1)));

        let drained = state.drain_pending();

        assert_eq!(drained.len(), 1);
        assert!(matches!(state.mode, ConsumptionMode::Idle { .. }));
        assert!(state.current_operation.is_none());
    }

    #[test]
    fn test_drain_keeps_prefetched_messages() {
        let mut state = state();
        state.mode = ConsumptionMode::Idle {
            prefetched: vec![Message::new("a")],
        };

        assert!(state.drain_pending().is_empty());
        assert_eq!(state.mode.prefetched_len(), 1);
    }

    #[test]
    fn test_handler_backlog_counts_as_prefetched() {
        let mut state = state();
        state.mode = ConsumptionMode::Handler {
            handler: Arc::new(NullHandler),
            backlog: vec![Message::new("a"), Message::new("b")],
        };

        assert!(state.mode.is_handler());
        assert_eq!(state.mode.prefetched_len(), 2);
        assert!(state.drain_pending().is_empty());
        assert_eq!(state.mode.prefetched_len(), 2);
    }

    #[test]
    fn test_untracked_operation_has_no_budget() {
        let mut state = state();
        assert_eq!(state.remaining_operation_time(), Duration::ZERO);

        state.current_operation = Some(TimeoutTracker::start(Duration::from_secs(30)));
        assert!(state.remaining_operation_time() > Duration::from_secs(29));
    }
}
