use super::completion::{CloseFuture, OpenFuture, ReceiveFuture};
use super::link_callbacks::LinkCallbacks;
use super::options::{ReceiverOptions, StartPosition};
use super::state::{ConsumptionMode, LinkLifecycle, ReceiverState};
use super::ReceiveHandler;
use crate::amqp::constants::{EPOCH, STRING_FILTER, error_symbols};
use crate::amqp::{
    AnnotationValue, EndpointState, ErrorCondition, Message,
    ReceiveLinkSettings, ReceiverSettleMode, SenderSettleMode, Source,
};
use crate::common::{MessagingError, MessagingResult, PendingReceive, TimeoutTracker};
use crate::factory::MessagingFactory;
use crate::reactor::{Reactor, TimerHandle};
use crate::utils::sync::lock;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Receives batches of messages from one partition over an AMQP link.
///
/// Messages are consumed either by awaiting [`receive`](Self::receive) or by
/// registering a [`ReceiveHandler`], never both at once. The receiver keeps
/// up to `prefetch_count` credits outstanding on its link and transparently
/// replaces the link after transient failures, resuming after the last
/// offset it delivered.
///
/// # Examples
///
/// ```no_run
/// use client::receiver::{MessageReceiver, ReceiverOptions, StartPosition};
///
/// # async fn run(factory: std::sync::Arc<client::MessagingFactory>) -> client::common::MessagingResult<()> {
/// let options = ReceiverOptions::new(
///     "partition-0",
///     "telemetry/ConsumerGroups/$default/Partitions/0",
///     StartPosition::start_of_stream(),
/// );
/// let receiver = MessageReceiver::create(factory, options).await?;
///
/// while let Some(batch) = receiver.receive().await? {
///     println!("received {} messages", batch.len());
/// }
/// receiver.close_async().await
/// # }
/// ```
pub struct MessageReceiver {
    factory: Arc<MessagingFactory>,
    reactor: Reactor,
    client_id: String,
    receive_path: String,
    start_position: StartPosition,
    epoch: Option<i64>,
    prefetch_count: u32,
    operation_timeout: Duration,
    ping_idle_threshold: Duration,
    max_ping_credits: u32,
    close_timeout: Duration,
    state: Mutex<ReceiverState>,
    self_ref: Weak<MessageReceiver>,
}

enum Admission {
    Rejected(PendingReceive, MessagingError),
    Prefetched(PendingReceive, Vec<Message>),
    Head(PendingReceive),
    Queued { head: bool },
}

enum DeliveryRoute {
    Handler(Arc<dyn ReceiveHandler>, Vec<Vec<Message>>),
    Receive(PendingReceive, Vec<Message>),
    Buffer(Vec<Message>),
    Buffered,
}

enum ErrorFallout {
    Open(oneshot::Sender<MessagingResult<()>>),
    Handler(Arc<dyn ReceiveHandler>),
    Pending(VecDeque<PendingReceive>),
    Nothing,
}

impl MessageReceiver {
    /// Create a receiver and start opening its link.
    ///
    /// The returned future resolves once the link is open, or with the error
    /// that ended the attempt. Transient failures while opening are retried
    /// according to the factory's retry policy within one operation timeout.
    pub fn create(factory: Arc<MessagingFactory>, options: ReceiverOptions) -> OpenFuture {
        let settings = factory.settings().clone();
        let prefetch_count = options.prefetch_count.unwrap_or(settings.prefetch_count);
        if let Err(e) = options.validate(prefetch_count) {
            return OpenFuture::failed(e);
        }

        let operation_timeout = factory.operation_timeout();
        let (open_tx, open_rx) = oneshot::channel();
        let mut state = ReceiverState::new(open_tx);
        state.current_operation = Some(TimeoutTracker::start(operation_timeout));

        let receiver = Arc::new_cyclic(|self_ref| Self {
            reactor: factory.reactor().clone(),
            factory,
            client_id: options.name,
            receive_path: options.receive_path,
            start_position: options.start_position,
            epoch: options.epoch,
            prefetch_count,
            operation_timeout,
            ping_idle_threshold: settings.ping_idle_threshold(),
            max_ping_credits: settings.max_ping_credits,
            close_timeout: settings.link_close_timeout(),
            state: Mutex::new(state),
            self_ref: self_ref.clone(),
        });

        log::info!(
            "Creating receiver {} on {} (prefetch {}, epoch {:?})",
            receiver.client_id,
            receiver.receive_path,
            receiver.prefetch_count,
            receiver.epoch
        );

        if let Err(e) = receiver.create_link() {
            log::warn!("Receiver {} could not build its link: {e}", receiver.client_id);
            receiver.handle_error(e);
        }

        OpenFuture::opening(receiver, open_rx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Same as [`client_id`](Self::client_id).
    pub fn name(&self) -> &str {
        &self.client_id
    }

    pub fn receive_path(&self) -> &str {
        &self.receive_path
    }

    pub fn prefetch_count(&self) -> u32 {
        self.prefetch_count
    }

    pub fn epoch(&self) -> Option<i64> {
        self.epoch
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Offset of the last message handed to the application.
    pub fn last_received_offset(&self) -> Option<String> {
        lock(&self.state).last_received_offset.clone()
    }

    pub fn lifecycle(&self) -> LinkLifecycle {
        lock(&self.state).lifecycle
    }

    /// True once a close was requested, even if it has not completed.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).close_requested
    }

    pub fn factory(&self) -> &Arc<MessagingFactory> {
        &self.factory
    }

    /// Wait for the next batch.
    ///
    /// Resolves to `Ok(None)` when nothing arrives within the operation
    /// timeout, or when the receiver is closed while waiting. Fails
    /// immediately with [`MessagingError::InvalidOperation`] while a receive
    /// handler is registered.
    pub fn receive(&self) -> ReceiveFuture {
        let (item, completion) = PendingReceive::new(self.operation_timeout);

        let (link, accepting) = {
            let state = lock(&self.state);
            let accepting =
                !state.close_requested && !state.mode.is_handler();
            (state.link.clone(), accepting)
        };
        if accepting && !link.is_some_and(|link| link.local_state() == EndpointState::Active) {
            self.schedule_recreate(Duration::ZERO);
        }

        let admission = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.close_requested {
                Admission::Rejected(
                    item,
                    MessagingError::ClientClosed("receiver is closed".to_string()),
                )
            } else {
                let admission = match &mut state.mode {
                    ConsumptionMode::Handler { .. } => Admission::Rejected(
                        item,
                        MessagingError::InvalidOperation(
                            "receive() cannot be used while a receive handler is registered"
                                .to_string(),
                        ),
                    ),
                    ConsumptionMode::Idle { prefetched } if !prefetched.is_empty() => {
                        Admission::Prefetched(item, std::mem::take(prefetched))
                    }
                    ConsumptionMode::Idle { .. } => Admission::Head(item),
                    ConsumptionMode::Pending(queue) => {
                        queue.push_back(item);
                        Admission::Queued { head: false }
                    }
                };
                match admission {
                    Admission::Head(item) => {
                        state.current_operation = Some(item.tracker().clone());
                        state.mode = ConsumptionMode::Pending(VecDeque::from([item]));
                        self.schedule_operation_timer(state);
                        Admission::Queued { head: true }
                    }
                    other => other,
                }
            }
        };

        match admission {
            Admission::Rejected(item, error) => item.fail(error),
            Admission::Prefetched(item, messages) => {
                let count = batch_len(&messages);
                item.complete(Some(messages));
                self.send_flow(count);
            }
            Admission::Queued { head: true } => self.send_ping_flow(),
            Admission::Queued { head: false } | Admission::Head(_) => {}
        }

        ReceiveFuture::new(completion)
    }

    /// Register a push handler, or unregister with `None`.
    ///
    /// Fails with [`MessagingError::InvalidOperation`] while `receive()`
    /// calls are pending. Messages already prefetched are handed to the new
    /// handler on the reactor, ahead of anything delivered afterwards.
    /// Unregistering returns undelivered messages to the `receive()` path.
    pub fn set_receive_handler(
        &self,
        handler: Option<Arc<dyn ReceiveHandler>>,
    ) -> MessagingResult<()> {
        let flush = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            match handler {
                Some(handler) => {
                    if state.close_requested {
                        return Err(MessagingError::ClientClosed("receiver is closed".to_string()));
                    }
                    if matches!(state.mode, ConsumptionMode::Pending(_)) {
                        return Err(MessagingError::InvalidOperation(
                            "a receive handler cannot be registered while receive() calls are pending"
                                .to_string(),
                        ));
                    }
                    let backlog = match std::mem::replace(&mut state.mode, ConsumptionMode::idle()) {
                        ConsumptionMode::Idle { prefetched } => prefetched,
                        ConsumptionMode::Handler { backlog, .. } => backlog,
                        ConsumptionMode::Pending(_) => Vec::new(),
                    };
                    let flush = !backlog.is_empty();
                    state.mode = ConsumptionMode::Handler { handler, backlog };
                    state.current_operation = Some(TimeoutTracker::start(self.operation_timeout));
                    Some(flush)
                }
                None => {
                    if let ConsumptionMode::Handler { backlog, .. } = &mut state.mode {
                        let prefetched = std::mem::take(backlog);
                        state.mode = ConsumptionMode::Idle { prefetched };
                        state.current_operation = None;
                    }
                    None
                }
            }
        };

        match flush {
            Some(flush) => {
                log::info!("Receiver {} switched to handler mode", self.client_id);
                if flush {
                    let weak = self.self_ref.clone();
                    self.reactor.dispatch(move || {
                        if let Some(receiver) = weak.upgrade() {
                            receiver.flush_backlog();
                        }
                    });
                }
            }
            None => log::debug!("Receiver {} has no receive handler", self.client_id),
        }
        Ok(())
    }

    /// Hand the backlog to the registered handler, if both still exist.
    fn flush_backlog(&self) {
        let (handler, backlog) = {
            let mut state = lock(&self.state);
            match &mut state.mode {
                ConsumptionMode::Handler { handler, backlog } if !backlog.is_empty() => {
                    (handler.clone(), std::mem::take(backlog))
                }
                _ => return,
            }
        };

        let count = batch_len(&backlog);
        log::debug!("Receiver {} flushing {count} prefetched messages", self.client_id);
        self.invoke_handler(&handler, backlog);
        self.send_flow(count);
    }

    /// Close the link. Idempotent: every caller observes the same outcome.
    ///
    /// Pending receives resolve to `Ok(None)`. If the peer does not confirm
    /// within the close timeout the future fails with
    /// [`MessagingError::OperationTimeout`].
    pub fn close_async(&self) -> CloseFuture {
        let (tx, rx) = oneshot::channel();

        let (link, drained, open_waiter) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.lifecycle == LinkLifecycle::Closed {
                let _ = tx.send(Ok(()));
                return CloseFuture::new(rx);
            }
            state.close_waiters.push(tx);
            if state.close_requested {
                return CloseFuture::new(rx);
            }

            state.close_requested = true;
            state.lifecycle = LinkLifecycle::Closing;
            state.cancel_open_timer();
            let drained = state.drain_pending();
            let open_waiter = state.open_waiter.take();
            let link = state.link.clone();
            if link.is_some() {
                state.close_timer = Some(self.schedule_close_timeout());
            }
            (link, drained, open_waiter)
        };

        log::info!("Closing receiver {}", self.client_id);
        for item in drained {
            item.complete(None);
        }
        if let Some(waiter) = open_waiter {
            let _ = waiter.send(Err(MessagingError::ClientClosed(
                "receiver closed before its link opened".to_string(),
            )));
        }

        match link {
            Some(link) if link.local_state() != EndpointState::Closed => link.close(),
            _ => self.finish_close(Ok(())),
        }

        CloseFuture::new(rx)
    }

    /// Blocking form of [`close_async`](Self::close_async).
    ///
    /// Refuses to run inside an async runtime, where blocking could stall
    /// the reactor that completes the close.
    pub fn close(&self) -> MessagingResult<()> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(MessagingError::InvalidOperation(
                "close() blocks the calling thread; use close_async() from async code".to_string(),
            ));
        }
        futures::executor::block_on(self.close_async())
    }

    fn link_settings(&self, position: &StartPosition) -> ReceiveLinkSettings {
        let mut filters = BTreeMap::new();
        filters.insert(STRING_FILTER.to_string(), position.filter_expression());

        let mut properties = BTreeMap::new();
        if let Some(epoch) = self.epoch {
            properties.insert(EPOCH.to_string(), AnnotationValue::Long(epoch));
        }

        ReceiveLinkSettings {
            name: uuid::Uuid::new_v4().to_string(),
            source: Source {
                address: self.receive_path.clone(),
                filters,
            },
            properties,
            sender_settle_mode: SenderSettleMode::Unsettled,
            receiver_settle_mode: ReceiverSettleMode::Second,
        }
    }

    /// Build, register and open a new link, resuming after the last
    /// delivered offset when there is one.
    fn create_link(&self) -> MessagingResult<()> {
        let position = {
            let state = lock(&self.state);
            if state.close_requested {
                return Ok(());
            }
            match &state.last_received_offset {
                Some(offset) => StartPosition::from_offset(offset.clone(), false),
                None => self.start_position.clone(),
            }
        };

        let connection = self.factory.connection()?;
        let session = connection.create_session()?;
        session.open();
        let link = session.create_receiver(self.link_settings(&position))?;

        let (callbacks, previous_link, previous_callbacks) = {
            let mut guard = lock(&self.state);
            if guard.close_requested {
                drop(guard);
                link.close();
                return Ok(());
            }
            let state = &mut *guard;

            state.link_generation += 1;
            let generation = state.link_generation;
            let callbacks = Arc::new(LinkCallbacks::new(self.self_ref.clone(), generation));
            let previous_link = state.link.replace(link.clone());
            let previous_callbacks = state.link_callbacks.replace(callbacks.clone());
            state.lifecycle = match state.lifecycle {
                LinkLifecycle::Uninitialized => LinkLifecycle::Opening,
                _ => LinkLifecycle::Recreating,
            };
            state.ping_flow_count = 0;
            state.cancel_open_timer();
            // An open still owed to the caller shares one operation budget
            // across every attempt.
            let open_budget = if state.open_waiter.is_some() {
                state.remaining_operation_time()
            } else {
                self.operation_timeout
            };
            state.open_timer = Some(self.schedule_open_timeout(generation, open_budget));
            (callbacks, previous_link, previous_callbacks)
        };

        drop(previous_callbacks);
        if let Some(previous) = previous_link {
            previous.close();
        }

        log::debug!(
            "Receiver {} opening link {} on {} with filter {}",
            self.client_id,
            link.name(),
            self.receive_path,
            position.filter_expression()
        );
        let handler: Weak<LinkCallbacks> = Arc::downgrade(&callbacks);
        link.set_event_handler(handler);
        link.open();
        Ok(())
    }

    fn schedule_open_timeout(&self, generation: u64, budget: Duration) -> TimerHandle {
        let weak = self.self_ref.clone();
        self.reactor.schedule(budget, move || {
            if let Some(receiver) = weak.upgrade() {
                receiver.on_open_timeout(generation);
            }
        })
    }

    fn on_open_timeout(&self, generation: u64) {
        let (waiter, link, callbacks) = {
            let mut state = lock(&self.state);
            if state.link_generation != generation
                || !matches!(
                    state.lifecycle,
                    LinkLifecycle::Opening | LinkLifecycle::Recreating
                )
                || state.close_requested
            {
                return;
            }
            state.open_timer = None;
            state.recreate_scheduled = false;
            let waiter = state.open_waiter.take();
            if waiter.is_some() {
                state.lifecycle = LinkLifecycle::Closed;
                state.current_operation = None;
            }
            (waiter, state.link.take(), state.link_callbacks.take())
        };

        drop(callbacks);
        if let Some(link) = link {
            link.close();
        }

        match waiter {
            Some(waiter) => {
                log::warn!(
                    "Receiver {} link did not open within {:?}",
                    self.client_id,
                    self.operation_timeout
                );
                let _ = waiter.send(Err(MessagingError::operation_timeout(
                    format!("opening receive link on {}", self.receive_path),
                    self.operation_timeout,
                )));
            }
            None => {
                log::warn!("Receiver {} replacement link did not open in time", self.client_id);
                self.handle_error(MessagingError::LinkDetached(format!(
                    "replacement link on {} did not open within {:?}",
                    self.receive_path, self.operation_timeout
                )));
            }
        }
    }

    pub(crate) fn on_link_open_complete(&self, generation: u64, error: Option<ErrorCondition>) {
        if let Some(condition) = error {
            {
                let mut state = lock(&self.state);
                if state.link_generation != generation {
                    return;
                }
                state.cancel_open_timer();
                state.recreate_scheduled = false;
            }
            log::warn!("Receiver {} link failed to open: {condition}", self.client_id);
            self.handle_error(MessagingError::from_condition(&condition));
            return;
        }

        let (link, waiter, prefetched) = {
            let mut state = lock(&self.state);
            if state.link_generation != generation {
                return;
            }
            state.cancel_open_timer();
            state.recreate_scheduled = false;
            if state.close_requested {
                return;
            }
            state.lifecycle = LinkLifecycle::Active;
            state.last_communicated_at = Instant::now();
            if matches!(state.mode, ConsumptionMode::Idle { .. }) {
                state.current_operation = None;
            }
            (
                state.link.clone(),
                state.open_waiter.take(),
                state.mode.prefetched_len(),
            )
        };

        self.factory.retry_policy().reset_retry_count(&self.client_id);

        if let Some(link) = link {
            let outstanding = u32::try_from(prefetched)
                .unwrap_or(u32::MAX)
                .saturating_add(link.credit());
            let credits = self.prefetch_count.saturating_sub(outstanding);
            log::info!(
                "Receiver {} link {} opened, granting {credits} credits",
                self.client_id,
                link.name()
            );
            self.send_flow(credits);
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    pub(crate) fn on_link_delivery(&self, generation: u64, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let count = batch_len(&messages);
        let last_offset = messages.last().and_then(Message::offset).map(str::to_string);

        let route = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.link_generation != generation {
                log::debug!("Receiver {} dropped a delivery from a retired link", self.client_id);
                return;
            }
            state.last_communicated_at = Instant::now();
            if let Some(offset) = last_offset {
                state.last_received_offset = Some(offset);
            }

            let route = match &mut state.mode {
                ConsumptionMode::Handler { handler, backlog } => {
                    let handler = handler.clone();
                    let mut batches = Vec::with_capacity(2);
                    if !backlog.is_empty() {
                        batches.push(std::mem::take(backlog));
                    }
                    batches.push(messages);
                    state.current_operation = Some(TimeoutTracker::start(self.operation_timeout));
                    DeliveryRoute::Handler(handler, batches)
                }
                ConsumptionMode::Pending(queue) => {
                    let mut head = None;
                    while let Some(item) = queue.pop_front() {
                        if !item.is_abandoned() {
                            head = Some(item);
                            break;
                        }
                    }
                    match head {
                        Some(item) => DeliveryRoute::Receive(item, messages),
                        None => DeliveryRoute::Buffer(messages),
                    }
                }
                ConsumptionMode::Idle { prefetched } => {
                    prefetched.extend(messages);
                    state.current_operation = None;
                    DeliveryRoute::Buffered
                }
            };

            self.refresh_head(state);
            match route {
                DeliveryRoute::Buffer(messages) => {
                    if let ConsumptionMode::Idle { prefetched } = &mut state.mode {
                        prefetched.extend(messages);
                    }
                    DeliveryRoute::Buffered
                }
                other => other,
            }
        };

        match route {
            DeliveryRoute::Handler(handler, batches) => {
                let mut credits = 0u32;
                for batch in batches {
                    credits = credits.saturating_add(batch_len(&batch));
                    self.invoke_handler(&handler, batch);
                }
                self.send_flow(credits);
            }
            DeliveryRoute::Receive(item, messages) => {
                item.complete(Some(messages));
                self.send_flow(count);
            }
            DeliveryRoute::Buffer(_) | DeliveryRoute::Buffered => {
                log::trace!("Receiver {} buffered {count} messages", self.client_id);
            }
        }

        self.factory.retry_policy().reset_retry_count(&self.client_id);
    }

    pub(crate) fn on_link_error(&self, generation: u64, condition: ErrorCondition) {
        if lock(&self.state).link_generation != generation {
            return;
        }
        log::warn!("Receiver {} link error: {condition}", self.client_id);
        self.handle_error(MessagingError::from_condition(&condition));
    }

    pub(crate) fn on_link_close(&self, generation: u64, error: Option<ErrorCondition>) {
        let close_requested = {
            let state = lock(&self.state);
            if state.link_generation != generation {
                return;
            }
            state.close_requested
        };

        if close_requested {
            let result = match error {
                Some(condition) => Err(MessagingError::from_condition(&condition)),
                None => Ok(()),
            };
            self.finish_close(result);
            return;
        }

        let condition = error.unwrap_or_else(|| {
            ErrorCondition::new(error_symbols::LINK_DETACH_FORCED, Some("link closed by the peer"))
        });
        self.on_link_error(generation, condition);
    }

    /// Route a failure: retry when the policy allows it within the remaining
    /// operation budget, otherwise surface it to whoever is waiting.
    fn handle_error(&self, error: MessagingError) {
        let remaining = {
            let mut state = lock(&self.state);
            if state.close_requested {
                drop(state);
                log::debug!("Receiver {} error while closing: {error}", self.client_id);
                self.finish_close(Ok(()));
                return;
            }
            // A handler subscription never ends, so each recovery episode
            // gets a fresh operation budget.
            if state.mode.is_handler()
                && state.current_operation.as_mut().is_none_or(TimeoutTracker::is_expired)
            {
                state.current_operation = Some(TimeoutTracker::start(self.operation_timeout));
            }
            state.remaining_operation_time()
        };

        let policy = self.factory.retry_policy();
        if let Some(delay) = policy.next_retry_interval(&self.client_id, &error, remaining) {
            log::info!(
                "Receiver {} recovering from '{error}' in {delay:?} (retry {})",
                self.client_id,
                policy.retry_count(&self.client_id) + 1
            );
            self.schedule_recreate(delay);
            return;
        }

        let fallout = {
            let mut state = lock(&self.state);
            if let Some(waiter) = state.open_waiter.take() {
                state.cancel_open_timer();
                state.current_operation = None;
                ErrorFallout::Open(waiter)
            } else {
                match &state.mode {
                    ConsumptionMode::Handler { handler, .. } => {
                        ErrorFallout::Handler(handler.clone())
                    }
                    ConsumptionMode::Pending(_) => ErrorFallout::Pending(state.drain_pending()),
                    ConsumptionMode::Idle { .. } => ErrorFallout::Nothing,
                }
            }
        };

        log::warn!("Receiver {} not retrying '{error}'", self.client_id);
        match fallout {
            ErrorFallout::Open(waiter) => {
                let _ = waiter.send(Err(error));
            }
            ErrorFallout::Handler(handler) => notify_handler(&handler, error),
            ErrorFallout::Pending(queue) => {
                let transient = error.is_transient();
                for item in queue {
                    if transient {
                        item.complete(None);
                    } else {
                        item.fail(error.clone());
                    }
                }
            }
            ErrorFallout::Nothing => {}
        }
    }

    /// Replace the link after `delay`. Concurrent requests collapse into one
    /// until the replacement's open completes.
    pub(crate) fn schedule_recreate(&self, delay: Duration) {
        {
            let mut state = lock(&self.state);
            if state.close_requested || state.recreate_scheduled {
                return;
            }
            state.recreate_scheduled = true;
            state.lifecycle = LinkLifecycle::Recreating;
        }

        log::debug!("Receiver {} recreating its link in {delay:?}", self.client_id);
        let weak = self.self_ref.clone();
        self.reactor.schedule(delay, move || {
            if let Some(receiver) = weak.upgrade() {
                receiver.recreate_link();
            }
        });
    }

    fn recreate_link(&self) {
        let (old_link, old_callbacks) = {
            let mut state = lock(&self.state);
            if state.close_requested {
                state.recreate_scheduled = false;
                return;
            }
            (state.link.take(), state.link_callbacks.take())
        };

        drop(old_callbacks);
        if let Some(old_link) = old_link {
            if old_link.local_state() != EndpointState::Closed {
                old_link.close();
            }
        }

        self.factory.retry_policy().increment_retry_count(&self.client_id);
        if let Err(e) = self.create_link() {
            log::warn!("Receiver {} could not rebuild its link: {e}", self.client_id);
            lock(&self.state).recreate_scheduled = false;
            self.handle_error(e);
        }
    }

    /// Grant `credits` on the link, first absorbing outstanding ping credits.
    fn send_flow(&self, credits: u32) {
        if credits == 0 {
            return;
        }

        let (link, to_issue) = {
            let mut state = lock(&self.state);
            if state.close_requested {
                return;
            }
            let Some(link) = state.link.clone() else {
                drop(state);
                self.schedule_recreate(Duration::ZERO);
                return;
            };
            let from_pings = state.ping_flow_count.min(credits);
            state.ping_flow_count -= from_pings;
            (link, credits - from_pings)
        };

        if link.local_state() != EndpointState::Active {
            self.schedule_recreate(Duration::ZERO);
            return;
        }

        if to_issue > 0 {
            lock(&self.state).last_communicated_at = Instant::now();
            log::trace!("Receiver {} flowing {to_issue} credits", self.client_id);
            link.flow(to_issue);
        }
    }

    /// Probe an idle link with a single credit.
    fn send_ping_flow(&self) {
        let link = {
            let state = lock(&self.state);
            if state.close_requested
                || state.ping_flow_count >= self.max_ping_credits
                || state.last_communicated_at.elapsed() < self.ping_idle_threshold
            {
                return;
            }
            match state.link.clone() {
                Some(link) => link,
                None => return,
            }
        };

        if link.local_state() != EndpointState::Active {
            self.schedule_recreate(Duration::ZERO);
            return;
        }

        {
            let mut state = lock(&self.state);
            if state.ping_flow_count >= self.max_ping_credits {
                return;
            }
            state.ping_flow_count += 1;
            state.last_communicated_at = Instant::now();
        }
        log::debug!("Receiver {} link idle, sending ping flow", self.client_id);
        link.flow(1);
    }

    fn schedule_operation_timer(&self, state: &mut ReceiverState) {
        state.cancel_operation_timer();
        let Some(tracker) = state.current_operation.as_mut() else {
            return;
        };
        let delay = tracker.remaining();
        let generation = state.operation_timer_generation;
        let weak = self.self_ref.clone();
        state.operation_timer = Some(self.reactor.schedule(delay, move || {
            if let Some(receiver) = weak.upgrade() {
                receiver.on_operation_timeout(generation);
            }
        }));
    }

    /// Track the new head of the pending queue, or go idle when it is empty.
    fn refresh_head(&self, state: &mut ReceiverState) {
        if !matches!(state.mode, ConsumptionMode::Pending(_)) {
            return;
        }
        match state.mode.head_tracker() {
            Some(tracker) => {
                state.current_operation = Some(tracker);
                self.schedule_operation_timer(state);
            }
            None => {
                state.mode = ConsumptionMode::idle();
                state.current_operation = None;
                state.cancel_operation_timer();
            }
        }
    }

    fn on_operation_timeout(&self, generation: u64) {
        let expired = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.operation_timer_generation != generation {
                return;
            }
            state.operation_timer = None;

            let mut expired = Vec::new();
            if let ConsumptionMode::Pending(queue) = &mut state.mode {
                while let Some(head) = queue.front_mut() {
                    if !head.is_expired() && !head.is_abandoned() {
                        break;
                    }
                    if let Some(item) = queue.pop_front() {
                        expired.push(item);
                    }
                }
            }
            self.refresh_head(state);
            expired
        };

        if !expired.is_empty() {
            log::debug!("Receiver {} timed out {} receive(s)", self.client_id, expired.len());
        }
        for item in expired {
            item.complete(None);
        }
    }

    fn schedule_close_timeout(&self) -> TimerHandle {
        let weak = self.self_ref.clone();
        self.reactor.schedule(self.close_timeout, move || {
            if let Some(receiver) = weak.upgrade() {
                receiver.on_close_timeout();
            }
        })
    }

    fn on_close_timeout(&self) {
        if lock(&self.state).lifecycle == LinkLifecycle::Closed {
            return;
        }
        log::warn!(
            "Receiver {} link was not confirmed closed within {:?}",
            self.client_id,
            self.close_timeout
        );
        self.finish_close(Err(MessagingError::operation_timeout(
            format!("closing receive link on {}", self.receive_path),
            self.close_timeout,
        )));
    }

    fn finish_close(&self, result: MessagingResult<()>) {
        let (waiters, link, callbacks) = {
            let mut state = lock(&self.state);
            if state.lifecycle == LinkLifecycle::Closed {
                return;
            }
            state.lifecycle = LinkLifecycle::Closed;
            state.cancel_close_timer();
            state.cancel_open_timer();
            state.cancel_operation_timer();
            (
                std::mem::take(&mut state.close_waiters),
                state.link.take(),
                state.link_callbacks.take(),
            )
        };
        drop(callbacks);
        drop(link);

        match &result {
            Ok(()) => log::info!("Receiver {} closed", self.client_id),
            Err(e) => log::warn!("Receiver {} closed with error: {e}", self.client_id),
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn invoke_handler(&self, handler: &Arc<dyn ReceiveHandler>, messages: Vec<Message>) {
        let count = messages.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.on_receive_messages(messages)
        }));
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => MessagingError::from(e),
            Err(payload) => MessagingError::Handler(panic_message(payload.as_ref())),
        };
        log::warn!(
            "Receive handler of {} failed on a batch of {count}: {error}",
            self.client_id
        );
        notify_handler(handler, error);
    }
}

impl Drop for MessageReceiver {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_operation_timer();
        state.cancel_open_timer();
        state.cancel_close_timer();
        state.link_callbacks = None;
        if let Some(link) = state.link.take() {
            if link.local_state() != EndpointState::Closed {
                link.close();
            }
        }
    }
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("client_id", &self.client_id)
            .field("receive_path", &self.receive_path)
            .field("prefetch_count", &self.prefetch_count)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

fn notify_handler(handler: &Arc<dyn ReceiveHandler>, error: MessagingError) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(error))).is_err() {
        log::error!("Receive handler panicked while handling an error");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

fn batch_len(messages: &[Message]) -> u32 {
    u32::try_from(messages.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::constants::OFFSET_ANNOTATION;
    use crate::amqp::memory::{MemoryEngine, MemoryLink};
    use crate::common::HandlerError;
    use crate::factory::ConnectionParameters;
    use claims::*;
    use tokio::runtime::Handle;

    mod helpers {
        use super::*;

        pub fn factory(engine: &Arc<MemoryEngine>) -> Arc<MessagingFactory> {
            let parameters = ConnectionParameters::new("hub.example.net", "listen", "secret");
            assert_ok!(MessagingFactory::create(
                engine.clone(),
                parameters,
                Some(Reactor::with_handle(Handle::current())),
            ))
        }

        pub async fn open_receiver(
            engine: &Arc<MemoryEngine>,
        ) -> (Arc<MessageReceiver>, Arc<MemoryLink>) {
            let options = ReceiverOptions::new(
                "receiver-0",
                "hub/ConsumerGroups/$default/Partitions/0",
                StartPosition::start_of_stream(),
            );
            let open = MessageReceiver::create(factory(engine), options);
            let link = assert_some!(engine.last_link());
            link.complete_open();
            (assert_ok!(open.await), link)
        }

        pub fn message(offset: &str) -> Message {
            Message::new(offset.as_bytes().to_vec())
                .with_annotation(OFFSET_ANNOTATION, AnnotationValue::String(offset.to_string()))
        }

        #[derive(Default)]
        pub struct PanickingHandler {
            pub errors: Mutex<Vec<MessagingError>>,
        }

        impl ReceiveHandler for PanickingHandler {
            fn on_receive_messages(&self, _messages: Vec<Message>) -> Result<(), HandlerError> {
                panic!("checkpoint store unavailable");
            }

            fn on_error(&self, error: MessagingError) {
                lock(&self.errors).push(error);
            }
        }
    }

    mod unit {
        use super::helpers::*;
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_recreate_requests_collapse_into_one_link() {
            let engine = MemoryEngine::new();
            let (receiver, _link) = open_receiver(&engine).await;

            receiver.schedule_recreate(Duration::from_millis(50));
            receiver.schedule_recreate(Duration::ZERO);
            receiver.schedule_recreate(Duration::from_millis(10));
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert_eq!(engine.link_count(), 2);
            assert_eq!(receiver.lifecycle(), LinkLifecycle::Recreating);

            // Still in flight: further requests are ignored until it opens.
            receiver.schedule_recreate(Duration::ZERO);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(engine.link_count(), 2);

            assert_some!(engine.last_link()).complete_open();
            assert_eq!(receiver.lifecycle(), LinkLifecycle::Active);
            receiver.schedule_recreate(Duration::ZERO);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(engine.link_count(), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn test_recreation_counts_as_a_retry_until_open() {
            let engine = MemoryEngine::new();
            let (receiver, _link) = open_receiver(&engine).await;
            let policy = receiver.factory().retry_policy().clone();

            receiver.schedule_recreate(Duration::ZERO);
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(policy.retry_count("receiver-0"), 1);

            assert_some!(engine.last_link()).complete_open();
            assert_eq!(policy.retry_count("receiver-0"), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_retired_link_events_are_ignored() {
            let engine = MemoryEngine::new();
            let (receiver, first) = open_receiver(&engine).await;

            receiver.schedule_recreate(Duration::ZERO);
            tokio::time::sleep(Duration::from_millis(1)).await;
            let second = assert_some!(engine.last_link());
            second.complete_open();

            first.deliver(vec![message("7")]);
            assert_none!(receiver.last_received_offset());

            second.deliver(vec![message("8")]);
            assert_eq!(receiver.last_received_offset().as_deref(), Some("8"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_handler_panic_is_reported_as_handler_error() {
            let engine = MemoryEngine::new();
            let (receiver, link) = open_receiver(&engine).await;
            let handler = Arc::new(PanickingHandler::default());
            assert_ok!(receiver.set_receive_handler(Some(handler.clone())));

            link.deliver(vec![message("1"), message("2")]);

            let errors = lock(&handler.errors);
            assert_eq!(errors.len(), 1);
            assert!(matches!(
                &errors[0],
                MessagingError::Handler(reason) if reason.contains("checkpoint store unavailable")
            ));
            drop(errors);
            assert_eq!(link.flows(), vec![300, 2]);
        }

        #[test]
        fn test_panic_message_extraction() {
            let payload: Box<dyn Any + Send> = Box::new("boom");
            assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");

            let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
            assert_eq!(panic_message(payload.as_ref()), "handler panicked: bang");

            let payload: Box<dyn Any + Send> = Box::new(42_u8);
            assert_eq!(panic_message(payload.as_ref()), "handler panicked");
        }
    }
}
