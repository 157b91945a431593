//! In-process AMQP engine.
//!
//! Nothing goes over a network: every connection, session and link lives in a
//! shared registry, and the owner of a [`MemoryEngine`] raises the engine
//! callbacks explicitly (`complete_open`, `deliver`, `fail`, ...). Flows and
//! link settings are recorded so tests can assert on them.

use super::{
    AmqpConnection, AmqpEngine, AmqpSession, ConnectionAuth, ConnectionEventHandler,
    EndpointState, ErrorCondition, LinkEventHandler, Message, ReceiveLink, ReceiveLinkSettings,
};
use crate::common::{MessagingError, MessagingResult};
use crate::utils::sync::lock;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
struct Registry {
    connections: Vec<Arc<MemoryConnection>>,
    links: Vec<Arc<MemoryLink>>,
    auto_close_links: bool,
    link_creation_error: Option<MessagingError>,
}

/// Engine whose endpoints are plain in-memory objects.
#[derive(Default)]
pub struct MemoryEngine {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// When set, closing a link immediately reports `on_close` back.
    pub fn set_auto_close_links(&self, enabled: bool) {
        lock(&self.registry).auto_close_links = enabled;
    }

    /// Make the next `create_receiver` call fail with `error`.
    pub fn fail_next_link_creation(&self, error: MessagingError) {
        lock(&self.registry).link_creation_error = Some(error);
    }

    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        lock(&self.registry).connections.clone()
    }

    pub fn links(&self) -> Vec<Arc<MemoryLink>> {
        lock(&self.registry).links.clone()
    }

    pub fn link_count(&self) -> usize {
        lock(&self.registry).links.len()
    }

    pub fn last_link(&self) -> Option<Arc<MemoryLink>> {
        lock(&self.registry).links.last().cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        lock(&self.registry).connections.last().cloned()
    }
}

impl AmqpEngine for MemoryEngine {
    fn create_connection(
        &self,
        auth: &ConnectionAuth,
        handler: Weak<dyn ConnectionEventHandler>,
    ) -> MessagingResult<Arc<dyn AmqpConnection>> {
        let connection = Arc::new(MemoryConnection {
            auth: auth.clone(),
            handler,
            state: Mutex::new(EndpointState::Uninitialized),
            registry: self.registry.clone(),
        });
        lock(&self.registry).connections.push(connection.clone());
        log::debug!("Memory engine opened connection to {}", auth.host_name);
        Ok(connection)
    }
}

pub struct MemoryConnection {
    auth: ConnectionAuth,
    handler: Weak<dyn ConnectionEventHandler>,
    state: Mutex<EndpointState>,
    registry: Arc<Mutex<Registry>>,
}

impl MemoryConnection {
    pub fn auth(&self) -> &ConnectionAuth {
        &self.auth
    }

    /// Report the connection as open.
    pub fn complete_open(&self) {
        *lock(&self.state) = EndpointState::Active;
        if let Some(handler) = self.handler.upgrade() {
            handler.on_open_complete(None);
        }
    }

    /// Report a failed open.
    pub fn fail_open(&self, condition: ErrorCondition) {
        *lock(&self.state) = EndpointState::Closed;
        if let Some(handler) = self.handler.upgrade() {
            handler.on_open_complete(Some(condition));
        }
    }

    /// Drop the connection as if the transport failed.
    pub fn fail(&self, condition: ErrorCondition) {
        *lock(&self.state) = EndpointState::Closed;
        if let Some(handler) = self.handler.upgrade() {
            handler.on_connection_error(condition);
        }
    }
}

impl AmqpConnection for MemoryConnection {
    fn local_state(&self) -> EndpointState {
        *lock(&self.state)
    }

    fn create_session(&self) -> MessagingResult<Arc<dyn AmqpSession>> {
        if self.local_state() == EndpointState::Closed {
            return Err(MessagingError::ConnectionLost(
                "cannot create a session on a closed connection".to_string(),
            ));
        }
        Ok(Arc::new(MemorySession {
            registry: self.registry.clone(),
            state: Mutex::new(EndpointState::Uninitialized),
        }))
    }

    fn close(&self) {
        *lock(&self.state) = EndpointState::Closed;
    }
}

struct MemorySession {
    registry: Arc<Mutex<Registry>>,
    state: Mutex<EndpointState>,
}

impl AmqpSession for MemorySession {
    fn open(&self) {
        *lock(&self.state) = EndpointState::Active;
    }

    fn create_receiver(
        &self,
        settings: ReceiveLinkSettings,
    ) -> MessagingResult<Arc<dyn ReceiveLink>> {
        let mut registry = lock(&self.registry);
        if let Some(error) = registry.link_creation_error.take() {
            return Err(error);
        }

        let link = Arc::new(MemoryLink {
            settings,
            auto_close: registry.auto_close_links,
            inner: Mutex::new(LinkInner {
                state: EndpointState::Uninitialized,
                handler: None,
                credit: 0,
                flows: Vec::new(),
                close_calls: 0,
            }),
        });
        registry.links.push(link.clone());
        Ok(link)
    }

    fn close(&self) {
        *lock(&self.state) = EndpointState::Closed;
    }
}

struct LinkInner {
    state: EndpointState,
    handler: Option<Weak<dyn LinkEventHandler>>,
    credit: u32,
    flows: Vec<u32>,
    close_calls: usize,
}

/// A receive link held by the [`MemoryEngine`].
pub struct MemoryLink {
    settings: ReceiveLinkSettings,
    auto_close: bool,
    inner: Mutex<LinkInner>,
}

impl MemoryLink {
    pub fn settings(&self) -> &ReceiveLinkSettings {
        &self.settings
    }

    /// Every flow issued on this link, in order.
    pub fn flows(&self) -> Vec<u32> {
        lock(&self.inner).flows.clone()
    }

    pub fn total_flowed(&self) -> u32 {
        lock(&self.inner).flows.iter().sum()
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.inner).close_calls
    }

    pub fn set_local_state(&self, state: EndpointState) {
        lock(&self.inner).state = state;
    }

    fn handler(&self) -> Option<Arc<dyn LinkEventHandler>> {
        lock(&self.inner).handler.as_ref().and_then(Weak::upgrade)
    }

    /// Confirm the link attach.
    pub fn complete_open(&self) {
        if let Some(handler) = self.handler() {
            handler.on_open_complete(None);
        }
    }

    /// Reject the link attach.
    pub fn fail_open(&self, condition: ErrorCondition) {
        self.set_local_state(EndpointState::Closed);
        if let Some(handler) = self.handler() {
            handler.on_open_complete(Some(condition));
        }
    }

    /// Deliver a batch, consuming link credit.
    pub fn deliver(&self, messages: Vec<Message>) {
        {
            let mut inner = lock(&self.inner);
            inner.credit = inner.credit.saturating_sub(messages.len() as u32);
        }
        if let Some(handler) = self.handler() {
            handler.on_delivery(messages);
        }
    }

    /// Detach the link with an error.
    pub fn fail(&self, condition: ErrorCondition) {
        self.set_local_state(EndpointState::Closed);
        if let Some(handler) = self.handler() {
            handler.on_error(condition);
        }
    }

    /// Report a close initiated by the peer, or the answer to a local close.
    pub fn close_remote(&self, condition: Option<ErrorCondition>) {
        self.set_local_state(EndpointState::Closed);
        if let Some(handler) = self.handler() {
            handler.on_close(condition);
        }
    }
}

impl ReceiveLink for MemoryLink {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn set_event_handler(&self, handler: Weak<dyn LinkEventHandler>) {
        lock(&self.inner).handler = Some(handler);
    }

    fn open(&self) {
        lock(&self.inner).state = EndpointState::Active;
    }

    fn close(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.state = EndpointState::Closed;
            inner.close_calls += 1;
        }
        if self.auto_close {
            if let Some(handler) = self.handler() {
                handler.on_close(None);
            }
        }
    }

    fn local_state(&self) -> EndpointState {
        lock(&self.inner).state
    }

    fn flow(&self, credits: u32) {
        let mut inner = lock(&self.inner);
        inner.credit += credits;
        inner.flows.push(credits);
    }

    fn credit(&self) -> u32 {
        lock(&self.inner).credit
    }
}
