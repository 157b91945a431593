//! # AMQP engine capability
//!
//! The client does not speak the AMQP wire protocol itself. It drives an
//! engine through the traits in this module: connections, sessions, receive
//! links and the event callbacks the engine raises on the reactor thread.
//!
//! The engine keeps only [`Weak`] references to the objects that handle its
//! events, so tearing down a link never keeps a receiver alive.
//!
//! [`memory::MemoryEngine`] is an in-process implementation used by the test
//! suite.

pub mod constants;
pub mod memory;

use crate::common::MessagingResult;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Local endpoint state of a connection or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    Active,
    Closed,
}

/// An error condition as reported by the engine or the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            condition: condition.into(),
            description: description.map(str::to_string),
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// Value stored in message annotations and link properties.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    String(String),
    Long(i64),
    Timestamp(DateTime<Utc>),
}

/// A message delivered on a receive link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub message_annotations: BTreeMap<String, AnnotationValue>,
    pub application_properties: BTreeMap<String, String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: AnnotationValue) -> Self {
        self.message_annotations.insert(key.into(), value);
        self
    }

    /// Stream offset assigned by the service, if annotated.
    pub fn offset(&self) -> Option<&str> {
        match self.message_annotations.get(constants::OFFSET_ANNOTATION) {
            Some(AnnotationValue::String(offset)) => Some(offset),
            _ => None,
        }
    }

    pub fn sequence_number(&self) -> Option<i64> {
        match self
            .message_annotations
            .get(constants::SEQUENCE_NUMBER_ANNOTATION)
        {
            Some(AnnotationValue::Long(sequence)) => Some(*sequence),
            _ => None,
        }
    }

    pub fn enqueued_time(&self) -> Option<DateTime<Utc>> {
        match self
            .message_annotations
            .get(constants::ENQUEUED_TIME_ANNOTATION)
        {
            Some(AnnotationValue::Timestamp(at)) => Some(*at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    First,
    Second,
}

/// Link source: the address to read from and its filter set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    pub address: String,
    pub filters: BTreeMap<String, String>,
}

/// Everything the engine needs to build a receive link.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveLinkSettings {
    pub name: String,
    pub source: Source,
    pub properties: BTreeMap<String, AnnotationValue>,
    pub sender_settle_mode: SenderSettleMode,
    pub receiver_settle_mode: ReceiverSettleMode,
}

/// Credentials presented when a connection is opened.
#[derive(Clone)]
pub struct ConnectionAuth {
    pub host_name: String,
    pub sas_token: String,
}

impl fmt::Debug for ConnectionAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAuth")
            .field("host_name", &self.host_name)
            .field("sas_token", &"<redacted>")
            .finish()
    }
}

/// Callbacks raised for a connection, on the reactor thread.
pub trait ConnectionEventHandler: Send + Sync {
    fn on_open_complete(&self, error: Option<ErrorCondition>);

    fn on_connection_error(&self, error: ErrorCondition);
}

/// Callbacks raised for a receive link, on the reactor thread.
pub trait LinkEventHandler: Send + Sync {
    fn on_open_complete(&self, error: Option<ErrorCondition>);

    fn on_delivery(&self, messages: Vec<Message>);

    fn on_error(&self, error: ErrorCondition);

    fn on_close(&self, error: Option<ErrorCondition>);
}

pub trait AmqpEngine: Send + Sync {
    /// Start opening a connection. Completion is reported through
    /// [`ConnectionEventHandler::on_open_complete`].
    fn create_connection(
        &self,
        auth: &ConnectionAuth,
        handler: Weak<dyn ConnectionEventHandler>,
    ) -> MessagingResult<Arc<dyn AmqpConnection>>;
}

pub trait AmqpConnection: Send + Sync {
    fn local_state(&self) -> EndpointState;

    fn create_session(&self) -> MessagingResult<Arc<dyn AmqpSession>>;

    fn close(&self);
}

pub trait AmqpSession: Send + Sync {
    fn open(&self);

    fn create_receiver(
        &self,
        settings: ReceiveLinkSettings,
    ) -> MessagingResult<Arc<dyn ReceiveLink>>;

    fn close(&self);
}

pub trait ReceiveLink: Send + Sync {
    fn name(&self) -> &str;

    fn set_event_handler(&self, handler: Weak<dyn LinkEventHandler>);

    fn open(&self);

    fn close(&self);

    fn local_state(&self) -> EndpointState;

    /// Grant the peer `credits` more deliveries.
    fn flow(&self, credits: u32);

    fn credit(&self) -> u32;
}
