//! Connection-owning factory shared by receivers.
//!
//! A [`MessagingFactory`] holds at most one live connection. Receivers ask
//! for it through [`MessagingFactory::connection`], which lazily replaces a
//! connection that failed or was closed. The factory also carries the
//! operation timeout, retry policy and reactor every receiver inherits.

use crate::amqp::{
    AmqpConnection, AmqpEngine, ConnectionAuth, ConnectionEventHandler, EndpointState,
    ErrorCondition,
};
use crate::auth::{ConnectionStringBuilder, SasTokenGenerator};
use crate::common::{MessagingError, MessagingResult};
use crate::config::ClientSettings;
use crate::reactor::Reactor;
use crate::retry::{self, RetryPolicy};
use crate::utils::sync::lock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use zeroize::Zeroizing;

/// Lifetime of the SAS token presented on each new connection.
const SAS_TOKEN_VALIDITY_HOURS: i64 = 1;

/// Everything needed to open connections for one namespace.
#[derive(Clone)]
pub struct ConnectionParameters {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: Zeroizing<String>,
    pub operation_timeout: Duration,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub settings: ClientSettings,
}

impl ConnectionParameters {
    pub fn new(
        host_name: impl Into<String>,
        shared_access_key_name: impl Into<String>,
        shared_access_key: impl Into<String>,
    ) -> Self {
        let settings = ClientSettings::default();
        Self {
            host_name: host_name.into(),
            shared_access_key_name: shared_access_key_name.into(),
            shared_access_key: Zeroizing::new(shared_access_key.into()),
            operation_timeout: settings.operation_timeout(),
            retry_policy: retry::default_policy(),
            settings,
        }
    }

    /// Combine a parsed connection string with client settings.
    ///
    /// `OperationTimeout` and `RetryPolicy` in the connection string take
    /// precedence over the settings.
    pub fn from_connection_string(
        builder: &ConnectionStringBuilder,
        settings: ClientSettings,
    ) -> MessagingResult<Self> {
        settings.validate()?;

        let retry_policy = match builder.retry_policy() {
            Some(name) => retry::policy_from_name(name)?,
            None => settings.retry.build_policy()?,
        };

        Ok(Self {
            host_name: builder.host_name().to_string(),
            shared_access_key_name: builder.shared_access_key_name().to_string(),
            shared_access_key: Zeroizing::new(builder.shared_access_key().to_string()),
            operation_timeout: builder
                .operation_timeout()
                .unwrap_or_else(|| settings.operation_timeout()),
            retry_policy,
            settings,
        })
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("operation_timeout", &self.operation_timeout)
            .field("retry_policy", &self.retry_policy.name())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ConnectionSlot {
    current: Option<Arc<dyn AmqpConnection>>,
    callbacks: Option<Arc<ConnectionCallbacks>>,
    generation: u64,
    awaiting_open: bool,
    closed: bool,
}

/// Engine-facing handler for one connection. Replacing the connection drops
/// it, so late events from the old connection go nowhere.
struct ConnectionCallbacks {
    factory: Weak<MessagingFactory>,
    generation: u64,
}

impl ConnectionEventHandler for ConnectionCallbacks {
    fn on_open_complete(&self, error: Option<ErrorCondition>) {
        if let Some(factory) = self.factory.upgrade() {
            factory.on_connection_open(self.generation, error);
        }
    }

    fn on_connection_error(&self, error: ErrorCondition) {
        if let Some(factory) = self.factory.upgrade() {
            factory.on_connection_error(self.generation, error);
        }
    }
}

pub struct MessagingFactory {
    engine: Arc<dyn AmqpEngine>,
    reactor: Reactor,
    host_name: String,
    shared_access_key_name: String,
    shared_access_key: Zeroizing<String>,
    sas_generator: SasTokenGenerator,
    operation_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    settings: ClientSettings,
    connection: Mutex<ConnectionSlot>,
    self_ref: Weak<MessagingFactory>,
}

impl MessagingFactory {
    /// Create a factory and start opening its first connection.
    ///
    /// Without an explicit reactor the process-wide one is used.
    pub fn create(
        engine: Arc<dyn AmqpEngine>,
        parameters: ConnectionParameters,
        reactor: Option<Reactor>,
    ) -> MessagingResult<Arc<Self>> {
        if parameters.host_name.is_empty() {
            return Err(MessagingError::InvalidArgument(
                "host name must not be empty".to_string(),
            ));
        }

        let reactor = match reactor {
            Some(reactor) => reactor,
            None => Reactor::shared()?,
        };

        let ConnectionParameters {
            host_name,
            shared_access_key_name,
            shared_access_key,
            operation_timeout,
            retry_policy,
            settings,
        } = parameters;

        let factory = Arc::new_cyclic(|self_ref| Self {
            engine,
            reactor,
            sas_generator: SasTokenGenerator::new(host_name.clone()),
            host_name,
            shared_access_key_name,
            shared_access_key,
            operation_timeout,
            retry_policy,
            settings,
            connection: Mutex::new(ConnectionSlot::default()),
            self_ref: self_ref.clone(),
        });

        factory.connection()?;
        log::info!(
            "Messaging factory created for {} (operation timeout {:?}, retry policy {})",
            factory.host_name,
            factory.operation_timeout,
            factory.retry_policy.name()
        );
        Ok(factory)
    }

    pub fn create_from_connection_string(
        engine: Arc<dyn AmqpEngine>,
        connection_string: &str,
        reactor: Option<Reactor>,
    ) -> MessagingResult<Arc<Self>> {
        let builder = ConnectionStringBuilder::parse(connection_string)?;
        let parameters =
            ConnectionParameters::from_connection_string(&builder, ClientSettings::default())?;
        Self::create(engine, parameters, reactor)
    }

    /// The live connection, replaced first if it is no longer usable.
    ///
    /// A connection still waiting for its open to complete counts as usable.
    pub fn connection(&self) -> MessagingResult<Arc<dyn AmqpConnection>> {
        let mut slot = lock(&self.connection);
        if slot.closed {
            return Err(MessagingError::ClientClosed(
                "messaging factory is closed".to_string(),
            ));
        }

        if let Some(current) = &slot.current {
            if slot.awaiting_open || current.local_state() == EndpointState::Active {
                return Ok(current.clone());
            }
            log::info!("Connection to {} is no longer active, reconnecting", self.host_name);
        }

        self.open_connection(&mut slot)
    }

    fn open_connection(&self, slot: &mut ConnectionSlot) -> MessagingResult<Arc<dyn AmqpConnection>> {
        let sas_token = self.sas_generator.generate_sas_token(
            &self.shared_access_key_name,
            &self.shared_access_key,
            chrono::Duration::hours(SAS_TOKEN_VALIDITY_HOURS),
        )?;
        let auth = ConnectionAuth {
            host_name: self.host_name.clone(),
            sas_token,
        };

        let generation = slot.generation + 1;
        let callbacks = Arc::new(ConnectionCallbacks {
            factory: self.self_ref.clone(),
            generation,
        });
        let handler: Weak<ConnectionCallbacks> = Arc::downgrade(&callbacks);
        let connection = self.engine.create_connection(&auth, handler)?;

        slot.generation = generation;
        slot.callbacks = Some(callbacks);
        slot.awaiting_open = true;
        if let Some(previous) = slot.current.replace(connection.clone()) {
            previous.close();
        }

        log::debug!("Opening connection {generation} to {}", self.host_name);
        Ok(connection)
    }

    fn on_connection_open(&self, generation: u64, error: Option<ErrorCondition>) {
        let mut slot = lock(&self.connection);
        if slot.generation != generation {
            return;
        }
        slot.awaiting_open = false;
        match error {
            None => log::info!("Connection {generation} to {} opened", self.host_name),
            Some(condition) => log::warn!(
                "Connection {generation} to {} failed to open: {condition}",
                self.host_name
            ),
        }
    }

    fn on_connection_error(&self, generation: u64, error: ErrorCondition) {
        let mut slot = lock(&self.connection);
        if slot.generation != generation {
            return;
        }
        slot.awaiting_open = false;
        log::warn!("Connection {generation} to {} failed: {error}", self.host_name);
    }

    /// Close the connection. Later calls to [`connection`](Self::connection)
    /// fail with [`MessagingError::ClientClosed`].
    ///
    /// The reactor keeps running while receivers still hold it.
    pub fn close(&self) {
        let connection = {
            let mut slot = lock(&self.connection);
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.callbacks = None;
            slot.current.take()
        };

        if let Some(connection) = connection {
            connection.close();
        }
        log::info!("Messaging factory for {} closed", self.host_name);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.connection).closed
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

impl std::fmt::Debug for MessagingFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingFactory")
            .field("host_name", &self.host_name)
            .field("operation_timeout", &self.operation_timeout)
            .field("retry_policy", &self.retry_policy.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::constants::error_symbols;
    use crate::amqp::memory::MemoryEngine;
    use claims::*;
    use tokio::runtime::Handle;

    mod helpers {
        use super::*;

        pub fn factory(engine: &Arc<MemoryEngine>) -> Arc<MessagingFactory> {
            let parameters = ConnectionParameters::new("hub.example.net", "listen", "secret");
            let result = MessagingFactory::create(
                engine.clone(),
                parameters,
                Some(Reactor::with_handle(Handle::current())),
            );
            assert_ok!(result)
        }

        pub fn forced() -> ErrorCondition {
            ErrorCondition::new(error_symbols::CONNECTION_FORCED, Some("gone"))
        }
    }

    mod unit {
        use super::helpers::*;
        use super::*;

        #[tokio::test]
        async fn test_create_opens_connection_with_sas_token() {
            let engine = MemoryEngine::new();
            let _factory = factory(&engine);

            let connections = engine.connections();
            assert_eq!(connections.len(), 1);
            let auth = connections[0].auth();
            assert_eq!(auth.host_name, "hub.example.net");
            assert!(auth.sas_token.starts_with("SharedAccessSignature sr="));
            assert!(auth.sas_token.ends_with("&skn=listen"));
        }

        #[tokio::test]
        async fn test_connection_is_reused_while_opening_or_active() {
            let engine = MemoryEngine::new();
            let factory = factory(&engine);

            assert_ok!(factory.connection());
            engine.connections()[0].complete_open();
            assert_ok!(factory.connection());

            assert_eq!(engine.connections().len(), 1);
        }

        #[tokio::test]
        async fn test_failed_connection_is_replaced_on_next_use() {
            let engine = MemoryEngine::new();
            let factory = factory(&engine);
            let first = engine.connections()[0].clone();
            first.complete_open();

            first.fail(forced());
            assert_ok!(factory.connection());

            assert_eq!(engine.connections().len(), 2);
            assert_eq!(first.local_state(), EndpointState::Closed);
        }

        #[tokio::test]
        async fn test_failed_open_is_replaced_on_next_use() {
            let engine = MemoryEngine::new();
            let factory = factory(&engine);

            engine.connections()[0].fail_open(forced());
            assert_ok!(factory.connection());

            assert_eq!(engine.connections().len(), 2);
        }

        #[tokio::test]
        async fn test_events_from_replaced_connection_are_ignored() {
            let engine = MemoryEngine::new();
            let factory = factory(&engine);
            let first = engine.connections()[0].clone();
            first.fail(forced());
            assert_ok!(factory.connection());

            // The old connection no longer has a live handler, and the new
            // one is still awaiting its open.
            first.complete_open();
            first.fail(forced());
            assert_ok!(factory.connection());

            assert_eq!(engine.connections().len(), 2);
        }

        #[tokio::test]
        async fn test_closed_factory_refuses_connections() {
            let engine = MemoryEngine::new();
            let factory = factory(&engine);

            factory.close();
            factory.close();

            assert!(factory.is_closed());
            assert_eq!(engine.connections()[0].local_state(), EndpointState::Closed);
            assert_matches!(factory.connection().err(), Some(MessagingError::ClientClosed(_)));
        }

        #[tokio::test]
        async fn test_connection_string_overrides_settings() {
            let engine = MemoryEngine::new();
            let factory = assert_ok!(MessagingFactory::create_from_connection_string(
                engine.clone(),
                "Endpoint=sb://hub.example.net/;SharedAccessKeyName=listen;SharedAccessKey=secret;OperationTimeout=PT15S;RetryPolicy=NoRetry",
                Some(Reactor::with_handle(Handle::current())),
            ));

            assert_eq!(factory.operation_timeout(), Duration::from_secs(15));
            assert_eq!(factory.retry_policy().name(), retry::NO_RETRY_POLICY_NAME);
            assert_eq!(factory.host_name(), "hub.example.net");
        }

        #[test]
        fn test_empty_host_is_rejected() {
            let engine = MemoryEngine::new();
            let parameters = ConnectionParameters::new("", "listen", "secret");
            assert_matches!(
                MessagingFactory::create(engine, parameters, None),
                Err(MessagingError::InvalidArgument(_))
            );
        }
    }
}
