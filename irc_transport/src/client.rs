use crate::*;
use crate::config::*;
use crate::dcc::{self, DccContext, DccExchange, DccKind};

use parking_lot::Mutex;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;

pub(crate) struct ClientInner
{
    pub(crate) id: ClientId,
    pub(crate) config: Config,
    pub(crate) handler: Arc<dyn ClientHandler>,
    pub(crate) events: UnboundedSender<TransportEvent>,
    pub(crate) registry: Arc<Registry>,
    connection_ids: ConnectionIdGenerator,
    exchange_ids: ExchangeIdGenerator,
    current: Mutex<Option<Arc<Connection>>>,
}

impl ClientInner
{
    pub(crate) fn next_connection_id(&self) -> ConnectionId
    {
        self.connection_ids.next()
    }

    pub(crate) fn set_current(&self, connection: Arc<Connection>)
    {
        if let Some(previous) = self.current.lock().replace(connection)
        {
            tracing::debug!("{:?} replaced connection {:?}", self.id, previous.id());
        }
    }

    /// A connection has finished; forget it if it's the current one.
    pub(crate) fn connection_finished(&self, id: ConnectionId)
    {
        let mut current = self.current.lock();
        if current.as_ref().map(|c| c.id()) == Some(id)
        {
            *current = None;
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<Connection>>
    {
        self.current.lock().clone()
    }
}

/// The transport side of one IRC client: its connection to the configured
/// server, the outbound queue, and any DCC exchanges it opens.
///
/// Lifecycle events for the client's connections and exchanges are sent to
/// the event channel it was created with. Cloning a `Client` gives another
/// handle to the same client.
#[derive(Clone)]
pub struct Client
{
    inner: Arc<ClientInner>,
}

impl Client
{
    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self
    {
        Self { inner }
    }

    pub fn new(registry: &Arc<Registry>,
               config: Config,
               handler: impl ClientHandler,
               events: UnboundedSender<TransportEvent>
            ) -> Self
    {
        let id = registry.next_client_id();

        Self {
            inner: Arc::new(ClientInner {
                id,
                config,
                handler: Arc::new(handler),
                events,
                registry: Arc::clone(registry),
                connection_ids: ConnectionIdGenerator::new(id, 1),
                exchange_ids: ExchangeIdGenerator::new(id, 1),
                current: Mutex::new(None),
            })
        }
    }

    pub fn id(&self) -> ClientId
    {
        self.inner.id
    }

    pub fn config(&self) -> &Config
    {
        &self.inner.config
    }

    /// Start connecting to the configured server.
    ///
    /// Returns once the attempt is registered; the outcome arrives as a
    /// `Connected` or `ConnectionFailed` event. Fails with
    /// [`TransportError::NoRuntime`] outside a tokio runtime.
    pub fn connect(&self) -> Result<ConnectionId, TransportError>
    {
        let connection = self.inner.registry.connect(&self.inner)?;
        Ok(connection.id())
    }

    /// The current connection, if one is registered.
    pub fn connection(&self) -> Option<Arc<Connection>>
    {
        self.inner.current()
    }

    pub fn connection_id(&self) -> Option<ConnectionId>
    {
        self.inner.current().map(|c| c.id())
    }

    /// Is there a connection that has completed its handshake?
    pub fn is_connected(&self) -> bool
    {
        self.inner.current().map(|c| c.is_ready()).unwrap_or(false)
    }

    fn with_connection(&self, f: impl FnOnce(&Connection)) -> Result<(), TransportError>
    {
        let connection = self.inner.current().ok_or(TransportError::NotConnected)?;
        f(&connection);
        Ok(())
    }

    /// Queue a line for the server. Priority lines are written as soon as the
    /// handshake has completed; others wait for the rate-limited queue.
    pub fn send_message(&self, message: impl Into<String>, priority: bool) -> Result<(), TransportError>
    {
        let message = message.into();
        self.with_connection(|c| c.send_message(message, priority, false))
    }

    /// Queue a line on the rate-limited lane unless an identical one is
    /// already waiting.
    pub fn send_message_avoiding_duplicates(&self, message: impl Into<String>) -> Result<(), TransportError>
    {
        let message = message.into();
        self.with_connection(|c| c.send_message(message, false, true))
    }

    pub fn start_sending(&self) -> Result<(), TransportError>
    {
        self.with_connection(Connection::start_sending)
    }

    pub fn update_scheduling(&self) -> Result<(), TransportError>
    {
        self.with_connection(Connection::update_scheduling)
    }

    /// Change the interval between rate-limited lines, applying it to the
    /// current connection if it is already sending.
    pub fn set_message_delay(&self, delay: Duration)
    {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self.inner.config.set(&MESSAGE_DELAY_MS, Some(millis))
        {
            tracing::error!("Couldn't store message delay: {}", e);
            return;
        }

        if let Some(connection) = self.inner.current()
        {
            connection.update_scheduling();
        }
    }

    /// Disconnect without reconnecting, sending `QUIT` with the given reason.
    /// Also cancels any reconnect that is waiting to happen.
    pub fn shutdown(&self, reason: Option<&str>)
    {
        if let Some(connection) = self.inner.registry.shutdown_client(&self.inner)
        {
            tracing::info!("Shutting down connection {:?}", connection.id());
            connection.shutdown(reason);
        }
    }

    /// Open a DCC CHAT exchange: bind a listening socket and wait for the
    /// peer. Binding happens on the event loop; `handler` is told the bound
    /// address once it is known.
    ///
    /// Fails with [`TransportError::NoEventLoop`] if the client has never
    /// connected, or every connection has since finished.
    pub fn dcc_chat(&self, handler: impl DccHandler) -> Result<Arc<DccExchange>, TransportError>
    {
        let exchange = Arc::new(DccExchange::new(self.inner.exchange_ids.next(), DccKind::Chat, Arc::new(handler)));
        let event_loop = self.inner.registry.add_exchange(self.inner.id, Arc::clone(&exchange))?;

        let context = DccContext {
            events: self.inner.events.clone(),
            client_handler: Arc::clone(&self.inner.handler),
            bind_ip: self.inner.config.get(&DCC_BIND_ADDRESS).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            event_loop,
        };
        dcc::spawn_listener(context, Arc::clone(&exchange));

        Ok(exchange)
    }
}
