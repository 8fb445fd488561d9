use crate::*;
use crate::client::ClientInner;
use crate::dcc::DccExchange;
use crate::event_loop::EventLoop;

use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;

struct PendingReconnect
{
    serial: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState
{
    event_loop: Option<Arc<EventLoop>>,
    generations: u64,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    exchanges: HashMap<ClientId, Vec<Arc<DccExchange>>>,
    pending_reconnects: HashMap<ClientId, PendingReconnect>,
    reconnect_serial: u64,
    // Clients shut down since their last explicit connect
    stopped: HashSet<ClientId>,
}

/// Owns the event loop shared by a set of clients, and every live
/// connection and DCC exchange running on it.
///
/// The event loop is created when the first connection is requested and
/// shut down once no connections or pending reconnects remain. Any later
/// connect creates a new one, with a new generation number.
pub struct Registry
{
    state: Mutex<RegistryState>,
    client_ids: ClientIdGenerator,
}

impl Registry
{
    pub fn new() -> Arc<Self>
    {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            client_ids: ClientIdGenerator::new(1),
        })
    }

    pub(crate) fn next_client_id(&self) -> ClientId
    {
        self.client_ids.next()
    }

    /// Number of registered connections, including any still connecting.
    pub fn connection_count(&self) -> usize
    {
        self.state.lock().connections.len()
    }

    /// The generation of the current event loop, if there is one.
    pub fn event_loop_generation(&self) -> Option<u64>
    {
        self.state.lock().event_loop.as_ref().map(|l| l.generation())
    }

    pub fn has_pending_reconnect(&self, client: ClientId) -> bool
    {
        self.state.lock().pending_reconnects.contains_key(&client)
    }

    /// Is there nothing keeping an event loop alive?
    pub fn is_idle(&self) -> bool
    {
        let state = self.state.lock();
        state.connections.is_empty() && state.pending_reconnects.is_empty()
    }

    /// Register and start a new connection for `client`, creating the event
    /// loop if necessary. Supersedes any reconnect pending for the client.
    pub(crate) fn connect(&self, client: &Arc<ClientInner>) -> Result<Arc<Connection>, TransportError>
    {
        let mut state = self.state.lock();

        state.stopped.remove(&client.id);
        if let Some(pending) = state.pending_reconnects.remove(&client.id)
        {
            tracing::debug!("Connect for {:?} supersedes pending reconnect", client.id);
            pending.handle.abort();
        }

        Self::start_connection(&mut state, client)
    }

    fn start_connection(state: &mut RegistryState, client: &Arc<ClientInner>) -> Result<Arc<Connection>, TransportError>
    {
        let event_loop = match &state.event_loop
        {
            Some(event_loop) => Arc::clone(event_loop),
            None => {
                let event_loop = Arc::new(EventLoop::new(state.generations + 1)?);
                state.generations += 1;
                tracing::info!("Started event loop {}", event_loop.generation());
                state.event_loop = Some(Arc::clone(&event_loop));
                event_loop
            }
        };

        let (connection, control) = Connection::new(client.next_connection_id(), client, Arc::clone(&event_loop));
        state.connections.insert(connection.id(), Arc::clone(&connection));
        client.set_current(Arc::clone(&connection));

        // Holding the lock until the task is spawned means it can't remove
        // itself before it's been registered
        event_loop.spawn(Arc::clone(&connection).run(control));

        Ok(connection)
    }

    /// Forget a finished connection, closing its client's DCC exchanges.
    ///
    /// The client is connected again after `reconnect_after`, unless it has
    /// been shut down. `announce` is told the outcome before the lock is
    /// released, so a shutdown can't slip in between deciding and reporting.
    pub(crate) fn release_connection(self: &Arc<Self>,
                                     client: &Arc<ClientInner>,
                                     connection: &Connection,
                                     reconnect_after: Option<Duration>,
                                     announce: impl FnOnce(bool))
    {
        let mut state = self.state.lock();

        let reconnecting = match reconnect_after
        {
            Some(_) if state.stopped.contains(&client.id) => {
                tracing::debug!("{:?} was shut down, not reconnecting", client.id);
                false
            }
            Some(delay) => self.schedule_reconnect(&mut state, Arc::clone(client), delay),
            None => false,
        };

        client.connection_finished(connection.id());
        announce(reconnecting);

        if state.connections.remove(&connection.id()).is_none()
        {
            tracing::debug!("Connection {:?} was not registered", connection.id());
        }

        if let Some(exchanges) = state.exchanges.remove(&connection.id().client())
        {
            for exchange in exchanges
            {
                exchange.close();
            }
        }

        Self::release_if_idle(&mut state);
    }

    /// Connect `client` again once `delay` has passed. The pending attempt
    /// keeps the event loop alive, and replaces any earlier one.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut RegistryState, client: Arc<ClientInner>, delay: Duration) -> bool
    {
        let event_loop = match &state.event_loop
        {
            Some(event_loop) => Arc::clone(event_loop),
            None => {
                tracing::warn!("No event loop to reconnect {:?} on", client.id);
                return false;
            }
        };

        state.reconnect_serial += 1;
        let serial = state.reconnect_serial;
        let client_id = client.id;
        let registry = Arc::clone(self);

        tracing::info!("Reconnecting {:?} in {:?}", client_id, delay);

        let handle = event_loop.spawn(async move {
            tokio::time::sleep(delay).await;

            let mut state = registry.state.lock();
            if state.pending_reconnects.get(&client_id).map(|p| p.serial) != Some(serial)
            {
                return;
            }
            state.pending_reconnects.remove(&client_id);

            if let Err(e) = Self::start_connection(&mut state, &client)
            {
                tracing::error!("Reconnect of {:?} failed: {}", client_id, e);
                Self::release_if_idle(&mut state);
            }
        });

        if let Some(previous) = state.pending_reconnects.insert(client_id, PendingReconnect { serial, handle })
        {
            previous.handle.abort();
        }
        true
    }

    /// Stop `client` for good: no pending or future reconnect survives this
    /// until it connects again. Returns its current connection, which the
    /// caller should shut down.
    pub(crate) fn shutdown_client(&self, client: &ClientInner) -> Option<Arc<Connection>>
    {
        let mut state = self.state.lock();

        state.stopped.insert(client.id);
        if let Some(pending) = state.pending_reconnects.remove(&client.id)
        {
            tracing::debug!("Cancelled pending reconnect for {:?}", client.id);
            pending.handle.abort();
            Self::release_if_idle(&mut state);
        }

        client.current()
    }

    /// Register a DCC exchange, returning the event loop it should run on.
    /// Fails if no event loop is running.
    pub(crate) fn add_exchange(&self, client: ClientId, exchange: Arc<DccExchange>) -> Result<Arc<EventLoop>, TransportError>
    {
        let mut state = self.state.lock();

        let event_loop = state.event_loop.clone().ok_or(TransportError::NoEventLoop)?;

        let exchanges = state.exchanges.entry(client).or_default();
        exchanges.retain(|e| !e.phase().is_terminal());
        exchanges.push(exchange);

        Ok(event_loop)
    }

    fn release_if_idle(state: &mut RegistryState)
    {
        if !state.connections.is_empty() || !state.pending_reconnects.is_empty()
        {
            return;
        }

        if let Some(event_loop) = state.event_loop.take()
        {
            tracing::info!("No connections remain, releasing event loop {}", event_loop.generation());
            for exchange in state.exchanges.drain().flat_map(|(_, v)| v)
            {
                exchange.close();
            }
            event_loop.shutdown();
        }
    }
}
