use crate::*;

use parking_lot::Mutex;
use serde::{Serialize,Deserialize};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc::UnboundedSender, watch};

#[derive(Debug,Clone,Copy,PartialEq,Eq,Serialize,Deserialize)]
pub enum DccKind
{
    Chat,
}

/// Where an exchange is in its lifecycle. `Closed` and `Failed` are final.
#[derive(Debug,Clone,Copy,PartialEq,Eq,Serialize,Deserialize)]
pub enum ExchangePhase
{
    Unbound,
    Bound,
    Connected,
    Closed,
    Failed,
}

impl ExchangePhase
{
    pub fn is_terminal(&self) -> bool
    {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// A point-in-time copy of an exchange's state, as carried by lifecycle events.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct DccSnapshot
{
    pub id: ExchangeId,
    pub kind: DccKind,
    pub phase: ExchangePhase,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub connected: bool,
}

#[derive(Debug,Clone)]
struct ExchangeState
{
    phase: ExchangePhase,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

/// A direct peer-to-peer exchange, initiated by listening on a local port
/// and waiting for the peer to connect to it.
///
/// Exactly one inbound connection is accepted per exchange.
pub struct DccExchange
{
    id: ExchangeId,
    kind: DccKind,
    handler: Arc<dyn DccHandler>,
    state: watch::Sender<ExchangeState>,
    accepted: AtomicBool,
    outbound: Mutex<Option<UnboundedSender<String>>>,
    close: watch::Sender<bool>,
}

impl std::fmt::Debug for DccExchange
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DccExchange").field("id", &self.id).field("state", &*self.state.borrow()).finish()
    }
}

impl DccExchange
{
    pub(crate) fn new(id: ExchangeId, kind: DccKind, handler: Arc<dyn DccHandler>) -> Self
    {
        let (state, _) = watch::channel(ExchangeState {
            phase: ExchangePhase::Unbound,
            local_addr: None,
            remote_addr: None,
        });
        let (close, _) = watch::channel(false);

        Self {
            id,
            kind,
            handler,
            state,
            accepted: AtomicBool::new(false),
            outbound: Mutex::new(None),
            close,
        }
    }

    pub fn id(&self) -> ExchangeId
    {
        self.id
    }

    pub fn kind(&self) -> DccKind
    {
        self.kind
    }

    pub fn phase(&self) -> ExchangePhase
    {
        self.state.borrow().phase
    }

    /// The bound listening address; `None` until binding completes.
    pub fn local_addr(&self) -> Option<SocketAddr>
    {
        self.state.borrow().local_addr
    }

    /// The peer's address; `None` until a peer connects.
    pub fn remote_addr(&self) -> Option<SocketAddr>
    {
        self.state.borrow().remote_addr
    }

    pub fn is_connected(&self) -> bool
    {
        self.phase() == ExchangePhase::Connected
    }

    pub fn snapshot(&self) -> DccSnapshot
    {
        let state = self.state.borrow();
        DccSnapshot {
            id: self.id,
            kind: self.kind,
            phase: state.phase,
            local_addr: state.local_addr,
            remote_addr: state.remote_addr,
            connected: state.phase == ExchangePhase::Connected,
        }
    }

    /// Send a line to the peer, waiting until one has connected.
    ///
    /// Fails with [`TransportError::ExchangeClosed`] if the exchange closes
    /// or fails before the line can be handed to its socket.
    pub async fn send_message(&self, message: impl Into<String>) -> Result<(), TransportError>
    {
        let mut state = self.state.subscribe();
        loop
        {
            let phase = state.borrow_and_update().phase;
            match phase
            {
                ExchangePhase::Connected => break,
                ExchangePhase::Closed | ExchangePhase::Failed => return Err(TransportError::ExchangeClosed),
                ExchangePhase::Unbound | ExchangePhase::Bound => {}
            }
            state.changed().await.map_err(|_| TransportError::ExchangeClosed)?;
        }

        let sender = self.outbound.lock().clone().ok_or(TransportError::ExchangeClosed)?;
        sender.send(message.into()).map_err(|_| TransportError::ExchangeClosed)
    }

    /// Close the exchange, its listening socket and any connected session.
    pub fn close(&self)
    {
        if self.terminate(ExchangePhase::Closed)
        {
            tracing::debug!("Closing DCC exchange {:?}", self.id);
        }
    }

    pub(crate) fn handler(&self) -> &dyn DccHandler
    {
        self.handler.as_ref()
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool>
    {
        self.close.subscribe()
    }

    /// Claim the exchange's single inbound connection. Only the first call
    /// returns true.
    pub(crate) fn try_accept(&self) -> bool
    {
        !self.accepted.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_bound(&self, local_addr: SocketAddr) -> bool
    {
        self.state.send_if_modified(|state| {
            if state.phase != ExchangePhase::Unbound
            {
                return false;
            }
            state.phase = ExchangePhase::Bound;
            state.local_addr = Some(local_addr);
            true
        })
    }

    pub(crate) fn set_connected(&self, remote_addr: SocketAddr, outbound: UnboundedSender<String>) -> bool
    {
        // The sender has to be in place before anyone waiting in send_message wakes
        let mut slot = self.outbound.lock();
        let connected = self.state.send_if_modified(|state| {
            if state.phase != ExchangePhase::Bound
            {
                return false;
            }
            state.phase = ExchangePhase::Connected;
            state.remote_addr = Some(remote_addr);
            true
        });
        if connected
        {
            *slot = Some(outbound);
        }
        connected
    }

    /// Move to a final phase, dropping the outbound lane and raising the close
    /// signal. Returns false if the exchange had already finished.
    pub(crate) fn terminate(&self, phase: ExchangePhase) -> bool
    {
        let terminated = self.state.send_if_modified(|state| {
            if state.phase.is_terminal()
            {
                return false;
            }
            state.phase = phase;
            true
        });

        if terminated
        {
            self.outbound.lock().take();
            self.close.send_replace(true);
        }
        terminated
    }
}
