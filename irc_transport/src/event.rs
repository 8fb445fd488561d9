use crate::id::*;
use crate::error::*;
use crate::dcc::DccSnapshot;

use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// The connection or DCC exchange to which an event relates.
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum EventSource
{
    Connection(ConnectionId),
    Dcc(ExchangeId),
}

/// Possible types of lifecycle event.
#[derive(Debug,Clone,PartialEq)]
pub enum TransportEventDetail
{
    /// The server connection completed its handshake
    Connected { remote_addr: SocketAddr, tls_fingerprint: Option<String> },
    /// The server connection closed; if `reconnecting` a new attempt is scheduled
    ConnectionClosed { reconnecting: bool },
    /// A connect attempt failed
    ConnectionFailed(TransportError),
    /// A DCC exchange's listening socket is bound
    DccSocketBound(DccSnapshot),
    /// A peer connected to a DCC exchange
    DccConnected(DccSnapshot),
    /// A connected DCC exchange closed
    DccConnectionClosed(DccSnapshot),
    /// A DCC exchange failed to bind, or its session hit an error
    DccFailed { reason: String, error: Option<TransportError> },
}

/// An event to be notified via a client's event channel.
#[derive(Debug,Clone,PartialEq)]
pub struct TransportEvent
{
    /// The connection or exchange to which this event relates
    pub source: EventSource,
    /// The type of event and its content
    pub detail: TransportEventDetail,
}

impl TransportEvent
{
    pub(crate) fn connection(id: ConnectionId, detail: TransportEventDetail) -> Self
    {
        Self { source: EventSource::Connection(id), detail }
    }

    pub(crate) fn dcc(id: ExchangeId, detail: TransportEventDetail) -> Self
    {
        Self { source: EventSource::Dcc(id), detail }
    }
}

pub(crate) fn emit(events: &UnboundedSender<TransportEvent>, event: TransportEvent)
{
    tracing::trace!(?event, "Emitting transport event");
    if let Err(e) = events.send(event)
    {
        tracing::warn!("Dropped transport event, nobody is listening: {:?}", e.0.detail);
    }
}
