//! The transport core of an IRC client.
//!
//! A [`Client`] maintains one connection to a configured server, with
//! optional TLS and automatic reconnection. Outgoing lines go through a
//! two-lane scheduler: a priority lane that is written as soon as the
//! connection is up, and a rate-limited lane drained one line per tick.
//! Received lines are handed to the client's [`ClientHandler`].
//!
//! All clients created against the same [`Registry`] share one event loop,
//! which exists only while at least one of them has a connection or a
//! pending reconnect. Clients can also open DCC CHAT exchanges, which listen
//! on a local port for a single peer.
//!
//! Lifecycle changes (connected, closed, failed, and the DCC equivalents)
//! are reported as [`TransportEvent`]s on a channel supplied by the caller.

pub mod id;
pub use id::*;

pub mod error;
pub use error::*;

pub mod config;
pub use config::{Config, ConfigEntry};

mod event;
pub use event::*;

mod handler;
pub use handler::*;

pub mod codec;
pub mod pipeline;
pub mod tls;

mod event_loop;

mod scheduler;
pub use scheduler::HEARTBEAT_INTERVAL;

mod connection;
pub use connection::*;

mod client;
pub use client::*;

mod registry;
pub use registry::*;

pub mod dcc
{
    mod exchange;
    pub use exchange::*;
    mod listener;
    pub(crate) use listener::*;
}
