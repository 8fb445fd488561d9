use thiserror::Error;
use serde::{Serialize,Deserialize};
use tokio::sync::mpsc::error::SendError;

/// An error that might occur on a server connection or a DCC exchange.
///
/// Errors carry their cause as a string so that they can be cloned into
/// several notifications (the exception observer and the event channel).
#[derive(Error,Debug,Clone,PartialEq,Eq,Serialize,Deserialize)]
pub enum TransportError
{
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Line exceeds maximum length of {max} bytes")]
    LineTooLong { max: usize },
    #[error("I/O Error: {0}")]
    IoError(String),
    #[error("No async runtime available")]
    NoRuntime,
    #[error("A DCC exchange cannot be bound without a client connection")]
    NoEventLoop,
    #[error("Not connected")]
    NotConnected,
    #[error("DCC exchange is closed")]
    ExchangeClosed,
    #[error("Connection closed")]
    Closed,
}

impl TransportError
{
    /// Is this a transport-level fault? These force a reconnect on the
    /// server connection and fail a DCC session.
    pub fn is_io(&self) -> bool
    {
        matches!(self, Self::IoError(_) | Self::LineTooLong { .. } | Self::ConnectFailed(_))
    }

    /// Configuration faults don't heal by retrying, so no reconnect is
    /// scheduled for them.
    pub fn is_fatal(&self) -> bool
    {
        matches!(self, Self::TlsConfig(_))
    }
}

/// An error that might occur when loading a [`Config`](crate::Config).
#[derive(Error,Debug)]
pub enum ConfigError
{
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration must be a JSON object")]
    NotAnObject,
}

impl From<std::io::Error> for TransportError
{
    fn from(e: std::io::Error) -> Self
    {
        Self::IoError(e.to_string())
    }
}

impl From<rustls::Error> for TransportError
{
    fn from(e: rustls::Error) -> Self
    {
        Self::TlsConfig(e.to_string())
    }
}

impl<T> From<SendError<T>> for TransportError
{
    fn from(_: SendError<T>) -> Self { Self::Closed }
}
