//! The ordered chain of stages applied to a socket's traffic.
//!
//! A [`Pipeline`] is built once per socket and consumed when attached to
//! it, so a socket can never be wired twice. The stage list records the
//! chain in the order data passes through it; the framed transport it
//! produces implements the framing and encoding stages, and the task that
//! owns the transport runs the dispatch, idle and exception stages.

use crate::codec::{LineCodec, MAX_LINE_LENGTH};
use crate::config::*;
use crate::error::TransportError;
use crate::tls::{self, TlsSettings};

use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::codec::Framed;

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum Direction
{
    Inbound,
    Outbound,
    Both,
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum Stage
{
    Tls,
    LineSplitter { max_length: usize },
    Utf8Decoder,
    Dispatch,
    IdleDetector { timeout: Duration },
    ExceptionHandler,
    OutputObserver,
    LineTerminator,
    Utf8Encoder,
}

impl Stage
{
    pub fn name(&self) -> &'static str
    {
        match self {
            Self::Tls => "tls",
            Self::LineSplitter { .. } => "line splitter",
            Self::Utf8Decoder => "utf-8 decoder",
            Self::Dispatch => "dispatch",
            Self::IdleDetector { .. } => "idle detector",
            Self::ExceptionHandler => "exception handler",
            Self::OutputObserver => "output observer",
            Self::LineTerminator => "line terminator",
            Self::Utf8Encoder => "utf-8 encoder",
        }
    }

    pub fn direction(&self) -> Direction
    {
        match self {
            Self::Tls | Self::ExceptionHandler => Direction::Both,
            Self::LineSplitter { .. } | Self::Utf8Decoder | Self::Dispatch | Self::IdleDetector { .. } => Direction::Inbound,
            Self::OutputObserver | Self::LineTerminator | Self::Utf8Encoder => Direction::Outbound,
        }
    }
}

/// A byte stream a pipeline can be attached to.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

pub type LineTransport = Framed<Box<dyn Socket>, LineCodec>;

/// A socket with its pipeline attached.
pub struct Attached
{
    pub transport: LineTransport,
    pub remote_addr: SocketAddr,
    pub tls_fingerprint: Option<String>,
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct Pipeline
{
    stages: Vec<Stage>,
    tls: Option<TlsSettings>,
}

impl Pipeline
{
    /// The pipeline for a server connection. Fails with a configuration fault
    /// if TLS is enabled and can't be set up.
    pub fn for_server(config: &Config, server_address: &str) -> Result<Self, TransportError>
    {
        let tls = if config.get(&TLS).unwrap_or(false) {
            Some(tls::build_tls_settings(config, server_address)?)
        } else {
            None
        };

        let mut stages = Vec::new();
        if tls.is_some()
        {
            stages.push(Stage::Tls);
        }
        stages.extend([
            Stage::LineSplitter { max_length: MAX_LINE_LENGTH },
            Stage::Utf8Decoder,
            Stage::Dispatch,
            Stage::IdleDetector { timeout: config.duration(&IDLE_TIMEOUT_MS) },
            Stage::ExceptionHandler,
            Stage::OutputObserver,
            Stage::LineTerminator,
            Stage::Utf8Encoder,
        ]);

        Ok(Self { stages, tls })
    }

    /// The pipeline for an accepted DCC socket: the same framing as a server
    /// connection, with no TLS and no idle detection.
    pub fn for_dcc() -> Self
    {
        Self {
            stages: vec![
                Stage::LineSplitter { max_length: MAX_LINE_LENGTH },
                Stage::Utf8Decoder,
                Stage::Dispatch,
                Stage::ExceptionHandler,
                Stage::OutputObserver,
                Stage::LineTerminator,
                Stage::Utf8Encoder,
            ],
            tls: None,
        }
    }

    pub fn stages(&self) -> &[Stage]
    {
        &self.stages
    }

    /// Stages in the order received data passes through them.
    pub fn inbound(&self) -> impl Iterator<Item = &Stage>
    {
        self.stages.iter().filter(|s| s.direction() != Direction::Outbound)
    }

    /// Stages in the order outgoing data passes through them, ending at the wire.
    pub fn outbound(&self) -> impl Iterator<Item = &Stage>
    {
        let (edge, inner): (Vec<&Stage>, Vec<&Stage>) = self.stages
            .iter()
            .filter(|s| s.direction() != Direction::Inbound)
            .partition(|s| s.direction() == Direction::Both);

        // Stages shared with the inbound side sit at the wire end, TLS outermost
        inner.into_iter().chain(edge.into_iter().rev())
    }

    fn max_line_length(&self) -> usize
    {
        self.stages.iter().find_map(|s| match s {
            Stage::LineSplitter { max_length } => Some(*max_length),
            _ => None
        }).unwrap_or(MAX_LINE_LENGTH)
    }

    fn idle_timeout(&self) -> Option<Duration>
    {
        self.stages.iter().find_map(|s| match s {
            Stage::IdleDetector { timeout } => Some(*timeout),
            _ => None
        })
    }

    /// Wire the pipeline to a connected socket, running the TLS handshake if
    /// there is one.
    pub async fn attach(self, stream: TcpStream) -> Result<Attached, TransportError>
    {
        let remote_addr = stream.peer_addr()?;
        let codec = LineCodec::new(self.max_line_length());
        let idle_timeout = self.idle_timeout();

        let (socket, tls_fingerprint) = match self.tls
        {
            Some(settings) => {
                let tls_stream = settings.connector.connect(settings.server_name, stream).await?;
                let fingerprint = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|c| c.first())
                    .map(tls::fingerprint);
                (Box::new(tls_stream) as Box<dyn Socket>, fingerprint)
            }
            None => (Box::new(stream) as Box<dyn Socket>, None)
        };

        Ok(Attached {
            transport: Framed::new(socket, codec),
            remote_addr,
            tls_fingerprint,
            idle_timeout,
        })
    }
}
