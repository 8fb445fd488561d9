#![allow(dead_code)]

use irc_transport::{config::*, *};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Records what the transport hands to the layer above it.
pub struct Recorder
{
    lines: UnboundedSender<String>,
    errors: UnboundedSender<TransportError>,
}

impl ClientHandler for Recorder
{
    fn process_line(&self, line: &str)
    {
        let _ = self.lines.send(line.to_string());
    }

    fn on_exception(&self, error: &TransportError)
    {
        let _ = self.errors.send(error.clone());
    }
}

pub struct TestClient
{
    pub client: Client,
    pub events: UnboundedReceiver<TransportEvent>,
    pub lines: UnboundedReceiver<String>,
    pub errors: UnboundedReceiver<TransportError>,
}

impl TestClient
{
    pub async fn next_event(&mut self) -> TransportEventDetail
    {
        timeout(TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .detail
    }

    pub async fn next_line(&mut self) -> String
    {
        timeout(TIMEOUT, self.lines.recv()).await.expect("timed out waiting for line").expect("line channel closed")
    }

    pub async fn next_error(&mut self) -> TransportError
    {
        timeout(TIMEOUT, self.errors.recv()).await.expect("timed out waiting for error").expect("error channel closed")
    }
}

/// A config pointing at `server`, with short timers.
pub fn test_config(server: SocketAddr) -> Config
{
    let config = Config::new();
    config.set(&SERVER_ADDRESS, Some(server.to_string())).unwrap();
    config.set(&RECONNECT_DELAY_MS, Some(100)).unwrap();
    config.set(&MESSAGE_DELAY_MS, Some(50)).unwrap();
    config.set(&DCC_BIND_ADDRESS, Some("127.0.0.1".parse().unwrap())).unwrap();
    config
}

pub fn test_client(registry: &Arc<Registry>, config: Config) -> TestClient
{
    let (events_send, events) = unbounded_channel();
    let (lines_send, lines) = unbounded_channel();
    let (errors_send, errors) = unbounded_channel();

    let client = Client::new(registry, config, Recorder { lines: lines_send, errors: errors_send }, events_send);
    TestClient { client, events, lines, errors }
}

pub async fn fake_server() -> (TcpListener, SocketAddr)
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub type LineReader = Lines<BufReader<OwnedReadHalf>>;

pub async fn accept(listener: &TcpListener) -> (LineReader, OwnedWriteHalf)
{
    let (socket, _) = timeout(TIMEOUT, listener.accept()).await.expect("timed out waiting for connection").unwrap();
    split_lines(socket)
}

/// Separate reader and writer halves of a socket, reading by line.
pub fn split_lines(socket: TcpStream) -> (LineReader, OwnedWriteHalf)
{
    let (reader, writer) = socket.into_split();
    (BufReader::new(reader).lines(), writer)
}

pub async fn read_line(lines: &mut LineReader) -> Option<String>
{
    timeout(TIMEOUT, lines.next_line()).await.expect("timed out waiting for line").unwrap()
}
