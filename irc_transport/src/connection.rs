use crate::*;
use crate::client::ClientInner;
use crate::config::*;
use crate::event;
use crate::event_loop::EventLoop;
use crate::pipeline::{Attached, Pipeline};
use crate::scheduler::{ConnectionControl, OutboundScheduler};

use futures::{SinkExt, StreamExt};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::{lookup_host, TcpSocket, TcpStream},
    select,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver},
        Notify,
    },
    time::{self, Instant},
};

/// One attempt at a connection to the configured server.
///
/// A connection is created for every connect or reconnect; once its socket
/// closes it is finished, and any reconnect happens on a new `Connection`.
pub struct Connection
{
    id: ConnectionId,
    client: Arc<ClientInner>,
    scheduler: OutboundScheduler,
    reconnect: AtomicBool,
    closing: AtomicBool,
    faulted: AtomicBool,
    abort_connect: Notify,
}

impl Connection
{
    pub(crate) fn new(id: ConnectionId, client: &Arc<ClientInner>, event_loop: Arc<EventLoop>) -> (Arc<Self>, UnboundedReceiver<ConnectionControl>)
    {
        let (control_send, control_recv) = unbounded_channel();
        let handler = Arc::clone(&client.handler);

        let connection = Arc::new(Self {
            id,
            client: Arc::clone(client),
            scheduler: OutboundScheduler::new(event_loop, control_send, Arc::new(move || handler.heartbeat_line())),
            reconnect: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            abort_connect: Notify::new(),
        });

        (connection, control_recv)
    }

    pub fn id(&self) -> ConnectionId
    {
        self.id
    }

    /// Has the connection completed its handshake?
    pub fn is_ready(&self) -> bool
    {
        self.scheduler.is_ready()
    }

    /// Will the connection be replaced once its socket closes?
    pub fn will_reconnect(&self) -> bool
    {
        self.reconnect.load(Ordering::SeqCst)
    }

    /// Queue a line for sending. Priority lines bypass the rate limit; other
    /// lines are not queued if `avoid_duplicates` is set and an identical line
    /// is already waiting.
    pub fn send_message(&self, message: String, priority: bool, avoid_duplicates: bool)
    {
        self.scheduler.enqueue(message, priority, avoid_duplicates);
    }

    /// Lines waiting on the rate-limited lane, oldest first.
    pub fn queued_messages(&self) -> Vec<String>
    {
        self.scheduler.queued()
    }

    /// Start draining the rate-limited queue, restarting its timers if they
    /// are already running.
    pub fn start_sending(&self)
    {
        self.scheduler.schedule(true, self.client.config.duration(&MESSAGE_DELAY_MS));
    }

    /// Pick up a changed message delay, if sending has started.
    pub fn update_scheduling(&self)
    {
        self.scheduler.schedule(false, self.client.config.duration(&MESSAGE_DELAY_MS));
    }

    /// Disconnect for good, with an optional QUIT reason.
    pub fn shutdown(&self, reason: Option<&str>)
    {
        self.shutdown_with(reason, false);
    }

    fn shutdown_with(&self, reason: Option<&str>, reconnect: bool)
    {
        // Once cleared, the flag stays cleared
        self.reconnect.fetch_and(reconnect, Ordering::SeqCst);

        if self.closing.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("Connection {:?} is already closing", self.id);
            return;
        }

        let quit = match reason {
            Some(reason) => format!("QUIT :{}", reason),
            None => "QUIT".to_string(),
        };
        self.scheduler.enqueue(quit, true, false);
        self.scheduler.close_after_priority();

        // Nothing will drain the priority lane if the handshake hasn't happened yet
        self.abort_connect.notify_one();
    }

    fn report(&self, error: &TransportError)
    {
        tracing::warn!("Error on connection {:?}: {}", self.id, error);
        self.client.handler.on_exception(error);
    }

    /// Report the first fault on the socket and close it. Anything after that
    /// is fallout from the same failure.
    fn handle_fault(&self, error: TransportError)
    {
        if self.faulted.swap(true, Ordering::SeqCst)
        {
            tracing::debug!("Further error on connection {:?}: {}", self.id, error);
            return;
        }

        self.report(&error);
        if error.is_io()
        {
            self.shutdown_with(Some("IO Error. Reconnecting..."), true);
        }
    }

    pub(crate) async fn run(self: Arc<Self>, control: UnboundedReceiver<ConnectionControl>)
    {
        let config = &self.client.config;

        let server_address = match config.get(&SERVER_ADDRESS) {
            Some(address) => address,
            None => {
                self.fail_attempt(TransportError::ConnectFailed("No server address configured".to_string()), false);
                return;
            }
        };

        tracing::info!("Connection {:?} connecting to {}", self.id, server_address);

        let stream = select! {
            res = open_socket(&server_address, config.get(&BIND_ADDRESS)) => res,
            _ = self.abort_connect.notified() => {
                tracing::debug!("Connection {:?} shut down while connecting", self.id);
                self.finish();
                return;
            }
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_attempt(TransportError::ConnectFailed(e.to_string()), true);
                return;
            }
        };

        let pipeline = match Pipeline::for_server(config, &server_address) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.fail_attempt(e, false);
                return;
            }
        };

        let attached = select! {
            res = pipeline.attach(stream) => res,
            _ = self.abort_connect.notified() => {
                self.finish();
                return;
            }
        };

        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                self.fail_attempt(e, true);
                return;
            }
        };

        tracing::info!("Connection {:?} established to {}", self.id, attached.remote_addr);
        event::emit(&self.client.events, TransportEvent::connection(self.id, TransportEventDetail::Connected {
            remote_addr: attached.remote_addr,
            tls_fingerprint: attached.tls_fingerprint.clone(),
        }));

        self.scheduler.mark_ready();
        self.drive(attached, control).await;
        self.finish();
    }

    async fn drive(&self, attached: Attached, mut control: UnboundedReceiver<ConnectionControl>)
    {
        let handler = &self.client.handler;
        let idle_timeout = attached.idle_timeout;
        let (mut sink, mut lines) = attached.transport.split();

        let idle = time::sleep(idle_timeout.unwrap_or_default());
        tokio::pin!(idle);
        let mut idle_fired = false;
        let mut reading = true;

        loop
        {
            select! {
                control = control.recv() => match control
                {
                    None | Some(ConnectionControl::Close) => break,
                    Some(ConnectionControl::Send(line)) => {
                        tracing::trace!("{:?} >> {}", self.id, line);
                        handler.on_output(&line);
                        if let Err(e) = sink.send(line).await
                        {
                            self.handle_fault(e);
                            break;
                        }
                    }
                },
                line = lines.next(), if reading => match line
                {
                    None => {
                        tracing::debug!("Connection {:?} closed by server", self.id);
                        break;
                    }
                    Some(Ok(line)) => {
                        if let Some(timeout) = idle_timeout
                        {
                            idle.as_mut().reset(Instant::now() + timeout);
                        }
                        idle_fired = false;

                        tracing::trace!("{:?} << {}", self.id, line);
                        handler.on_input(&line);
                        handler.process_line(&line);
                    }
                    Some(Err(e)) => {
                        // The framed reader is finished after an error
                        reading = false;
                        self.handle_fault(e);
                    }
                },
                _ = &mut idle, if idle_timeout.is_some() && !idle_fired => {
                    idle_fired = true;
                    tracing::info!("Connection {:?} idle for {:?}", self.id, idle_timeout);
                    self.shutdown_with(Some("Reconnecting..."), true);
                }
            }
        }

        if let Err(e) = sink.close().await
        {
            tracing::debug!("Error closing connection {:?}: {}", self.id, e);
        }
    }

    /// The socket has closed, or the attempt was abandoned before connecting.
    fn finish(&self)
    {
        self.scheduler.stop();
        self.release(|reconnecting| {
            tracing::info!("Connection {:?} closed (reconnecting: {})", self.id, reconnecting);
            TransportEventDetail::ConnectionClosed { reconnecting }
        });
    }

    /// The connect attempt failed. Configuration faults never retry.
    fn fail_attempt(&self, error: TransportError, retry: bool)
    {
        self.scheduler.stop();
        self.report(&error);

        if !retry || error.is_fatal()
        {
            self.reconnect.store(false, Ordering::SeqCst);
        }

        self.release(move |_| TransportEventDetail::ConnectionFailed(error));
    }

    /// Hand the finished connection back to the registry. Whether the client
    /// reconnects is settled there, against any concurrent shutdown, and
    /// `closed` builds the event announcing it.
    fn release(&self, closed: impl FnOnce(bool) -> TransportEventDetail)
    {
        let client = &self.client;
        let reconnect_after = self.will_reconnect().then(|| client.config.duration(&RECONNECT_DELAY_MS));

        client.registry.release_connection(client, self, reconnect_after, |reconnecting| {
            event::emit(&client.events, TransportEvent::connection(self.id, closed(reconnecting)));
        });
    }
}

async fn open_socket(server_address: &str, bind_address: Option<SocketAddr>) -> io::Result<TcpStream>
{
    let server = lookup_host(server_address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("No address found for {}", server_address)))?;

    let socket = if server.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    if let Some(bind_address) = bind_address
    {
        socket.bind(bind_address)?;
    }

    let stream = socket.connect(server).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
