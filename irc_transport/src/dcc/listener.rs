use crate::*;
use crate::event;
use crate::event_loop::{wait_for_signal, EventLoop};
use crate::pipeline::Pipeline;
use super::exchange::*;

use futures::{SinkExt, StreamExt};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::mpsc::{unbounded_channel, UnboundedSender},
};

/// What the tasks serving a DCC exchange need from the client that opened it.
#[derive(Clone)]
pub(crate) struct DccContext
{
    pub events: UnboundedSender<TransportEvent>,
    pub client_handler: Arc<dyn ClientHandler>,
    pub bind_ip: IpAddr,
    pub event_loop: Arc<EventLoop>,
}

impl DccContext
{
    fn emit(&self, exchange: &DccExchange, detail: TransportEventDetail)
    {
        event::emit(&self.events, TransportEvent::dcc(exchange.id(), detail));
    }

    /// Report a fault on `exchange` and fail it. An exchange that has
    /// already finished keeps its phase, but the fault is still reported.
    fn fail(&self, exchange: &DccExchange, reason: String, error: TransportError)
    {
        tracing::warn!("DCC exchange {:?} failed: {}: {}", exchange.id(), reason, error);
        self.client_handler.on_exception(&error);

        if exchange.terminate(ExchangePhase::Failed)
        {
            self.emit(exchange, TransportEventDetail::DccFailed { reason, error: Some(error) });
        }
    }
}

/// Start listening for the peer of `exchange`.
pub(crate) fn spawn_listener(context: DccContext, exchange: Arc<DccExchange>)
{
    let event_loop = Arc::clone(&context.event_loop);
    event_loop.spawn(listen(context, exchange));
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener>
{
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    socket.listen(1)
}

async fn listen(context: DccContext, exchange: Arc<DccExchange>)
{
    let mut close = exchange.close_signal();
    let bind_addr = SocketAddr::new(context.bind_ip, 0);

    let listener = match bind(bind_addr).and_then(|l| Ok((l.local_addr()?, l)))
    {
        Ok((local_addr, listener)) => {
            if !exchange.set_bound(local_addr)
            {
                tracing::debug!("DCC exchange {:?} closed while binding", exchange.id());
                return;
            }
            listener
        }
        Err(e) => {
            context.fail(&exchange, format!("Failed to bind to address {}", bind_addr), e.into());
            return;
        }
    };

    tracing::info!("DCC exchange {:?} listening on {:?}", exchange.id(), exchange.local_addr());
    context.emit(&exchange, TransportEventDetail::DccSocketBound(exchange.snapshot()));
    exchange.handler().on_socket_bound(&exchange);

    loop
    {
        select! {
            _ = wait_for_signal(&mut close) => break,
            accepted = listener.accept() => match accepted
            {
                Ok((stream, peer)) => {
                    if !exchange.try_accept()
                    {
                        tracing::debug!("Refusing second connection from {} to DCC exchange {:?}", peer, exchange.id());
                        continue;
                    }
                    context.event_loop.spawn(run_session(context.clone(), Arc::clone(&exchange), stream, peer));
                }
                Err(e) => {
                    tracing::warn!("Error accepting DCC connection: {}", e);
                    context.client_handler.on_exception(&e.into());
                }
            }
        }
    }

    tracing::debug!("DCC listener for {:?} closed", exchange.id());
}

async fn run_session(context: DccContext, exchange: Arc<DccExchange>, stream: TcpStream, peer: SocketAddr)
{
    if let Err(e) = stream.set_nodelay(true)
    {
        tracing::debug!("Couldn't set nodelay on DCC socket: {}", e);
    }

    let mut close = exchange.close_signal();
    let (outbound_send, mut outbound) = unbounded_channel();

    let attached = match Pipeline::for_dcc().attach(stream).await
    {
        Ok(attached) => attached,
        Err(e) => {
            context.fail(&exchange, "Socket error".to_string(), e);
            return;
        }
    };

    if !exchange.set_connected(peer, outbound_send)
    {
        return;
    }

    tracing::info!("DCC exchange {:?} connected to {}", exchange.id(), peer);
    context.emit(&exchange, TransportEventDetail::DccConnected(exchange.snapshot()));

    let (mut sink, mut lines) = attached.transport.split();

    loop
    {
        select! {
            // The outbound lane is dropped when the exchange is closed
            message = outbound.recv() => match message
            {
                Some(line) => {
                    context.client_handler.on_output(&line);
                    if let Err(e) = sink.send(line).await
                    {
                        context.fail(&exchange, "Socket error".to_string(), e);
                        return;
                    }
                }
                None => break,
            },
            _ = wait_for_signal(&mut close) => break,
            line = lines.next() => match line
            {
                Some(Ok(line)) => {
                    tracing::trace!("{:?} << {}", exchange.id(), line);
                    exchange.handler().on_message(&exchange, &line);
                }
                Some(Err(e)) => {
                    context.fail(&exchange, "Socket error".to_string(), e);
                    return;
                }
                None => {
                    exchange.terminate(ExchangePhase::Closed);
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await
    {
        tracing::debug!("Error closing DCC socket: {}", e);
    }

    tracing::info!("DCC exchange {:?} closed", exchange.id());
    context.emit(&exchange, TransportEventDetail::DccConnectionClosed(exchange.snapshot()));
}

#[cfg(test)]
mod tests
{
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Faults(Mutex<Vec<TransportError>>);

    impl ClientHandler for Faults
    {
        fn process_line(&self, _: &str) {}

        fn on_exception(&self, error: &TransportError)
        {
            self.0.lock().push(error.clone());
        }
    }

    struct Ignore;
    impl DccHandler for Ignore
    {
        fn on_message(&self, _: &DccExchange, _: &str) {}
    }

    #[tokio::test]
    async fn late_fault_is_still_reported()
    {
        let faults = Arc::new(Faults::default());
        let (events, mut events_recv) = unbounded_channel();
        let context = DccContext {
            events,
            client_handler: Arc::clone(&faults) as Arc<dyn ClientHandler>,
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            event_loop: Arc::new(EventLoop::new(1).unwrap()),
        };

        let exchange = DccExchange::new(ExchangeId(ClientId(1), 1), DccKind::Chat, Arc::new(Ignore));
        exchange.close();

        context.fail(&exchange, "Socket error".to_string(), TransportError::IoError("reset".to_string()));

        assert_eq!(*faults.0.lock(), vec![TransportError::IoError("reset".to_string())]);
        assert_eq!(exchange.phase(), ExchangePhase::Closed);
        assert!(events_recv.try_recv().is_err());
    }

    #[tokio::test]
    async fn fault_fails_a_live_exchange()
    {
        let faults = Arc::new(Faults::default());
        let (events, mut events_recv) = unbounded_channel();
        let context = DccContext {
            events,
            client_handler: Arc::clone(&faults) as Arc<dyn ClientHandler>,
            bind_ip: IpAddr::from([127, 0, 0, 1]),
            event_loop: Arc::new(EventLoop::new(1).unwrap()),
        };

        let exchange = DccExchange::new(ExchangeId(ClientId(1), 2), DccKind::Chat, Arc::new(Ignore));
        context.fail(&exchange, "Socket error".to_string(), TransportError::LineTooLong { max: 2048 });

        assert_eq!(faults.0.lock().len(), 1);
        assert_eq!(exchange.phase(), ExchangePhase::Failed);
        match events_recv.try_recv().unwrap().detail
        {
            TransportEventDetail::DccFailed { reason, error } => {
                assert_eq!(reason, "Socket error");
                assert_eq!(error, Some(TransportError::LineTooLong { max: 2048 }));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
