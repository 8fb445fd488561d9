use crate::error::TransportError;
use crate::dcc::DccExchange;

/// The layers above the transport: the protocol processor that consumes
/// decoded lines, and observers of the traffic and faults on a connection.
pub trait ClientHandler: Send + Sync + 'static
{
    /// A line was received from the server.
    fn process_line(&self, line: &str);

    /// The keepalive line queued on the rate-limited lane once a minute. Duplicates
    /// are not queued while one is still waiting.
    fn heartbeat_line(&self) -> String
    {
        "PING :keepalive".to_string()
    }

    /// Called for every line received, before it is processed.
    fn on_input(&self, _line: &str) {}

    /// Called for every line about to be written, including DCC lines.
    fn on_output(&self, _line: &str) {}

    /// Called for every fault caught on a connection or DCC exchange.
    fn on_exception(&self, _error: &TransportError) {}
}

/// Receives the out-of-band lifecycle of a single DCC exchange.
pub trait DccHandler: Send + Sync + 'static
{
    /// The listening socket is bound; this is the point to announce its
    /// port to the peer.
    fn on_socket_bound(&self, _exchange: &DccExchange) {}

    /// A line was received from the peer.
    fn on_message(&self, exchange: &DccExchange, message: &str);
}
