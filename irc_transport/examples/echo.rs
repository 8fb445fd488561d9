//! Connects to the configured server and echoes back any private message.
//!
//! Usage: `echo [config.json]`

use irc_transport::*;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

struct Forward(UnboundedSender<String>);

impl ClientHandler for Forward
{
    fn process_line(&self, line: &str)
    {
        let _ = self.0.send(line.to_string());
    }

    fn on_exception(&self, error: &TransportError)
    {
        tracing::warn!("Transport fault: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>>
{
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::new(),
    };
    let nick = config.get(&config::CLIENT_NAME).unwrap_or_else(|| "echo".to_string());

    let (line_send, mut line_recv) = unbounded_channel();
    let (event_send, mut event_recv) = unbounded_channel();

    let registry = Registry::new();
    let client = Client::new(&registry, config, Forward(line_send), event_send);
    client.connect()?;

    loop
    {
        tokio::select! {
            event = event_recv.recv() => {
                let Some(event) = event else { break };
                tracing::info!("{:?}: {:?}", event.source, event.detail);

                match event.detail
                {
                    TransportEventDetail::Connected { .. } => {
                        client.send_message(format!("NICK {}", nick), true)?;
                        client.send_message(format!("USER {} 0 * :{}", nick, nick), true)?;
                        client.start_sending()?;
                    }
                    TransportEventDetail::ConnectionClosed { reconnecting: false } => break,
                    TransportEventDetail::ConnectionFailed(e) if e.is_fatal() => break,
                    _ => {}
                }
            }
            Some(line) = line_recv.recv() => {
                let mut parts = line.splitn(4, ' ');
                match (parts.next(), parts.next(), parts.next(), parts.next())
                {
                    (Some("PING"), Some(token), _, _) => {
                        client.send_message(format!("PONG {}", token), true)?;
                    }
                    (Some(source), Some("PRIVMSG"), Some(target), Some(text)) if target == nick => {
                        let sender = source.trim_start_matches(':').split('!').next().unwrap_or(source);
                        client.send_message(format!("PRIVMSG {} {}", sender, text), false)?;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.shutdown(Some("Interrupted"));
            }
        }
    }

    Ok(())
}
