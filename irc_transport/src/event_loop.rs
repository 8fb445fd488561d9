use crate::error::TransportError;

use std::future::Future;
use tokio::{
    runtime::Handle,
    select,
    sync::watch,
    task::JoinHandle,
};

/// The shared resource that drives every socket and timer of the clients in
/// a [`Registry`](crate::Registry).
///
/// Tasks are spawned onto the ambient tokio runtime, but each is tied to this
/// loop's shutdown signal: once the loop is shut down they are all dropped,
/// closing any sockets they own.
#[derive(Debug)]
pub(crate) struct EventLoop
{
    generation: u64,
    handle: Handle,
    shutdown: watch::Sender<bool>,
}

impl EventLoop
{
    pub(crate) fn new(generation: u64) -> Result<Self, TransportError>
    {
        let handle = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self { generation, handle, shutdown })
    }

    /// Which loop this is. Each loop created by a registry has a new generation.
    pub fn generation(&self) -> u64
    {
        self.generation
    }

    #[cfg(test)]
    fn is_shut_down(&self) -> bool
    {
        *self.shutdown.borrow()
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<()>
        where F: Future<Output = ()> + Send + 'static
    {
        let mut shutdown = self.shutdown.subscribe();
        self.handle.spawn(async move {
            select! {
                _ = task => {},
                _ = wait_for_signal(&mut shutdown) => {},
            }
        })
    }

    pub(crate) fn shutdown(&self)
    {
        tracing::debug!("Shutting down event loop {}", self.generation);
        self.shutdown.send_replace(true);
    }
}

/// Wait until a close/shutdown flag is raised. A dropped sender counts as
/// raised.
pub(crate) async fn wait_for_signal(signal: &mut watch::Receiver<bool>)
{
    while !*signal.borrow_and_update()
    {
        if signal.changed().await.is_err()
        {
            return;
        }
    }
}
