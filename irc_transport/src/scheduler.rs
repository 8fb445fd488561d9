//! Two-lane emission of outbound lines.
//!
//! Priority lines are written in submission order as soon as the connection
//! has completed its handshake. Everything else waits in a queue that is
//! drained one line per tick of the configured message delay, so that the
//! server's flood limits are respected.

use crate::event_loop::{EventLoop, wait_for_signal};

use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender}, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// Interval between heartbeat lines.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Instructions to the task that owns a socket.
#[derive(Debug,Clone,PartialEq,Eq)]
pub(crate) enum ConnectionControl
{
    Send(String),
    Close,
}

/// A periodic task, and when it will next fire.
struct ScheduledTask
{
    handle: JoinHandle<()>,
    next_fire: Arc<Mutex<Instant>>,
}

impl ScheduledTask
{
    fn remaining(&self) -> Duration
    {
        self.next_fire.lock().saturating_duration_since(Instant::now())
    }

    fn cancel(self)
    {
        self.handle.abort();
    }
}

#[derive(Default)]
struct ScheduledTasks
{
    flush: Option<ScheduledTask>,
    heartbeat: Option<ScheduledTask>,
}

pub(crate) struct OutboundScheduler
{
    event_loop: Arc<EventLoop>,
    queue: Arc<Mutex<VecDeque<String>>>,
    priority: UnboundedSender<ConnectionControl>,
    ready: watch::Sender<bool>,
    output: UnboundedSender<ConnectionControl>,
    heartbeat: Arc<dyn Fn() -> String + Send + Sync>,
    tasks: Mutex<ScheduledTasks>,
    priority_worker: JoinHandle<()>,
}

impl OutboundScheduler
{
    /// Create a scheduler writing to `output`, and start its priority worker.
    pub fn new(event_loop: Arc<EventLoop>,
               output: UnboundedSender<ConnectionControl>,
               heartbeat: Arc<dyn Fn() -> String + Send + Sync>) -> Self
    {
        let (priority_send, priority_recv) = unbounded_channel();
        let (ready_send, ready_recv) = watch::channel(false);

        let priority_worker = event_loop.spawn(run_priority_lane(priority_recv, ready_recv, output.clone()));

        Self {
            event_loop,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            priority: priority_send,
            ready: ready_send,
            output,
            heartbeat,
            tasks: Mutex::new(ScheduledTasks::default()),
            priority_worker,
        }
    }

    pub fn enqueue(&self, message: String, priority: bool, avoid_duplicates: bool)
    {
        if priority
        {
            self.send_priority(ConnectionControl::Send(message));
        }
        else
        {
            push_to_queue(&self.queue, message, avoid_duplicates);
        }
    }

    /// Close the socket once every priority line queued so far is written.
    pub fn close_after_priority(&self)
    {
        self.send_priority(ConnectionControl::Close);
    }

    fn send_priority(&self, control: ConnectionControl)
    {
        if self.priority.send(control).is_err()
        {
            tracing::debug!("Priority lane has stopped, dropping message");
        }
    }

    /// Release the priority lane. Only the first call has any effect.
    pub fn mark_ready(&self)
    {
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    pub fn is_ready(&self) -> bool
    {
        *self.ready.borrow()
    }

    pub fn queued(&self) -> Vec<String>
    {
        self.queue.lock().iter().cloned().collect()
    }

    /// (Re)create the flush and heartbeat tasks. Unless `force` is set this
    /// only does anything if sending has already started. The time left
    /// before the old flush task would have fired is carried over, so that
    /// rescheduling can't cause a burst.
    pub fn schedule(&self, force: bool, message_delay: Duration)
    {
        let mut tasks = self.tasks.lock();

        if !force && tasks.flush.is_none()
        {
            return;
        }

        let mut initial_delay = Duration::ZERO;
        if let Some(flush) = tasks.flush.take()
        {
            initial_delay = flush.remaining();
            flush.cancel();
        }
        if let Some(heartbeat) = tasks.heartbeat.take()
        {
            heartbeat.cancel();
        }

        tracing::debug!(?initial_delay, ?message_delay, "Scheduling outbound queue");

        tasks.flush = Some(self.spawn_flush(initial_delay, message_delay));
        tasks.heartbeat = Some(self.spawn_heartbeat());
    }

    fn spawn_flush(&self, initial_delay: Duration, period: Duration) -> ScheduledTask
    {
        // A zero period would make the interval panic
        let period = period.max(Duration::from_millis(1));
        let start = Instant::now() + initial_delay;
        let next_fire = Arc::new(Mutex::new(start));

        let queue = Arc::clone(&self.queue);
        let output = self.output.clone();
        let task_next_fire = Arc::clone(&next_fire);

        let handle = self.event_loop.spawn(async move {
            let mut ticker = time::interval_at(start, period);
            loop
            {
                let fired = ticker.tick().await;
                *task_next_fire.lock() = fired + period;

                let message = queue.lock().pop_front();
                if let Some(message) = message
                {
                    if output.send(ConnectionControl::Send(message)).is_err()
                    {
                        break;
                    }
                }
            }
        });

        ScheduledTask { handle, next_fire }
    }

    fn spawn_heartbeat(&self) -> ScheduledTask
    {
        let start = Instant::now() + HEARTBEAT_INTERVAL;
        let next_fire = Arc::new(Mutex::new(start));

        let queue = Arc::clone(&self.queue);
        let heartbeat = Arc::clone(&self.heartbeat);
        let task_next_fire = Arc::clone(&next_fire);

        let handle = self.event_loop.spawn(async move {
            let mut ticker = time::interval_at(start, HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop
            {
                let fired = ticker.tick().await;
                *task_next_fire.lock() = fired + HEARTBEAT_INTERVAL;
                push_to_queue(&queue, heartbeat(), true);
            }
        });

        ScheduledTask { handle, next_fire }
    }

    /// Stop the priority worker and both periodic tasks.
    pub fn stop(&self)
    {
        self.priority_worker.abort();

        let mut tasks = self.tasks.lock();
        if let Some(flush) = tasks.flush.take()
        {
            flush.cancel();
        }
        if let Some(heartbeat) = tasks.heartbeat.take()
        {
            heartbeat.cancel();
        }
    }
}

impl Drop for OutboundScheduler
{
    fn drop(&mut self)
    {
        self.stop();
    }
}

fn push_to_queue(queue: &Mutex<VecDeque<String>>, message: String, avoid_duplicates: bool)
{
    let mut queue = queue.lock();
    if !avoid_duplicates || !queue.contains(&message)
    {
        queue.push_back(message);
    }
}

async fn run_priority_lane(mut lines: UnboundedReceiver<ConnectionControl>,
                           mut ready: watch::Receiver<bool>,
                           output: UnboundedSender<ConnectionControl>)
{
    while let Some(control) = lines.recv().await
    {
        wait_for_signal(&mut ready).await;
        if !*ready.borrow()
        {
            return;
        }
        if output.send(control).is_err()
        {
            return;
        }
    }
}
