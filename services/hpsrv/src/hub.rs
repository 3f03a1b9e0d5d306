//! Broadcast hub
//!
//! Fans serialized snapshots out to any number of observers. Producers hand
//! payloads to a bounded `DropQueue` and never wait: when the queue is full
//! the update is dropped and counted. A single distribution task owns the
//! observer set and applies register/unregister commands between deliveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HpSrvError, Result};

/// Serialized snapshot shared by every observer
pub type Payload = Arc<str>;

pub type ObserverId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The observer is gone and must be removed
    #[error("observer closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Any sink accepting snapshot payloads
pub trait Observer: Send {
    fn deliver(&mut self, payload: &Payload) -> std::result::Result<(), DeliveryError>;
}

/// Observer backed by a bounded channel, used for WebSocket sessions.
///
/// A full channel skips the update and keeps the observer; a closed one
/// reports `Closed`.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::Sender<Payload>,
}

impl ChannelObserver {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn deliver(&mut self, payload: &Payload) -> std::result::Result<(), DeliveryError> {
        match self.tx.try_send(Arc::clone(payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Observer lagging, update skipped");
                Ok(())
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

/// Result of offering a payload to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Dropped,
}

impl Offer {
    pub fn is_accepted(self) -> bool {
        self == Offer::Accepted
    }
}

/// Hands payloads to the hub without ever waiting
pub trait Publisher: Send + Sync {
    fn publish(&self, payload: Payload) -> Offer;
}

/// Bounded non-blocking broadcast queue
#[derive(Debug, Clone)]
pub struct DropQueue {
    tx: mpsc::Sender<Payload>,
    dropped: Arc<AtomicU64>,
}

impl DropQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn offer(&self, payload: Payload) -> Offer {
        match self.tx.try_send(payload) {
            Ok(()) => Offer::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Broadcast queue full, update dropped");
                Offer::Dropped
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Broadcast hub stopped, update dropped");
                Offer::Dropped
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum HubCommand {
    Register {
        observer: Box<dyn Observer>,
        ack: oneshot::Sender<ObserverId>,
    },
    Unregister(ObserverId),
    Count(oneshot::Sender<usize>),
}

/// Hub sizing
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            command_capacity: 32,
        }
    }
}

/// Distribution loop state; run it on its own task
pub struct BroadcastHub {
    observers: HashMap<ObserverId, Box<dyn Observer>>,
    next_id: ObserverId,
    commands: mpsc::Receiver<HubCommand>,
    queue: mpsc::Receiver<Payload>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (command_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (drop_queue, queue) = DropQueue::new(config.queue_capacity);
        (
            Self {
                observers: HashMap::new(),
                next_id: 1,
                commands,
                queue,
            },
            HubHandle {
                commands: command_tx,
                queue: drop_queue,
            },
        )
    }

    /// Serve commands and broadcasts until every handle is dropped
    pub async fn run(mut self) {
        info!("Broadcast hub started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                payload = self.queue.recv() => match payload {
                    Some(payload) => self.fan_out(&payload),
                    None => break,
                },
            }
        }
        info!("Broadcast hub stopped");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { observer, ack } => {
                let id = self.next_id;
                self.next_id += 1;
                self.observers.insert(id, observer);
                debug!("Observer {} registered ({} total)", id, self.observers.len());
                // The registering side may have gone away; the observer stays
                let _ = ack.send(id);
            },
            HubCommand::Unregister(id) => {
                if self.observers.remove(&id).is_some() {
                    debug!("Observer {} unregistered", id);
                }
            },
            HubCommand::Count(reply) => {
                let _ = reply.send(self.observers.len());
            },
        }
    }

    fn fan_out(&mut self, payload: &Payload) {
        self.observers.retain(|id, observer| match observer.deliver(payload) {
            Ok(()) => true,
            Err(e) => {
                info!("Observer {} removed: {}", id, e);
                false
            },
        });
    }
}

/// Cloneable access to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    queue: DropQueue,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("dropped", &self.queue.dropped())
            .finish()
    }
}

impl HubHandle {
    /// Add an observer; resolves once the distribution loop holds it
    pub async fn register(&self, observer: Box<dyn Observer>) -> Result<ObserverId> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Register { observer, ack })
            .await
            .map_err(|_| HpSrvError::hub("broadcast hub is not running"))?;
        ack_rx
            .await
            .map_err(|_| HpSrvError::hub("broadcast hub stopped during registration"))
    }

    pub async fn unregister(&self, id: ObserverId) {
        if self.commands.send(HubCommand::Unregister(id)).await.is_err() {
            debug!("Hub gone, observer {} already released", id);
        }
    }

    pub fn broadcast(&self, payload: Payload) -> Offer {
        self.queue.offer(payload)
    }

    pub async fn observer_count(&self) -> Result<usize> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(HubCommand::Count(reply))
            .await
            .map_err(|_| HpSrvError::hub("broadcast hub is not running"))?;
        reply_rx
            .await
            .map_err(|_| HpSrvError::hub("broadcast hub stopped"))
    }

    /// Updates dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Publisher for HubHandle {
    fn publish(&self, payload: Payload) -> Offer {
        self.broadcast(payload)
    }
}
