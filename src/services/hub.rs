//! Realtime fan-out of bucket listings to connected push clients.
//!
//! A single control loop ([`Hub::run`]) owns the client registry and the last
//! published listing. Registration, removal and publishing are all commands on
//! one channel, so the registry needs no lock. Delivery to a client is a
//! non-blocking `try_send` into its bounded queue; a client whose queue is full
//! is considered dead and evicted instead of stalling everyone else.
//!
//! [`ListingPoller`] is the producer: it lists the bucket on an interval and
//! publishes the listing whenever the object count grows.

use crate::services::storage_service::{BucketStorage, StorageResult};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_CLIENT_QUEUE: usize = 256;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub type ClientId = Uuid;

/// Serialized message delivered to push clients.
pub type HubMessage = Arc<str>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("realtime hub is not running")]
    Closed,
}

enum HubCommand {
    Register {
        id: ClientId,
        queue: mpsc::Sender<HubMessage>,
    },
    Unregister(ClientId),
    Publish(HubMessage),
    ClientCount(oneshot::Sender<usize>),
}

/// A registered client's end of its outbound queue.
///
/// The queue yields `None` once the hub unregisters or evicts the client.
#[derive(Debug)]
pub struct PushClient {
    pub id: ClientId,
    pub queue: mpsc::Receiver<HubMessage>,
}

/// Cloneable handle used to talk to a running [`Hub`].
#[derive(Clone, Debug)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    queue_capacity: usize,
}

impl HubHandle {
    /// Register a new client; the hub greets it with the last listing.
    pub fn register(&self) -> Result<PushClient, HubError> {
        let id = Uuid::new_v4();
        let (queue, rx) = mpsc::channel(self.queue_capacity);
        self.commands
            .send(HubCommand::Register { id, queue })
            .map_err(|_| HubError::Closed)?;
        Ok(PushClient { id, queue: rx })
    }

    /// Remove a client; unknown or already-evicted ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    /// Store `message` as the current listing and send it to every client.
    pub fn publish(&self, message: impl Into<HubMessage>) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Publish(message.into()))
            .map_err(|_| HubError::Closed)
    }

    /// Number of registered clients, as seen by the control loop.
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HubCommand::ClientCount(tx))
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

/// Owner of the client registry.
pub struct Hub {
    commands: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<ClientId, mpsc::Sender<HubMessage>>,
    last_listing: Option<HubMessage>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            commands: rx,
            clients: HashMap::new(),
            last_listing: None,
        };
        let handle = HubHandle {
            commands: tx,
            queue_capacity: queue_capacity.max(1),
        };
        (hub, handle)
    }

    /// Serve commands until `shutdown` fires or every handle is dropped.
    ///
    /// Dropping the hub closes every remaining client queue.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("realtime hub started");
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => command,
            };
            match command {
                Some(command) => self.handle(command),
                None => break,
            }
        }
        info!(
            "realtime hub stopped with {} clients attached",
            self.clients.len()
        );
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, queue } => {
                if let Some(listing) = &self.last_listing {
                    if let Err(err) = queue.try_send(listing.clone()) {
                        warn!("could not greet push client {}: {}", id, err);
                        return;
                    }
                }
                self.clients.insert(id, queue);
                debug!("push client {} registered ({} total)", id, self.clients.len());
            }
            HubCommand::Unregister(id) => {
                if self.clients.remove(&id).is_some() {
                    debug!("push client {} unregistered ({} left)", id, self.clients.len());
                }
            }
            HubCommand::Publish(message) => {
                self.last_listing = Some(message.clone());
                self.clients.retain(|id, queue| match queue.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("evicting slow push client {}", id);
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("dropping disconnected push client {}", id);
                        false
                    }
                });
            }
            HubCommand::ClientCount(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }
}

/// Polls the bucket and publishes the listing when it grows.
pub struct ListingPoller {
    storage: Arc<dyn BucketStorage>,
    hub: HubHandle,
    interval: Duration,
    last_count: usize,
}

impl ListingPoller {
    pub fn new(storage: Arc<dyn BucketStorage>, hub: HubHandle, interval: Duration) -> Self {
        Self {
            storage,
            hub,
            interval,
            last_count: 0,
        }
    }

    /// List once; publish and return `true` if the object count increased.
    ///
    /// Equal or smaller counts are ignored.
    pub async fn poll_once(&mut self) -> StorageResult<bool> {
        let objects = self.storage.list("").await?;
        if objects.len() <= self.last_count {
            return Ok(false);
        }

        let payload = match serde_json::to_string(&objects) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to serialize bucket listing: {}", err);
                return Ok(false);
            }
        };
        if self.hub.publish(payload).is_err() {
            debug!("hub stopped, dropping listing update");
            return Ok(false);
        }
        info!(
            "bucket grew from {} to {} objects, notified push clients",
            self.last_count,
            objects.len()
        );
        self.last_count = objects.len();
        Ok(true)
    }

    /// Poll on a fixed interval until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!("failed to list objects while polling: {}", err);
                    }
                }
            }
        }
        debug!("listing poller stopped");
    }
}
