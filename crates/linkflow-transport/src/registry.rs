/*!
 * Client registry.
 *
 * Holds the named link clients of an application, connects and disconnects
 * them together, and merges their state notifications into one stream.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use linkflow_core::config::{ClientConfig, Config};
use linkflow_core::logging::operation_span;
use linkflow_core::types::Id;

use crate::client::{LinkClient, LinkClientBuilder};
use crate::error::{LinkError, Result};
use crate::state::StateChange;
use crate::transports::TransportRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Event types for the client registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A client was added
    ClientAdded(Id),
    /// A client was removed
    ClientRemoved(Id),
}

struct Entry {
    client: Arc<LinkClient>,
    forwarder: JoinHandle<()>,
}

/// Registry of named link clients
pub struct ClientRegistry {
    clients: RwLock<HashMap<Id, Entry>>,
    event_sender: broadcast::Sender<RegistryEvent>,
    state_sender: broadcast::Sender<StateChange>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.ids().unwrap_or_default())
            .finish()
    }
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clients: RwLock::new(HashMap::new()),
            event_sender,
            state_sender,
        }
    }

    /// Build every client listed in the configuration.
    ///
    /// `customize` sees each builder before it is built, typically to attach
    /// a frame handler.
    pub fn from_config<F>(config: &Config, transports: &TransportRegistry, mut customize: F) -> Result<Self>
    where
        F: FnMut(&ClientConfig, LinkClientBuilder) -> LinkClientBuilder,
    {
        config.validate()?;

        let registry = Self::new();
        for client_config in &config.clients {
            let builder = LinkClientBuilder::from_config(client_config, &config.link, transports)?;
            registry.register(customize(client_config, builder).build()?)?;
        }

        info!("Loaded {} clients from configuration", config.clients.len());
        Ok(registry)
    }

    fn lock_error() -> LinkError {
        LinkError::Other("Failed to acquire lock on client registry".to_string())
    }

    /// Register a client
    pub fn register(&self, client: LinkClient) -> Result<Arc<LinkClient>> {
        let id = client.id().clone();
        let mut clients = self.clients.write().map_err(|_| Self::lock_error())?;

        if clients.contains_key(&id) {
            return Err(LinkError::Configuration(format!(
                "Client with ID {} already registered",
                id
            )));
        }

        let client = Arc::new(client);
        let forwarder = self.forward_states(&client);
        clients.insert(
            id.clone(),
            Entry {
                client: client.clone(),
                forwarder,
            },
        );
        let _ = self.event_sender.send(RegistryEvent::ClientAdded(id.clone()));
        debug!("Registered client with ID {}", id);

        Ok(client)
    }

    fn forward_states(&self, client: &LinkClient) -> JoinHandle<()> {
        let mut changes = client.subscribe();
        let sender = self.state_sender.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let _ = sender.send(change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("State forwarder lagged, {} notifications skipped", skipped);
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Disconnect and remove a client
    pub async fn unregister(&self, id: &Id) -> Result<()> {
        let entry = {
            let mut clients = self.clients.write().map_err(|_| Self::lock_error())?;
            clients
                .remove(id)
                .ok_or_else(|| LinkError::Other(format!("Client with ID {} not found", id)))?
        };

        entry.forwarder.abort();
        if let Err(e) = entry.client.disconnect().await {
            warn!("Failed to disconnect client with ID {}: {}", id, e);
        }
        let _ = self.event_sender.send(RegistryEvent::ClientRemoved(id.clone()));
        debug!("Unregistered client with ID {}", id);

        Ok(())
    }

    /// Get a client by ID
    pub fn get(&self, id: &Id) -> Result<Arc<LinkClient>> {
        let clients = self.clients.read().map_err(|_| Self::lock_error())?;
        clients
            .get(id)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| LinkError::Other(format!("Client with ID {} not found", id)))
    }

    /// Get all clients
    pub fn clients(&self) -> Result<Vec<Arc<LinkClient>>> {
        let clients = self.clients.read().map_err(|_| Self::lock_error())?;
        Ok(clients.values().map(|entry| entry.client.clone()).collect())
    }

    /// Get all client IDs, sorted
    pub fn ids(&self) -> Result<Vec<Id>> {
        let clients = self.clients.read().map_err(|_| Self::lock_error())?;
        let mut ids: Vec<Id> = clients.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Count registered clients
    pub fn len(&self) -> Result<usize> {
        let clients = self.clients.read().map_err(|_| Self::lock_error())?;
        Ok(clients.len())
    }

    /// Check whether the registry is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Subscribe to the state transitions of every registered client
    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.state_sender.subscribe()
    }

    /// Connect every client concurrently and report each outcome.
    ///
    /// Failed clients keep retrying according to their own policy.
    pub async fn connect_all(&self) -> Result<Vec<(Id, Result<()>)>> {
        let clients = self.clients()?;
        let outcomes = join_all(clients.iter().map(|client| async move {
            debug!("Connecting client with ID {}", client.id());
            let outcome = client.connect().await;
            if let Err(e) = &outcome {
                error!("Failed to connect client with ID {}: {}", client.id(), e);
            }
            (client.id().clone(), outcome)
        }))
        .instrument(operation_span("connect_all", "client-registry"))
        .await;

        let connected = outcomes.iter().filter(|(_, outcome)| outcome.is_ok()).count();
        info!("Connected {} of {} clients", connected, outcomes.len());
        Ok(outcomes)
    }

    /// Disconnect every client
    pub async fn disconnect_all(&self) -> Result<()> {
        let clients = self.clients()?;
        join_all(clients.iter().map(|client| async move {
            debug!("Disconnecting client with ID {}", client.id());
            if let Err(e) = client.disconnect().await {
                // continue with the other clients
                warn!("Failed to disconnect client with ID {}: {}", client.id(), e);
            }
        }))
        .instrument(operation_span("disconnect_all", "client-registry"))
        .await;

        info!("Disconnected {} clients", clients.len());
        Ok(())
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        if let Ok(clients) = self.clients.get_mut() {
            for entry in clients.values() {
                entry.forwarder.abort();
            }
        }
    }
}

/// A shared client registry that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedClientRegistry(Arc<ClientRegistry>);

impl SharedClientRegistry {
    /// Wrap a registry
    pub fn new(registry: ClientRegistry) -> Self {
        Self(Arc::new(registry))
    }

    /// Get a reference to the client registry
    pub fn registry(&self) -> &ClientRegistry {
        &self.0
    }
}

impl AsRef<ClientRegistry> for SharedClientRegistry {
    fn as_ref(&self) -> &ClientRegistry {
        self.registry()
    }
}
