/*!
 * Concrete transports and the registry that builds them from endpoints.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{LinkError, Result};
use crate::transport::{close_event, Transport, TransportEvent};

pub mod memory;
pub mod tcp;
pub mod udp;

#[cfg(feature = "serial")]
pub mod serial;

pub use memory::{ConnectOutcome, MemoryTransport, SentRecord};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Size of a single read from a stream transport
pub const READ_CHUNK_SIZE: usize = 4096;

/// Pump a byte stream into the inbound channel until it ends.
///
/// `connected` is cleared when the stream ends on its own.
pub(crate) fn spawn_stream_reader<R>(
    mut reader: R,
    inbound: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        loop {
            buf.reserve(READ_CHUNK_SIZE);
            let event = match reader.read_buf(&mut buf).await {
                Ok(0) => TransportEvent::Closed(None),
                Ok(n) => {
                    trace!(bytes = n, "read");
                    if inbound.send(TransportEvent::Data(buf.split().freeze())).await.is_err() {
                        // receiver gone: the owner tore the session down
                        return;
                    }
                    continue;
                }
                Err(err) => close_event(err),
            };

            connected.store(false, Ordering::SeqCst);
            debug!("stream reader finished");
            let _ = inbound.send(event).await;
            return;
        }
    })
}

/// Builds a transport for an endpoint
pub type TransportFactory = Arc<dyn Fn(&Endpoint) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Scheme to factory map, populated explicitly at startup
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl TransportRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in transport
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("tcp", |endpoint| match endpoint {
            Endpoint::Tcp { host, port } => {
                Ok(Arc::new(TcpTransport::new(host.clone(), *port)) as Arc<dyn Transport>)
            }
            other => Err(mismatch("tcp", other)),
        });

        registry.register("udp", |endpoint| match endpoint {
            Endpoint::Udp { host, port, local_port } => Ok(Arc::new(
                UdpTransport::new(host.clone(), *port).with_local_port(*local_port),
            ) as Arc<dyn Transport>),
            other => Err(mismatch("udp", other)),
        });

        registry.register("memory", |endpoint| match endpoint {
            Endpoint::Memory { name } => {
                Ok(Arc::new(MemoryTransport::new(name.clone())) as Arc<dyn Transport>)
            }
            other => Err(mismatch("memory", other)),
        });

        #[cfg(feature = "serial")]
        registry.register("serial", |endpoint| match endpoint {
            Endpoint::Serial(settings) => {
                Ok(Arc::new(SerialTransport::new(settings.clone())) as Arc<dyn Transport>)
            }
            other => Err(mismatch("serial", other)),
        });

        registry
    }

    /// Register a factory, replacing any previous one for the scheme
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Endpoint) -> Result<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Check whether a scheme has a factory
    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Build a transport for an endpoint
    pub fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let factory = self
            .factories
            .get(endpoint.scheme())
            .ok_or_else(|| LinkError::UnsupportedTransport(endpoint.scheme().to_string()))?;
        factory(endpoint)
    }

    /// Parse a connection string and build its transport
    pub fn create_from_str(&self, conn_str: &str) -> Result<Arc<dyn Transport>> {
        self.create(&Endpoint::parse(conn_str)?)
    }
}

fn mismatch(scheme: &str, endpoint: &Endpoint) -> LinkError {
    LinkError::InvalidEndpoint(format!("{} factory cannot open {}", scheme, endpoint))
}
