/*!
 * TCP stream transport.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{connect_failed, LinkError, Result};
use crate::transport::{InboundReceiver, Transport, INBOUND_CHANNEL_CAPACITY};
use crate::transports::spawn_stream_reader;

/// TCP client transport
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    nodelay: bool,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Create a transport for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            nodelay: true,
            writer: AsyncMutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enable or disable Nagle's algorithm (disabled by default)
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<InboundReceiver> {
        self.disconnect().await?;

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| connect_failed(&self.peer(), e))?;
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            warn!(peer = %self.peer(), "failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        let handle = spawn_stream_reader(read_half, tx, self.connected.clone());
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!(peer = %self.peer(), "TCP connection open");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_reader();
        self.connected.store(false, Ordering::SeqCst);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer(), "TCP shutdown: {}", e);
            }
        }
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(LinkError::NotConnected)?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
