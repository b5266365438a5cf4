/*!
 * Serial line transport, built on `tokio-serial`.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use crate::endpoint::{Parity, SerialSettings};
use crate::error::{connect_failed, LinkError, Result};
use crate::transport::{InboundReceiver, Transport, INBOUND_CHANNEL_CAPACITY};
use crate::transports::spawn_stream_reader;

/// Serial port transport
pub struct SerialTransport {
    settings: SerialSettings,
    writer: AsyncMutex<Option<WriteHalf<SerialStream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("settings", &self.settings)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SerialTransport {
    /// Create a transport for the given line settings
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            writer: AsyncMutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the line settings
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn open(&self) -> Result<SerialStream> {
        let data_bits = match self.settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(LinkError::Configuration(format!(
                    "unsupported data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match self.settings.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(LinkError::Configuration(format!(
                    "unsupported stop bits: {}",
                    other
                )))
            }
        };
        let parity = match self.settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        tokio_serial::new(&self.settings.path, self.settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| connect_failed(&self.settings.path, std::io::Error::from(e)))
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
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn peer(&self) -> String {
        format!("{}@{}", self.settings.path, self.settings.baud_rate)
    }

    async fn connect(&self) -> Result<InboundReceiver> {
        self.disconnect().await?;

        let port = self.open()?;
        let (read_half, write_half) = tokio::io::split(port);
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        let handle = spawn_stream_reader(read_half, tx, self.connected.clone());
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!(port = %self.peer(), "serial port open");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_reader();
        self.connected.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_is_unreachable() {
        let transport = SerialTransport::new(SerialSettings::new("/dev/linkflow-missing", 9600));
        assert_eq!(transport.peer(), "/dev/linkflow-missing@9600");
        assert!(matches!(transport.connect().await, Err(LinkError::Unreachable(_))));
        assert!(!transport.is_connected());
    }
}
