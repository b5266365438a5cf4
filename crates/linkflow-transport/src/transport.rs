/*!
 * The raw byte-stream contract every link runs on.
 *
 * A transport knows how to open and close one connection and how to write
 * bytes to it. Inbound bytes are delivered on the channel returned by
 * [`Transport::connect`], so the transport never calls back into the
 * supervisor that owns it.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{LinkError, Result};

/// Capacity of the inbound channel handed out by transports
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Something that happened on the receive side of a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A chunk of bytes, with no framing guarantee
    Data(Bytes),
    /// The receive side ended; `None` means an orderly close by the peer
    Closed(Option<LinkError>),
}

/// Receiver for inbound transport events
pub type InboundReceiver = mpsc::Receiver<TransportEvent>;

/// Raw byte-stream source and sink
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Short transport name used in logs (`tcp`, `udp`, `serial`, ...)
    fn name(&self) -> &'static str;

    /// Human-readable remote address
    fn peer(&self) -> String;

    /// Open the connection and start receiving.
    ///
    /// Calling `connect` while connected replaces the previous connection.
    async fn connect(&self) -> Result<InboundReceiver>;

    /// Close the connection. Closing a closed transport is not an error.
    async fn disconnect(&self) -> Result<()>;

    /// Write bytes to the connection
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Check whether the transport currently holds an open connection
    fn is_connected(&self) -> bool;
}

/// Translate a read-side I/O failure into the close event a reader task emits
pub(crate) fn close_event(err: std::io::Error) -> TransportEvent {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => TransportEvent::Closed(Some(LinkError::PeerClosed)),
        _ => TransportEvent::Closed(Some(LinkError::Io(err))),
    }
}
