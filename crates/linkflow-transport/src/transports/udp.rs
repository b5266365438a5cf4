/*!
 * Connected UDP socket transport.
 *
 * Each datagram arrives as one chunk. Framing still applies, so devices that
 * split replies across datagrams are handled the same way as streams.
 */
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{connect_failed, LinkError, Result};
use crate::transport::{InboundReceiver, Transport, TransportEvent, INBOUND_CHANNEL_CAPACITY};

/// Largest datagram we read
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Wildcard local address in the same family as `remote`
fn bind_addr_for(remote: &SocketAddr, local_port: u16) -> SocketAddr {
    let ip = match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, local_port)
}

#[derive(Debug, Default)]
struct UdpSession {
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
}

/// UDP transport bound to a single remote address
#[derive(Debug)]
pub struct UdpTransport {
    host: String,
    port: u16,
    local_port: u16,
    session: Mutex<UdpSession>,
    connected: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Create a transport for `host:port` using an ephemeral local port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_port: 0,
            session: Mutex::new(UdpSession::default()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind a fixed local port; some devices only answer to a known port
    pub fn with_local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    fn session(&self) -> MutexGuard<'_, UdpSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut session = self.session();
        if let Some(reader) = session.reader.take() {
            reader.abort();
        }
        session.socket = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<InboundReceiver> {
        self.close();

        let remote = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| connect_failed(&self.peer(), e))?
            .next()
            .ok_or_else(|| LinkError::Unreachable(format!("{}: no address", self.peer())))?;

        let socket = UdpSocket::bind(bind_addr_for(&remote, self.local_port))
            .await
            .map_err(LinkError::from_connect_io)?;
        socket
            .connect(remote)
            .await
            .map_err(|e| connect_failed(&self.peer(), e))?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let reader = {
            let socket = socket.clone();
            let connected = self.connected.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            if tx.send(TransportEvent::Data(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            connected.store(false, Ordering::SeqCst);
                            let event = if err.kind() == std::io::ErrorKind::ConnectionRefused {
                                TransportEvent::Closed(Some(LinkError::Unreachable(err.to_string())))
                            } else {
                                crate::transport::close_event(err)
                            };
                            let _ = tx.send(event).await;
                            return;
                        }
                    }
                }
            })
        };

        {
            let mut session = self.session();
            session.socket = Some(socket);
            session.reader = Some(reader);
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(peer = %self.peer(), local_port = self.local_port, "UDP socket connected");
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let socket = self.session().socket.clone().ok_or(LinkError::NotConnected)?;
        socket.send(bytes).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_exchange() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();

        let transport = UdpTransport::new("127.0.0.1", port);
        let mut inbound = transport.connect().await.unwrap();
        transport.send(b"GET VOL\r").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET VOL\r");

        device.send_to(b"VOL 12\r", from).await.unwrap();
        match inbound.recv().await {
            Some(TransportEvent::Data(bytes)) => assert_eq!(bytes, Bytes::from("VOL 12\r")),
            other => panic!("unexpected event {:?}", other),
        }

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(transport.send(b"x").await, Err(LinkError::NotConnected)));
    }

    #[test]
    fn test_bind_addr_follows_remote_family() {
        let v4: SocketAddr = "192.168.1.40:5000".parse().unwrap();
        assert_eq!(bind_addr_for(&v4, 0), "0.0.0.0:0".parse::<SocketAddr>().unwrap());

        let v6: SocketAddr = "[fe80::1]:5000".parse().unwrap();
        assert_eq!(bind_addr_for(&v6, 7000), "[::]:7000".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_datagram_exchange_over_ipv6() {
        // hosts without an IPv6 loopback have nothing to test
        let Ok(device) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let port = device.local_addr().unwrap().port();

        let transport = UdpTransport::new("::1", port);
        let _inbound = transport.connect().await.unwrap();
        transport.send(b"PING\r").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING\r");
    }
}
