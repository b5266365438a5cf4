/*!
 * In-process transport with scripted behaviour.
 *
 * Useful for simulating a device: connect outcomes are scripted, inbound
 * bytes are injected by hand and every write is recorded with the time it
 * happened.
 */
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::transport::{InboundReceiver, Transport, TransportEvent, INBOUND_CHANNEL_CAPACITY};

/// How the next connect attempt ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectOutcome {
    /// The connection opens
    #[default]
    Accept,
    /// The host cannot be reached
    Unreachable,
    /// The device refuses our credentials
    Reject,
    /// The attempt never completes
    Hang,
}

/// A write recorded by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// The bytes written
    pub payload: Bytes,
    /// When they were written
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    inbound: Option<mpsc::Sender<TransportEvent>>,
    script: VecDeque<ConnectOutcome>,
    fallback: ConnectOutcome,
    connect_delay: Duration,
    fail_sends: bool,
    sent: Vec<SentRecord>,
}

/// Scripted in-memory transport
#[derive(Debug)]
pub struct MemoryTransport {
    peer: String,
    state: Mutex<MemoryState>,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    /// Create a transport that accepts every connect attempt
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: Mutex::new(MemoryState::default()),
            attempts: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue outcomes for the next connect attempts, in order
    pub fn script<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = ConnectOutcome>,
    {
        self.state().script.extend(outcomes);
    }

    /// Outcome used once the script runs out
    pub fn set_fallback_outcome(&self, outcome: ConnectOutcome) {
        self.state().fallback = outcome;
    }

    /// Delay every connect attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Make writes fail while set
    pub fn set_fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Number of connect attempts so far
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every payload written so far
    pub fn sent(&self) -> Vec<Bytes> {
        self.state().sent.iter().map(|r| r.payload.clone()).collect()
    }

    /// Every write so far, with timestamps
    pub fn sent_records(&self) -> Vec<SentRecord> {
        self.state().sent.clone()
    }

    /// Deliver bytes as if the device had sent them
    pub async fn inject(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let sender = self.state().inbound.clone().ok_or(LinkError::NotConnected)?;
        sender
            .send(TransportEvent::Data(bytes.into()))
            .await
            .map_err(|_| LinkError::NotConnected)
    }

    /// End the connection from the device side. `None` is an orderly close.
    pub async fn close_remote(&self, error: Option<LinkError>) -> Result<()> {
        let sender = {
            let mut state = self.state();
            state.connected = false;
            state.inbound.take()
        };
        let sender = sender.ok_or(LinkError::NotConnected)?;
        let _ = sender.send(TransportEvent::Closed(error)).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn connect(&self) -> Result<InboundReceiver> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (outcome, delay) = {
            let mut state = self.state();
            let outcome = state.script.pop_front().unwrap_or(state.fallback);
            (outcome, state.connect_delay)
        };

        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        match outcome {
            ConnectOutcome::Accept => {
                let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
                let mut state = self.state();
                state.connected = true;
                state.inbound = Some(tx);
                debug!(peer = %self.peer, "memory link open");
                Ok(rx)
            }
            ConnectOutcome::Unreachable => Err(LinkError::Unreachable(self.peer.clone())),
            ConnectOutcome::Reject => Err(LinkError::Rejected("credentials refused".to_string())),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        state.connected = false;
        state.inbound = None;
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.fail_sends {
            return Err(LinkError::LocalClose("write failed".to_string()));
        }
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.sent.push(SentRecord {
            payload: Bytes::copy_from_slice(bytes),
            at: Instant::now(),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let transport = MemoryTransport::new("projector");
        transport.script([ConnectOutcome::Unreachable, ConnectOutcome::Reject]);

        assert!(matches!(transport.connect().await, Err(LinkError::Unreachable(_))));
        assert!(matches!(transport.connect().await, Err(LinkError::Rejected(_))));
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_inject_and_close() {
        let transport = MemoryTransport::new("projector");
        assert!(matches!(transport.inject("x").await, Err(LinkError::NotConnected)));

        let mut inbound = transport.connect().await.unwrap();
        transport.inject("PWR=ON\r").await.unwrap();
        match inbound.recv().await {
            Some(TransportEvent::Data(bytes)) => assert_eq!(bytes, Bytes::from("PWR=ON\r")),
            other => panic!("unexpected event {:?}", other),
        }

        transport.close_remote(None).await.unwrap();
        assert!(matches!(inbound.recv().await, Some(TransportEvent::Closed(None))));
        assert!(inbound.recv().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MemoryTransport::new("projector");
        assert!(matches!(transport.send(b"x").await, Err(LinkError::NotConnected)));

        let _inbound = transport.connect().await.unwrap();
        transport.send(b"PWR ON\r").await.unwrap();
        assert_eq!(transport.sent(), vec![Bytes::from("PWR ON\r")]);

        transport.disconnect().await.unwrap();
        assert!(matches!(transport.send(b"x").await, Err(LinkError::NotConnected)));
    }
}
