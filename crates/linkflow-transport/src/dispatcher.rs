/*!
 * Paced, single-consumer outbound command queue.
 *
 * Callers enqueue from any task without blocking. At most one drain task
 * pulls commands off the queue and writes them to the transport, sleeping
 * the pacing interval after each write so slow device firmware is never
 * flooded.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn, Instrument};

use linkflow_core::logging::component_span;
use linkflow_core::types::Id;

use crate::error::{LinkError, Result};
use crate::transport::Transport;

/// Default pause after each write
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Default bound on queued commands
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// What happens to commands submitted while the link is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectedPolicy {
    /// Hold commands until the next session comes up
    #[default]
    Queue,
    /// Refuse commands with [`LinkError::SendWhileDisconnected`]
    Reject,
}

/// An outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    payload: Bytes,
    pacing: Option<Duration>,
}

impl Command {
    /// Create a command from raw bytes
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            pacing: None,
        }
    }

    /// Create a command from text, sent exactly as given
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Override the pause that follows this command
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Get the payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the pacing override, if any
    pub fn pacing(&self) -> Option<Duration> {
        self.pacing
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Bytes> for Command {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

/// A command waiting in the queue
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Bytes to write
    pub payload: Bytes,
    /// When the command was accepted
    pub enqueued_at: Instant,
    /// Pacing override
    pub pacing: Option<Duration>,
}

/// Something the drain did with a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The command was written to the transport
    Sent {
        /// The bytes written
        payload: Bytes,
        /// Time spent in the queue
        queued_for: Duration,
    },
    /// The write failed and the command was discarded
    Rejected {
        /// The bytes that were not written
        payload: Bytes,
        /// Why the write failed
        reason: String,
    },
    /// Pending commands were dropped without being written
    Dropped {
        /// Number of commands dropped
        count: usize,
    },
}

/// Dispatcher settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Pause after each write unless the command overrides it
    pub default_pacing: Duration,
    /// Behaviour while the link is down
    pub policy: DisconnectedPolicy,
    /// Maximum number of queued commands
    pub capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_pacing: DEFAULT_PACING,
            policy: DisconnectedPolicy::Queue,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Called from the drain task when a write fails
pub type SendFailureHook = Arc<dyn Fn(LinkError) + Send + Sync>;

#[derive(Debug, Default)]
struct DispatchQueue {
    pending: VecDeque<PendingCommand>,
    draining: bool,
    online: bool,
}

struct DispatcherInner {
    id: Id,
    sink: Arc<dyn Transport>,
    config: DispatcherConfig,
    queue: Mutex<DispatchQueue>,
    events: broadcast::Sender<DispatchEvent>,
    on_send_failure: Option<SendFailureHook>,
}

impl DispatcherInner {
    fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-consumer command queue in front of a transport
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher writing to `sink`. It starts offline.
    pub fn new(id: Id, sink: Arc<dyn Transport>, config: DispatcherConfig) -> Self {
        Self::build(id, sink, config, None)
    }

    /// Create a dispatcher that reports failed writes to `hook`
    pub fn with_failure_hook(
        id: Id,
        sink: Arc<dyn Transport>,
        config: DispatcherConfig,
        hook: SendFailureHook,
    ) -> Self {
        Self::build(id, sink, config, Some(hook))
    }

    fn build(
        id: Id,
        sink: Arc<dyn Transport>,
        config: DispatcherConfig,
        on_send_failure: Option<SendFailureHook>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                id,
                sink,
                config,
                queue: Mutex::new(DispatchQueue::default()),
                events,
                on_send_failure,
            }),
        }
    }

    /// Get the dispatcher settings
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Subscribe to dispatch events
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// Number of commands waiting to be written
    pub fn pending_len(&self) -> usize {
        self.inner.queue().pending.len()
    }

    /// Check whether the drain is allowed to write
    pub fn is_online(&self) -> bool {
        self.inner.queue().online
    }

    /// Queue a command. Never waits for the write.
    ///
    /// On error the command is not queued.
    pub fn enqueue(&self, command: impl Into<Command>) -> Result<()> {
        let command = command.into();
        let mut queue = self.inner.queue();

        if !queue.online && self.inner.config.policy == DisconnectedPolicy::Reject {
            return Err(LinkError::SendWhileDisconnected);
        }
        if queue.pending.len() >= self.inner.config.capacity {
            return Err(LinkError::QueueFull(queue.pending.len()));
        }

        queue.pending.push_back(PendingCommand {
            payload: command.payload,
            enqueued_at: Instant::now(),
            pacing: command.pacing,
        });
        trace!(pending = queue.pending.len(), "command queued");

        if queue.online && !queue.draining {
            if let Err(err) = self.start_drain(&mut queue) {
                queue.pending.pop_back();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Allow writes and start draining whatever is queued
    pub fn set_online(&self) -> Result<()> {
        let mut queue = self.inner.queue();
        queue.online = true;
        if !queue.pending.is_empty() && !queue.draining {
            self.start_drain(&mut queue)?;
        }
        Ok(())
    }

    /// Stop writing and drop every pending command. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut queue = self.inner.queue();
            queue.online = false;
            let dropped = queue.pending.len();
            queue.pending.clear();
            dropped
        };

        if dropped > 0 {
            debug!(id = %self.inner.id, dropped, "pending commands dropped");
            let _ = self.inner.events.send(DispatchEvent::Dropped { count: dropped });
        }
        dropped
    }

    fn start_drain(&self, queue: &mut DispatchQueue) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| {
            LinkError::Other("command drain requires a Tokio runtime".to_string())
        })?;

        queue.draining = true;
        let inner = self.inner.clone();
        let span = component_span("dispatcher", Some(inner.id.as_str()));
        handle.spawn(drain(inner).instrument(span));
        Ok(())
    }
}

async fn drain(inner: Arc<DispatcherInner>) {
    loop {
        let command = {
            let mut queue = inner.queue();
            if !queue.online {
                queue.draining = false;
                return;
            }
            match queue.pending.pop_front() {
                Some(command) => command,
                None => {
                    queue.draining = false;
                    return;
                }
            }
        };

        match inner.sink.send(&command.payload).await {
            Ok(()) => {
                trace!(bytes = command.payload.len(), "command written");
                let pacing = command.pacing.unwrap_or(inner.config.default_pacing);
                let _ = inner.events.send(DispatchEvent::Sent {
                    queued_for: command.enqueued_at.elapsed(),
                    payload: command.payload,
                });
                if !pacing.is_zero() {
                    time::sleep(pacing).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "command write failed");
                let reason = err.to_string();

                match inner.config.policy {
                    DisconnectedPolicy::Queue => {
                        {
                            let mut queue = inner.queue();
                            queue.pending.push_front(command);
                            queue.online = false;
                            queue.draining = false;
                        }
                        if let Some(hook) = &inner.on_send_failure {
                            hook(err);
                        }
                        return;
                    }
                    DisconnectedPolicy::Reject => {
                        let _ = inner.events.send(DispatchEvent::Rejected {
                            payload: command.payload,
                            reason,
                        });
                        if let Some(hook) = &inner.on_send_failure {
                            hook(err);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::memory::MemoryTransport;
    use crate::transport::Transport as _;

    fn dispatcher(transport: &Arc<MemoryTransport>, config: DispatcherConfig) -> CommandDispatcher {
        CommandDispatcher::new(Id::from("dsp"), transport.clone(), config)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_writes() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        transport.connect().await.unwrap();
        let dispatcher = dispatcher(
            &transport,
            DispatcherConfig {
                default_pacing: Duration::from_millis(50),
                ..Default::default()
            },
        );
        dispatcher.set_online().unwrap();

        dispatcher.enqueue("a").unwrap();
        dispatcher.enqueue("b").unwrap();
        dispatcher.enqueue("c").unwrap();

        time::sleep(Duration::from_millis(200)).await;

        let records = transport.sent_records();
        let payloads: Vec<&[u8]> = records.iter().map(|r| &r.payload[..]).collect();
        assert_eq!(payloads, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        for pair in records.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_override_per_command() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        transport.connect().await.unwrap();
        let dispatcher = dispatcher(&transport, DispatcherConfig::default());
        dispatcher.set_online().unwrap();

        dispatcher
            .enqueue(Command::text("slow").with_pacing(Duration::from_millis(500)))
            .unwrap();
        dispatcher.enqueue("next").unwrap();

        time::sleep(Duration::from_millis(700)).await;

        let records = transport.sent_records();
        assert_eq!(records.len(), 2);
        assert!(records[1].at - records[0].at >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_while_offline_then_drain_in_order() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(
            &transport,
            DispatcherConfig {
                default_pacing: Duration::from_millis(10),
                ..Default::default()
            },
        );

        for i in 0..5 {
            dispatcher.enqueue(format!("cmd{}", i)).unwrap();
        }
        assert_eq!(dispatcher.pending_len(), 5);
        settle().await;
        assert!(transport.sent().is_empty());

        transport.connect().await.unwrap();
        dispatcher.set_online().unwrap();
        time::sleep(Duration::from_millis(100)).await;

        let sent: Vec<Bytes> = transport.sent();
        let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("cmd{}", i))).collect();
        assert_eq!(sent, expected);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_policy_while_offline() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(
            &transport,
            DispatcherConfig {
                policy: DisconnectedPolicy::Reject,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            assert!(matches!(
                dispatcher.enqueue("power on"),
                Err(LinkError::SendWhileDisconnected)
            ));
        }
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_capacity() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(
            &transport,
            DispatcherConfig {
                capacity: 2,
                ..Default::default()
            },
        );

        dispatcher.enqueue("1").unwrap();
        dispatcher.enqueue("2").unwrap();
        assert!(matches!(dispatcher.enqueue("3"), Err(LinkError::QueueFull(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_and_reports() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(&transport, DispatcherConfig::default());
        let mut events = dispatcher.subscribe();

        dispatcher.enqueue("1").unwrap();
        dispatcher.enqueue("2").unwrap();
        assert_eq!(dispatcher.clear(), 2);
        assert_eq!(dispatcher.pending_len(), 0);
        assert!(!dispatcher.is_online());
        assert_eq!(events.recv().await.unwrap(), DispatchEvent::Dropped { count: 2 });

        // nothing to drop, nothing reported
        assert_eq!(dispatcher.clear(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_requeues_under_queue_policy() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        transport.connect().await.unwrap();
        transport.set_fail_sends(true);

        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        let dispatcher = CommandDispatcher::with_failure_hook(
            Id::from("dsp"),
            transport.clone(),
            DispatcherConfig::default(),
            Arc::new(move |err: LinkError| seen.lock().unwrap().push(err.to_string())),
        );
        dispatcher.set_online().unwrap();
        dispatcher.enqueue("volume 10").unwrap();
        dispatcher.enqueue("volume 11").unwrap();
        settle().await;

        assert_eq!(dispatcher.pending_len(), 2);
        assert!(!dispatcher.is_online());
        assert_eq!(failures.lock().unwrap().len(), 1);

        transport.set_fail_sends(false);
        dispatcher.set_online().unwrap();
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            transport.sent(),
            vec![Bytes::from("volume 10"), Bytes::from("volume 11")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_reported_under_reject_policy() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        transport.connect().await.unwrap();
        transport.set_fail_sends(true);

        let dispatcher = dispatcher(
            &transport,
            DispatcherConfig {
                policy: DisconnectedPolicy::Reject,
                ..Default::default()
            },
        );
        let mut events = dispatcher.subscribe();
        dispatcher.set_online().unwrap();
        dispatcher.enqueue("mute").unwrap();
        dispatcher.enqueue("unmute").unwrap();

        for expected in ["mute", "unmute"] {
            match events.recv().await.unwrap() {
                DispatchEvent::Rejected { payload, .. } => assert_eq!(payload, Bytes::from(expected)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_enqueue_outside_runtime_keeps_command() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(&transport, DispatcherConfig::default());

        dispatcher.enqueue("queued offline").unwrap();
        assert!(dispatcher.set_online().is_err());
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[test]
    fn test_failed_enqueue_leaves_nothing_queued() {
        let transport = Arc::new(MemoryTransport::new("dsp"));
        let dispatcher = dispatcher(&transport, DispatcherConfig::default());

        dispatcher.set_online().unwrap();
        assert!(dispatcher.enqueue("GAIN 3").is_err());
        assert_eq!(dispatcher.pending_len(), 0);
        assert!(transport.sent().is_empty());
    }
}
