/*!
 * Connection lifecycle and automatic reconnection.
 *
 * The supervisor owns a transport, the frame accumulator fed by it and the
 * command dispatcher writing to it. It serializes connect, disconnect and
 * link-loss handling behind one async lock, publishes a notification for
 * every state transition, and reconnects on a fixed interval after failures.
 *
 * A single timer task per supervisor drives reconnection. Arming it replaces
 * the previous deadline; `disconnect` disarms it, so no retry can fire after
 * an explicit disconnect returns.
 */
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn, Instrument};

use linkflow_core::logging::component_span;
use linkflow_core::types::Id;
use linkflow_core::utils::{spawn_and_log, with_timeout};

use crate::dispatcher::{Command, CommandDispatcher, DispatcherConfig};
use crate::error::{LinkError, Result};
use crate::framing::{FrameAccumulator, FramingRule, DEFAULT_MAX_BUFFER};
use crate::state::{ConnectionState, FailureKind, StateChange};
use crate::transport::{InboundReceiver, Transport, TransportEvent};

/// Default delay before reconnecting
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound for one connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const STATE_CHANNEL_CAPACITY: usize = 100;

/// Callback receiving each complete inbound frame
pub type FrameHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// When and how often to reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between a failure and the next attempt
    pub interval: Duration,
    /// Reconnect at all
    pub enabled: bool,
    /// Keep reconnecting after the device rejected our credentials
    pub retry_on_auth_failure: bool,
}

impl RetryPolicy {
    /// Retry every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Never retry
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set whether authentication failures are retried
    pub fn with_retry_on_auth_failure(mut self, retry: bool) -> Self {
        self.retry_on_auth_failure = retry;
        self
    }

    /// Check whether a failure of this kind schedules another attempt
    pub fn should_retry(&self, kind: FailureKind) -> bool {
        if !self.enabled {
            return false;
        }
        match kind {
            FailureKind::AuthenticationRejected => self.retry_on_auth_failure,
            _ => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            enabled: true,
            retry_on_auth_failure: true,
        }
    }
}

/// Everything a supervisor needs besides its transport
#[derive(Clone)]
pub struct SupervisorOptions {
    /// How inbound bytes are split into frames
    pub framing: FramingRule,
    /// Largest unterminated remainder kept in the receive buffer
    pub max_buffer: usize,
    /// Upper bound for one connect attempt
    pub connect_timeout: Duration,
    /// Reconnect behaviour
    pub retry: RetryPolicy,
    /// Outbound queue settings
    pub dispatch: DispatcherConfig,
    /// Receives every complete frame
    pub frame_handler: Option<FrameHandler>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            framing: FramingRule::default(),
            max_buffer: DEFAULT_MAX_BUFFER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            dispatch: DispatcherConfig::default(),
            frame_handler: None,
        }
    }
}

impl fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("framing", &self.framing)
            .field("max_buffer", &self.max_buffer)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &self.retry)
            .field("dispatch", &self.dispatch)
            .field("frame_handler", &self.frame_handler.is_some())
            .finish()
    }
}

type Deadline = Option<(u64, Instant)>;

/// One reusable reconnect timer
struct RetryTimer {
    deadline: watch::Sender<Deadline>,
    epoch: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetryTimer {
    fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            deadline,
            epoch: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    fn arm(&self, after: Duration) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.deadline.send_replace(Some((epoch, Instant::now() + after)));
        epoch
    }

    fn disarm(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.deadline.send_replace(None);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn is_armed(&self) -> bool {
        self.deadline.borrow().is_some()
    }
}

async fn run_retry_timer(owner: Weak<SupervisorInner>, mut deadline: watch::Receiver<Deadline>) {
    loop {
        let armed = *deadline.borrow_and_update();
        if let Some((epoch, at)) = armed {
            tokio::select! {
                _ = time::sleep_until(at) => {
                    match owner.upgrade() {
                        Some(inner) => inner.retry_fired(epoch).await,
                        None => return,
                    }
                }
                changed = deadline.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }
        if deadline.changed().await.is_err() {
            return;
        }
    }
}

struct SupervisorInner {
    id: Id,
    transport: Arc<dyn Transport>,
    accumulator: Arc<FrameAccumulator>,
    dispatcher: CommandDispatcher,
    frame_handler: Option<FrameHandler>,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    retry_policy: Mutex<RetryPolicy>,
    connect_lock: AsyncMutex<()>,
    completed_attempts: AtomicU64,
    failed_attempts: AtomicU32,
    session: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    retry_timer: RetryTimer,
    events: broadcast::Sender<StateChange>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SupervisorInner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn retry_policy(&self) -> RetryPolicy {
        *lock(&self.retry_policy)
    }

    /// Publish while holding the state lock so notifications keep transition order
    fn set_state(&self, new_state: ConnectionState) {
        let mut state = lock(&self.state);
        let old_state = *state;
        if old_state == new_state {
            return;
        }
        *state = new_state;
        debug!(from = %old_state, to = %new_state, "state change");
        let _ = self.events.send(StateChange {
            source: self.id.clone(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state().is_connected() {
            return Ok(());
        }

        let seen = self.completed_attempts.load(Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        if self.completed_attempts.load(Ordering::SeqCst) != seen {
            // another caller finished an attempt while we waited: share its outcome
            return match self.state() {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Failed(kind) => Err(LinkError::Other(format!(
                    "concurrent connect attempt failed: {:?}",
                    kind
                ))),
                _ => Err(LinkError::NotConnected),
            };
        }

        self.connect_locked().await
    }

    /// Caller holds the connect lock
    async fn connect_locked(self: &Arc<Self>) -> Result<()> {
        if self.state().is_connected() {
            return Ok(());
        }

        self.retry_timer.disarm();
        self.teardown().await;
        self.set_state(ConnectionState::Connecting);
        info!(peer = %self.transport.peer(), transport = self.transport.name(), "connecting");

        let outcome = with_timeout(self.connect_timeout, self.transport.connect()).await;
        self.completed_attempts.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(inbound) => {
                let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
                self.failed_attempts.store(0, Ordering::SeqCst);
                self.start_reader(inbound, session);
                // accept commands before anyone can observe Connected
                self.dispatcher.set_online()?;
                self.set_state(ConnectionState::Connected);
                info!(peer = %self.transport.peer(), "connected");
                Ok(())
            }
            Err(err) => {
                let kind = err.failure_kind().unwrap_or(FailureKind::LocalClose);
                let failures = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(peer = %self.transport.peer(), error = %err, failures, "connect failed");

                // a timed-out attempt may have left a half-open transport behind
                if let Err(e) = self.transport.disconnect().await {
                    debug!("cleanup after failed connect: {}", e);
                }
                self.set_state(ConnectionState::Failed(kind));
                self.schedule_retry(kind);
                Err(err)
            }
        }
    }

    async fn retry_fired(self: &Arc<Self>, epoch: u64) {
        let _guard = self.connect_lock.lock().await;
        if !self.retry_timer.is_current(epoch) {
            debug!("stale retry ignored");
            return;
        }
        debug!("retry timer fired");
        if let Err(e) = self.connect_locked().await {
            debug!("reconnect attempt failed: {}", e);
        }
    }

    async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.retry_timer.disarm();

        match self.state() {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.dispatcher.clear();
                Ok(())
            }
            _ => {
                self.end_session().await;
                self.set_state(ConnectionState::Disconnected);
                info!(peer = %self.transport.peer(), "disconnected");
                Ok(())
            }
        }
    }

    async fn handle_link_loss(self: Arc<Self>, session: u64, err: LinkError) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.session.load(Ordering::SeqCst) != session || !self.state().is_connected() {
            debug!(error = %err, "link loss from an ended session ignored");
            return Ok(());
        }

        let kind = err.failure_kind().unwrap_or(FailureKind::LocalClose);
        warn!(peer = %self.transport.peer(), error = %err, "link lost");

        self.end_session().await;
        self.set_state(ConnectionState::Failed(kind));
        self.schedule_retry(kind);
        Ok(())
    }

    fn report_link_loss(self: &Arc<Self>, err: LinkError) {
        let session = self.session.load(Ordering::SeqCst);
        let inner = self.clone();
        spawn_and_log("link-loss", inner.handle_link_loss(session, err));
    }

    fn schedule_retry(&self, kind: FailureKind) {
        let policy = self.retry_policy();
        if policy.should_retry(kind) {
            self.retry_timer.arm(policy.interval);
            debug!(kind = ?kind, after = ?policy.interval, "reconnect scheduled");
        } else {
            debug!(kind = ?kind, "not reconnecting");
        }
    }

    fn start_reader(self: &Arc<Self>, mut inbound: InboundReceiver, session: u64) {
        let owner = Arc::downgrade(self);
        let accumulator = self.accumulator.clone();
        let handler = self.frame_handler.clone();
        let span = component_span("link-reader", Some(self.id.as_str()));

        let handle = tokio::spawn(
            async move {
                let failure = loop {
                    match inbound.recv().await {
                        Some(TransportEvent::Data(chunk)) => {
                            let fed = accumulator.feed_with(&chunk, |frame| {
                                if let Some(handler) = &handler {
                                    handler(frame);
                                }
                            });
                            if let Err(err) = fed {
                                break err;
                            }
                        }
                        Some(TransportEvent::Closed(None)) => break LinkError::PeerClosed,
                        Some(TransportEvent::Closed(Some(err))) => break err,
                        None => break LinkError::LocalClose("inbound channel closed".to_string()),
                    }
                };

                // teardown aborts this task, so the loss is handled elsewhere
                if let Some(inner) = owner.upgrade() {
                    spawn_and_log("link-loss", inner.handle_link_loss(session, failure));
                }
            }
            .instrument(span),
        );

        if let Some(previous) = lock(&self.reader).replace(handle) {
            previous.abort();
        }
    }

    async fn teardown(&self) {
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("transport disconnect: {}", e);
        }
        if let Err(e) = self.accumulator.clear() {
            warn!("failed to clear receive buffer: {}", e);
        }
    }

    async fn end_session(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.dispatcher.clear();
        self.teardown().await;
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(timer) = lock(&self.retry_timer.task).take() {
            timer.abort();
        }
    }
}

/// Owns one link: connect, disconnect, reconnect, receive and send
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ConnectionSupervisor {
    /// Create a supervisor. Must be called inside a Tokio runtime.
    pub fn new(id: Id, transport: Arc<dyn Transport>, options: SupervisorOptions) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            LinkError::Other("ConnectionSupervisor must be created inside a Tokio runtime".to_string())
        })?;
        let accumulator = Arc::new(FrameAccumulator::new(options.framing, options.max_buffer)?);
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<SupervisorInner>| {
            let owner = weak.clone();
            let dispatcher = CommandDispatcher::with_failure_hook(
                id.clone(),
                transport.clone(),
                options.dispatch,
                Arc::new(move |err: LinkError| {
                    if let Some(inner) = owner.upgrade() {
                        inner.report_link_loss(err);
                    }
                }),
            );

            SupervisorInner {
                id: id.clone(),
                transport,
                accumulator,
                dispatcher,
                frame_handler: options.frame_handler,
                connect_timeout: options.connect_timeout,
                state: Mutex::new(ConnectionState::Idle),
                retry_policy: Mutex::new(options.retry),
                connect_lock: AsyncMutex::new(()),
                completed_attempts: AtomicU64::new(0),
                failed_attempts: AtomicU32::new(0),
                session: AtomicU64::new(0),
                reader: Mutex::new(None),
                retry_timer: RetryTimer::new(),
                events,
            }
        });

        let span = component_span("retry-timer", Some(id.as_str()));
        let timer = handle.spawn(
            run_retry_timer(Arc::downgrade(&inner), inner.retry_timer.deadline.subscribe())
                .instrument(span),
        );
        *lock(&inner.retry_timer.task) = Some(timer);

        Ok(Self { inner })
    }

    /// Get the link id
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// Get the transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Get the outbound command queue
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    /// Get the inbound frame accumulator
    pub fn accumulator(&self) -> &FrameAccumulator {
        &self.inner.accumulator
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }

    /// Replace the retry policy.
    ///
    /// A pending reconnect survives only if the new policy still retries the
    /// current failure. A policy that covers the failure schedules one.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *lock(&self.inner.retry_policy) = policy;
        match self.inner.state() {
            ConnectionState::Failed(kind) if policy.should_retry(kind) => {
                if !self.inner.retry_timer.is_armed() {
                    self.inner.retry_timer.arm(policy.interval);
                }
            }
            _ => self.inner.retry_timer.disarm(),
        }
    }

    /// Check whether a reconnect is scheduled
    pub fn is_retry_pending(&self) -> bool {
        self.inner.retry_timer.is_armed()
    }

    /// Failed connect attempts since the last successful one
    pub fn failed_attempts(&self) -> u32 {
        self.inner.failed_attempts.load(Ordering::SeqCst)
    }

    /// Open the link. Returns immediately when already connected.
    ///
    /// A failure is also published as a state change and, if the retry
    /// policy allows it, schedules a reconnect.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the link, cancel any pending reconnect and drop queued commands
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    /// Queue a command for the link
    pub fn enqueue(&self, command: impl Into<Command>) -> Result<()> {
        self.inner.dispatcher.enqueue(command)
    }
}
