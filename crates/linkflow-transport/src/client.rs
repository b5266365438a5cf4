/*!
 * Ready-to-use link clients.
 *
 * [`LinkClient`] bundles a transport, a framing rule, a paced command queue
 * and a reconnecting supervisor behind one handle. Build one by hand with
 * [`LinkClientBuilder`] or from configuration with
 * [`LinkClientBuilder::from_config`].
 */
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::broadcast;
use tracing::debug;

use linkflow_core::config::{ClientConfig, LinkConfig};
use linkflow_core::types::Id;
use linkflow_core::utils::millis_to_duration;

use crate::dispatcher::{Command, DispatchEvent, DisconnectedPolicy, DispatcherConfig};
use crate::error::{LinkError, Result};
use crate::framing::FramingRule;
use crate::state::{ConnectionState, StateChange};
use crate::supervisor::{ConnectionSupervisor, FrameHandler, RetryPolicy, SupervisorOptions};
use crate::transport::Transport;
use crate::transports::TransportRegistry;

/// Builder for [`LinkClient`]
pub struct LinkClientBuilder {
    id: Id,
    transport: Arc<dyn Transport>,
    options: SupervisorOptions,
}

impl std::fmt::Debug for LinkClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkClientBuilder")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("options", &self.options)
            .finish()
    }
}

impl LinkClientBuilder {
    /// Start a builder for `transport` with default settings
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            id: Id::new(),
            transport,
            options: SupervisorOptions::default(),
        }
    }

    /// Start a builder from a configured client entry
    pub fn from_config(
        client: &ClientConfig,
        link: &LinkConfig,
        transports: &TransportRegistry,
    ) -> Result<Self> {
        let transport = transports.create_from_str(&client.endpoint)?;
        let framing = match client.frame_length {
            Some(length) => FramingRule::fixed(length),
            None => FramingRule::delimiter(Bytes::from(client.delimiter.clone())),
        };
        let pacing = client.pacing_ms.unwrap_or(link.pacing_ms);

        debug!(name = %client.name, endpoint = %client.endpoint, "client configured");
        Ok(Self::new(transport)
            .id(client.name.as_str())
            .link_config(link)
            .framing(framing)
            .pacing(millis_to_duration(pacing)))
    }

    /// Apply the shared link defaults
    pub fn link_config(mut self, link: &LinkConfig) -> Self {
        self.options.retry = RetryPolicy {
            interval: millis_to_duration(link.retry_interval_ms),
            enabled: link.retry_enabled,
            retry_on_auth_failure: link.retry_on_auth_failure,
        };
        self.options.connect_timeout = millis_to_duration(link.connect_timeout_ms);
        self.options.max_buffer = link.max_buffer_bytes;
        self.options.dispatch = DispatcherConfig {
            default_pacing: millis_to_duration(link.pacing_ms),
            policy: if link.queue_while_disconnected {
                DisconnectedPolicy::Queue
            } else {
                DisconnectedPolicy::Reject
            },
            capacity: link.queue_capacity,
        };
        self
    }

    /// Set the client id
    pub fn id(mut self, id: impl Into<Id>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the framing rule
    pub fn framing(mut self, framing: FramingRule) -> Self {
        self.options.framing = framing;
        self
    }

    /// Set the receive buffer limit
    pub fn max_buffer(mut self, max_buffer: usize) -> Self {
        self.options.max_buffer = max_buffer;
        self
    }

    /// Set the default pause after each command
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.options.dispatch.default_pacing = pacing;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set what happens to commands sent while disconnected
    pub fn disconnected_policy(mut self, policy: DisconnectedPolicy) -> Self {
        self.options.dispatch.policy = policy;
        self
    }

    /// Set the outbound queue bound
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.dispatch.capacity = capacity;
        self
    }

    /// Set the callback receiving each inbound frame
    pub fn on_frame<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let handler: FrameHandler = Arc::new(handler);
        self.options.frame_handler = Some(handler);
        self
    }

    /// Build the client. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<LinkClient> {
        if self.options.dispatch.capacity == 0 {
            return Err(LinkError::Configuration(
                "queue capacity must be greater than zero".to_string(),
            ));
        }

        let line_terminator = match &self.options.framing {
            FramingRule::Delimiter(delimiter) => Some(delimiter.clone()),
            FramingRule::FixedLength(_) => None,
        };
        let supervisor = ConnectionSupervisor::new(self.id, self.transport, self.options)?;

        Ok(LinkClient {
            supervisor,
            line_terminator,
        })
    }
}

/// A managed link to one device
#[derive(Debug, Clone)]
pub struct LinkClient {
    supervisor: ConnectionSupervisor,
    line_terminator: Option<Bytes>,
}

impl LinkClient {
    /// Start building a client for `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> LinkClientBuilder {
        LinkClientBuilder::new(transport)
    }

    /// Get the client id
    pub fn id(&self) -> &Id {
        self.supervisor.id()
    }

    /// Get the underlying supervisor
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Check whether the link is up
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.supervisor.subscribe()
    }

    /// Subscribe to outbound command events
    pub fn subscribe_dispatch(&self) -> broadcast::Receiver<DispatchEvent> {
        self.supervisor.dispatcher().subscribe()
    }

    /// Open the link
    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await
    }

    /// Close the link
    pub async fn disconnect(&self) -> Result<()> {
        self.supervisor.disconnect().await
    }

    /// Queue a command exactly as given
    pub fn send(&self, command: impl Into<Command>) -> Result<()> {
        self.supervisor.enqueue(command)
    }

    /// Queue a line of text, appending the frame delimiter when there is one
    pub fn send_line(&self, line: &str) -> Result<()> {
        let payload = match &self.line_terminator {
            Some(terminator) => {
                let mut payload = BytesMut::with_capacity(line.len() + terminator.len());
                payload.extend_from_slice(line.as_bytes());
                payload.extend_from_slice(terminator);
                payload.freeze()
            }
            None => Bytes::copy_from_slice(line.as_bytes()),
        };
        self.supervisor.enqueue(Command::new(payload))
    }
}
