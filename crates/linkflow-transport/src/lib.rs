/*!
 * linkflow transport
 *
 * Reconnecting, line-oriented links to control devices: byte-stream
 * transports, frame reassembly, a paced outbound command queue and a
 * supervisor that keeps the connection alive.
 */

#![warn(missing_docs)]

// Re-export core types
pub use linkflow_core::prelude;

pub mod client;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod transports;

pub use client::{LinkClient, LinkClientBuilder};
pub use dispatcher::{Command, CommandDispatcher, DispatchEvent, DisconnectedPolicy, DispatcherConfig};
pub use endpoint::Endpoint;
pub use error::{LinkError, Result};
pub use framing::{frame_text, FrameAccumulator, FramingRule};
pub use registry::{ClientRegistry, RegistryEvent, SharedClientRegistry};
pub use state::{ConnectionState, FailureKind, StateChange};
pub use supervisor::{ConnectionSupervisor, RetryPolicy, SupervisorOptions};
pub use transport::{Transport, TransportEvent};
pub use transports::{MemoryTransport, TcpTransport, TransportRegistry, UdpTransport};

#[cfg(feature = "serial")]
pub use transports::SerialTransport;

/// linkflow transport crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the transport layer
pub fn init() -> std::result::Result<(), linkflow_core::error::Error> {
    tracing::info!("linkflow transport {} initialized", VERSION);
    Ok(())
}

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["memory", "tcp", "udp"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_transports_match_registry() {
        let registry = TransportRegistry::with_defaults();
        for scheme in available_transports() {
            assert!(registry.supports(scheme), "{} not registered", scheme);
        }
        assert_eq!(registry.schemes().len(), available_transports().len());
    }

    #[test_log::test]
    fn test_init() {
        assert!(init().is_ok());
        assert!(!VERSION.is_empty());
    }
}
