//! # Peer Communicator Suite
//!
//! Protocol-specific transport communicators for a peer-to-peer transport
//! layer, plus the client library they use to rendezvous with the local
//! transport service. Two communicators are provided: UNIX datagram sockets
//! and HTTP(S) long-polling.

pub mod address;
pub mod cli;
pub mod communicator;
pub mod config;
pub mod flow;
pub mod frame;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod session;

pub use address::{Address, HttpAddress, UnixAddress};
pub use communicator::{Communicator, CommunicatorFactory, CommunicatorHandle, Protocol};
pub use config::Config;
pub use identity::PeerId;
pub use queue::{SendError, SendResult};
pub use service::{ServiceClient, ServiceEvent, ServiceSettings};
pub use session::{MonitorEvent, SessionId};

/// The current version of the communicator suite
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Idle timeout after which a quiet session is destroyed
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    /// Desired timeout for sends that do not specify one
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(300);

    /// Soft cap on pending INCOMING_MSG envelopes towards the service
    pub const MAX_QUEUE_LENGTH: usize = 16;

    /// Cap on concurrent HTTP request pairs
    pub const MAX_CONNECTIONS: usize = 128;

    /// How long an idle HTTP PUT lingers before its body is closed
    pub const PUT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

    /// First service reconnect delay
    pub const BACKOFF_INITIAL: Duration = Duration::from_millis(250);

    /// Ceiling for the service reconnect delay
    pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

    /// Validity advertised for offered addresses
    pub const ADDRESS_VALIDITY: Duration = Duration::from_secs(4 * 3600);

    /// Receive buffer for one UNIX datagram
    pub const RECV_BUFFER: usize = 65536;

    /// Largest chunk handed to an HTTP PUT body at once
    pub const HTTP_CHUNK: usize = 16384;

    /// HTTP connect timeout (overall timeouts are session-driven)
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default transport-service socket path
    pub const SERVICE_SOCKET: &str = "/tmp/peer-transport-svc.sock";
}
