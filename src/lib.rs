//! App Service Debug Tunnel
//!
//! This library exposes a local TCP port that debugger tooling can attach to,
//! and relays everything it receives through an authenticated WebSocket
//! tunnel to a remotely hosted process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐         ┌─────────────────┐
//! │  Debugger       │◄───────►│  TunnelSession  │◄───────►│  Remote site    │
//! │  (any TCP tool) │   TCP   │  (this crate)   │   WSS   │  Tunnel.ashx    │
//! └─────────────────┘         └─────────────────┘         └─────────────────┘
//! ```
//!
//! Bytes are opaque: each local read of up to 4096 bytes becomes one binary
//! WebSocket message, and each WebSocket message is written back to the
//! debugger unchanged.
//!
//! # Example
//!
//! ```rust,no_run
//! use webapp_tunnel::{Credential, TunnelConfig, TunnelError, TunnelSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TunnelError> {
//!     let config = TunnelConfig::new(
//!         "127.0.0.1".parse().unwrap(),
//!         12345,
//!         "contoso",
//!         Credential::new("$contoso", "deployment-password"),
//!     );
//!
//!     let mut session = TunnelSession::bind(config).await?;
//!     if !session.probe_status().await? {
//!         eprintln!("remote debug port is not at its default value");
//!     }
//!     session.run().await;
//!     Ok(())
//! }
//! ```
//!
//! # One client at a time
//!
//! The session accepts a single debugger connection, opens a fresh tunnel for
//! it, and relays until either side closes. Only then is the next client
//! accepted; clients connecting in the meantime wait in the listen backlog.

pub mod config;
pub mod error;
pub mod port_guard;
pub mod relay;
pub mod remote;
mod remote_sink;
mod remote_stream;
pub mod session;

pub use config::{Credential, TunnelConfig};
pub use error::TunnelError;
pub use relay::{relay, RelayStats, CHUNK_SIZE};
pub use remote::{RemoteConnection, RemoteEstablisher, StatusReport};
pub use remote_sink::RemoteSink;
pub use remote_stream::RemoteStream;
pub use session::{SessionState, TunnelSession};
