//! Local listener and the accept → connect → relay loop.
//!
//! This module provides [`TunnelSession`], which owns the local listening
//! socket for its whole lifetime and relays one debugger connection at a
//! time through a freshly opened remote tunnel.
//!
//! # Lifecycle
//!
//! ```text
//!            accept            both pumps stopped
//!   AwaitingClient ──────► Relaying ──────────► AwaitingClient ──► ...
//! ```
//!
//! There is no terminal state: [`TunnelSession::run`] only stops when the
//! surrounding task or process is stopped. A client that connects while
//! another one is being relayed waits in the TCP backlog.

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::port_guard;
use crate::relay::{relay, RelayStats};
use crate::remote::{RemoteEstablisher, StatusReport};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};

/// Depth of the pending-connection queue on the local listener.
pub const LISTEN_BACKLOG: u32 = 100;

/// First pause after a failed `accept`.
const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(100);

/// Longest pause between repeated `accept` failures.
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(5);

/// Grows the pause after another failed `accept` by half, within bounds.
fn next_accept_delay(delay: Duration) -> Duration {
    (delay + delay / 2).clamp(ACCEPT_RETRY_MIN, ACCEPT_RETRY_MAX)
}

/// Where the session loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting in `accept` for the next debugger client
    AwaitingClient,
    /// Relaying one connection pair
    Relaying,
}

/// A local debugging port bound to a remote tunnel.
///
/// # Example
///
/// ```rust,no_run
/// use webapp_tunnel::{Credential, TunnelConfig, TunnelSession};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TunnelConfig::new(
///     "127.0.0.1".parse()?,
///     12345,
///     "contoso",
///     Credential::new("$contoso", "secret"),
/// );
/// let mut session = TunnelSession::bind(config).await?;
/// session.run().await;
/// # Ok(())
/// # }
/// ```
pub struct TunnelSession {
    listener: TcpListener,
    establisher: RemoteEstablisher,
    state: SessionState,
    trace: bool,
    /// Number of clients accepted so far
    index: u64,
    /// Pause before the next `accept` retry; zero after a success
    accept_delay: Duration,
}

impl TunnelSession {
    /// Checks the port, then binds and listens on the configured address.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::PortUnavailable`] if the port is already in use;
    ///   nothing is bound in that case
    /// - [`TunnelError::ConfigError`] if the TLS settings cannot be loaded
    /// - [`TunnelError::IoError`] for other socket failures
    pub async fn bind(config: TunnelConfig) -> Result<Self> {
        // Refuse an occupied port before anything is bound
        let addr = config.bind_addr();
        if port_guard::is_port_in_use(addr).await {
            return Err(TunnelError::PortUnavailable { port: addr.port() });
        }

        // Load TLS settings now so a bad CA file fails at startup
        let trace = config.trace;
        let establisher = RemoteEstablisher::new(config)?;

        tracing::info!(port = addr.port(), "Creating a socket on port");
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        tracing::info!(%addr, "Binding to socket on local address and port");
        socket.bind(addr).map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => TunnelError::PortUnavailable { port: addr.port() },
            _ => TunnelError::from(e),
        })?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        tracing::info!(addr = %listener.local_addr()?, "Finished initialization");

        Ok(Self {
            listener,
            establisher,
            state: SessionState::AwaitingClient,
            trace,
            index: 0,
            accept_delay: Duration::ZERO,
        })
    }

    /// The address the local listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of clients accepted so far.
    pub fn connections_accepted(&self) -> u64 {
        self.index
    }

    /// Enables or disables remote wire tracing from the next accepted client on.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Queries the remote tunnel status endpoint.
    ///
    /// See [`RemoteEstablisher::fetch_status`].
    pub async fn fetch_status(&self) -> Result<StatusReport> {
        self.establisher.fetch_status().await
    }

    /// Returns `true` if the remote debug port is at its default value.
    pub async fn probe_status(&self) -> Result<bool> {
        self.establisher.probe_status().await
    }

    /// Accepts and relays clients forever.
    pub async fn run(&mut self) -> Infallible {
        tracing::warn!("Starting local server..");
        loop {
            self.serve_next().await;
        }
    }

    /// Runs one iteration of the loop: accept a client, open the remote
    /// tunnel, relay until both directions stop.
    ///
    /// Returns `None` if the client could not be accepted or the remote
    /// tunnel could not be opened; the failure is logged and the client, if
    /// any, is dropped. A failed `accept` (for example when the process is
    /// out of file descriptors) pauses before returning, for longer on each
    /// consecutive failure, so [`run`](Self::run) does not spin.
    pub async fn serve_next(&mut self) -> Option<RelayStats> {
        self.state = SessionState::AwaitingClient;
        let (client, peer) = match self.listener.accept().await {
            Ok(accepted) => {
                self.accept_delay = Duration::ZERO;
                accepted
            }
            Err(e) => {
                self.accept_delay = next_accept_delay(self.accept_delay);
                tracing::warn!(
                    error = %e,
                    retry_ms = self.accept_delay.as_millis() as u64,
                    "Failed to accept debugger connection"
                );
                tokio::time::sleep(self.accept_delay).await;
                return None;
            }
        };

        self.index += 1;
        let index = self.index;
        tracing::info!(index, %peer, "Got debugger connection");

        // Every client gets its own tunnel; the trace flag is read fresh each time
        let remote = match self.establisher.connect(index, self.trace).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!(index, error = %e, "Failed to open remote tunnel, dropping client");
                return None;
            }
        };

        self.state = SessionState::Relaying;
        tracing::warn!(index, "Successfully started local server..");

        // Relay until both pumps stop, then go back to accepting
        let (local_read, local_write) = client.into_split();
        let stats = relay(
            local_read,
            local_write,
            remote.sink,
            remote.stream,
            self.establisher.config().local_read_timeout,
            index,
        )
        .await;
        self.state = SessionState::AwaitingClient;
        tracing::warn!(
            index,
            uploaded = stats.bytes_uploaded,
            downloaded = stats.bytes_downloaded,
            "Stopped local server.."
        );
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn unreachable_endpoint() -> String {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);
        format!("ws://{}", addr)
    }

    fn config(port: u16) -> TunnelConfig {
        TunnelConfig::new("127.0.0.1".parse().unwrap(), port, "contoso", Credential::new("u", "p"))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let session = TunnelSession::bind(config(0)).await.unwrap();
        let addr = session.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(session.state(), SessionState::AwaitingClient);
        assert_eq!(session.connections_accepted(), 0);
    }

    #[tokio::test]
    async fn test_bind_occupied_port() {
        let occupant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupant.local_addr().unwrap().port();
        let result = TunnelSession::bind(config(port)).await;
        assert!(matches!(result, Err(TunnelError::PortUnavailable { port: p }) if p == port));
    }

    #[test]
    fn test_accept_delay_grows_and_is_capped() {
        let first = next_accept_delay(Duration::ZERO);
        assert_eq!(first, ACCEPT_RETRY_MIN);
        let second = next_accept_delay(first);
        assert_eq!(second, Duration::from_millis(150));

        let mut delay = second;
        for _ in 0..32 {
            delay = next_accept_delay(delay);
        }
        assert_eq!(delay, ACCEPT_RETRY_MAX);
    }

    #[tokio::test]
    async fn test_trace_flag_read_for_each_client() {
        let mut session =
            TunnelSession::bind(config(0).with_endpoint(unreachable_endpoint())).await.unwrap();
        let addr = session.local_addr().unwrap();

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(session.serve_next().await.is_none());
        session.set_trace(true);
        let _second = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert!(session.serve_next().await.is_none());
        assert_eq!(session.connections_accepted(), 2);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let disabled = output.find("Websocket tracing disabled").expect("no trace state logged for the first client");
        let enabled = output.find("Websocket tracing enabled").expect("tracing not enabled for the second client");
        assert!(disabled < enabled);
    }

    #[tokio::test]
    async fn test_remote_connect_failure_drops_client() {
        let mut session =
            TunnelSession::bind(config(0).with_endpoint(unreachable_endpoint())).await.unwrap();
        let addr = session.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let stats = session.serve_next().await;
            (session, stats)
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (session, stats) = server.await.unwrap();
        assert!(stats.is_none());
        assert_eq!(session.connections_accepted(), 1);
        assert_eq!(session.state(), SessionState::AwaitingClient);

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap_or(0), 0);
    }
}
