//! Error types for the tunnel relay.
//!
//! - [`TunnelError`]: every failure the relay can surface
//! - [`Result<T>`]: shorthand for `std::result::Result<T, TunnelError>`
//!
//! Only construction-time failures ([`TunnelError::PortUnavailable`]) and
//! status probe failures ([`TunnelError::ConnectError`]) reach callers in
//! normal operation. Faults inside a running relay are logged and absorbed at
//! the pump boundary.

use std::sync::Arc;
use http::StatusCode;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while setting up or running the tunnel relay.
///
/// String payloads are `Arc<str>` so the error stays cheap to clone between
/// the two pump tasks.
///
/// # Stability
///
/// This enum is marked `#[non_exhaustive]`; include a wildcard arm when
/// matching on it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TunnelError {
    /// The requested local port is already in use.
    ///
    /// Raised while constructing a [`TunnelSession`](crate::TunnelSession);
    /// no socket is left bound when this is returned.
    #[error("Port {port} is currently unavailable")]
    PortUnavailable {
        /// The port that was requested
        port: u16,
    },

    /// The tunnel status endpoint answered with something other than 200.
    #[error("Failed to connect to '{url}' with status code '{status}' and reason '{reason}'")]
    ConnectError {
        /// The status URL that was requested
        url: Arc<str>,
        /// HTTP status code returned by the server
        status: u16,
        /// Canonical reason phrase for the status code
        reason: Arc<str>,
    },

    /// A read or write on one of the relayed endpoints failed.
    #[error("Transport error: {0}")]
    TransportError(Arc<str>),

    /// Failed to open the remote stream.
    ///
    /// This can happen if:
    /// - The server is unreachable
    /// - TLS handshake failed
    /// - WebSocket upgrade was rejected
    #[error("Connection failed: {0}")]
    ConnectionFailed(Arc<str>),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(Arc<str>),

    /// The tunnel endpoint rejected the Basic-Auth credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Arc<str>),

    /// Server returned an error response to the WebSocket upgrade.
    #[error("Server error: {status} - {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Error message from server
        message: Arc<str>,
    },

    /// The remote stream was closed before the operation completed.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// No data arrived from the local client within the receive timeout.
    #[error("Operation timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(Arc<str>),

    /// Configuration error.
    ///
    /// The provided configuration is invalid, for example an unreadable CA
    /// file or a malformed endpoint URL.
    #[error("Configuration error: {0}")]
    ConfigError(Arc<str>),
}

impl TunnelError {
    /// Builds a [`TunnelError::ConnectError`] from a non-success status.
    pub(crate) fn connect_error(url: &str, status: StatusCode) -> Self {
        TunnelError::ConnectError {
            url: Arc::from(url),
            status: status.as_u16(),
            reason: Arc::from(status.canonical_reason().unwrap_or("")),
        }
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::IoError(Arc::from(err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &err {
            WsError::Http(res) => {
                let status = res.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return TunnelError::AuthenticationFailed(err.to_string().into());
                }
                TunnelError::ServerError { status: status.as_u16(), message: err.to_string().into() }
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => TunnelError::ConnectionClosed,
            WsError::Io(e) => TunnelError::TransportError(Arc::from(e.to_string())),
            WsError::Url(_) => TunnelError::ConnectionFailed(Arc::from(err.to_string())),
            _ => TunnelError::WebSocketError(Arc::from(err.to_string())),
        }
    }
}

impl From<http::uri::InvalidUri> for TunnelError {
    fn from(err: http::uri::InvalidUri) -> Self {
        TunnelError::ConfigError(Arc::from(err.to_string()))
    }
}

impl From<http::Error> for TunnelError {
    fn from(err: http::Error) -> Self {
        TunnelError::ConnectionFailed(Arc::from(err.to_string()))
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(err: reqwest::Error) -> Self {
        TunnelError::ConnectionFailed(Arc::from(err.to_string()))
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(err: rustls::Error) -> Self {
        TunnelError::ConfigError(Arc::from(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_message() {
        let err = TunnelError::connect_error(
            "https://contoso.scm.azurewebsites.net/AppServiceTunnel/Tunnel.ashx?GetStatus",
            StatusCode::UNAUTHORIZED,
        );
        assert_eq!(
            err.to_string(),
            "Failed to connect to 'https://contoso.scm.azurewebsites.net/AppServiceTunnel/Tunnel.ashx?GetStatus' \
             with status code '401' and reason 'Unauthorized'"
        );
    }

    #[test]
    fn test_port_unavailable_message() {
        let err = TunnelError::PortUnavailable { port: 12345 };
        assert_eq!(err.to_string(), "Port 12345 is currently unavailable");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        assert!(matches!(TunnelError::from(io), TunnelError::IoError(msg) if msg.contains("pipe gone")));
    }
}
