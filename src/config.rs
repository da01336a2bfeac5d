//! Tunnel configuration and credentials.
//!
//! [`TunnelConfig`] carries everything a [`TunnelSession`](crate::TunnelSession)
//! needs: where to listen locally, which remote site to tunnel to, and how to
//! authenticate. The remote URLs are derived from the remote name and a fixed
//! path template, so the same configuration always produces the same
//! endpoints.

use base64::Engine;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default DNS suffix appended to the remote name.
pub const DEFAULT_HOST_SUFFIX: &str = "scm.azurewebsites.net";

/// Path of the tunnel handler on the remote site.
pub const TUNNEL_PATH: &str = "/AppServiceTunnel/Tunnel.ashx";

/// Query appended to [`TUNNEL_PATH`] for the status probe.
pub const STATUS_QUERY: &str = "GetStatus";

/// Default receive timeout applied to accepted local sockets.
pub const DEFAULT_LOCAL_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Username/password pair used for Basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    /// Returns `base64(username:password)`.
    pub fn basic_auth_token(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        base64::prelude::BASE64_STANDARD.encode(raw.as_bytes())
    }

    /// Returns the full `Authorization` header value, `Basic <token>`.
    pub fn authorization_header(&self) -> String {
        format!("Basic {}", self.basic_auth_token())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for a [`TunnelSession`](crate::TunnelSession).
///
/// # Construction
///
/// Use [`TunnelConfig::new()`] with the required parameters, then chain
/// `with_*` methods to customize it:
///
/// ```rust
/// use webapp_tunnel::{Credential, TunnelConfig};
///
/// let config = TunnelConfig::new(
///     "127.0.0.1".parse().unwrap(),
///     12345,
///     "contoso",
///     Credential::new("u", "p"),
/// )
/// .with_trace(true);
/// assert_eq!(
///     config.tunnel_url(),
///     "wss://contoso.scm.azurewebsites.net/AppServiceTunnel/Tunnel.ashx"
/// );
/// ```
///
/// # Stability
///
/// This struct is marked `#[non_exhaustive]`. Always use the constructor and
/// builder methods rather than struct literal syntax.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TunnelConfig {
    /// Local address to listen on
    pub bind_address: IpAddr,

    /// Local port to listen on. Port 0 asks the OS for an ephemeral port.
    pub bind_port: u16,

    /// Name of the remote site, the first DNS label of the tunnel host
    pub remote_name: String,

    /// Credentials sent as `Authorization: Basic ...`
    pub credential: Credential,

    /// DNS suffix appended to `remote_name` (defaults to [`DEFAULT_HOST_SUFFIX`])
    pub host_suffix: String,

    /// Base URL replacing `wss://{remote_name}.{host_suffix}`.
    ///
    /// Intended for development or testing against a non-production server.
    /// A `ws://` base maps to `http://` for the status probe, `wss://` to
    /// `https://`.
    pub endpoint: Option<String>,

    /// Optional path to a PEM file containing a root CA certificate to trust.
    ///
    /// When set, this CA will be trusted in addition to the default webpki
    /// roots for the tunnel stream.
    pub trust_ca: Option<PathBuf>,

    /// Skip certificate validation on the tunnel stream.
    ///
    /// Off by default. This weakens transport security and only exists for
    /// sites whose tunnel endpoint presents a certificate that cannot be
    /// validated. The status probe always uses standard validation.
    pub accept_invalid_certs: bool,

    /// Log every frame received on the remote stream.
    pub trace: bool,

    /// Receive timeout applied to each accepted local socket.
    ///
    /// `None` waits forever.
    pub local_read_timeout: Option<Duration>,
}

impl TunnelConfig {
    /// Creates a configuration with the required parameters and defaults for
    /// everything else.
    pub fn new(
        bind_address: IpAddr,
        bind_port: u16,
        remote_name: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            bind_address,
            bind_port,
            remote_name: remote_name.into(),
            credential,
            host_suffix: DEFAULT_HOST_SUFFIX.to_string(),
            endpoint: None,
            trust_ca: None,
            accept_invalid_certs: false,
            trace: false,
            local_read_timeout: Some(DEFAULT_LOCAL_READ_TIMEOUT),
        }
    }

    /// Sets the DNS suffix appended to the remote name.
    pub fn with_host_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.host_suffix = suffix.into();
        self
    }

    /// Overrides the base URL of the remote site.
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint = Some(base_url.into());
        self
    }

    /// Sets a custom root CA certificate to trust on the tunnel stream.
    ///
    /// The provided path should point to a PEM file containing one or more
    /// CA certificates.
    pub fn with_trust_ca(mut self, path: PathBuf) -> Self {
        self.trust_ca = Some(path);
        self
    }

    /// Enables or disables certificate validation on the tunnel stream.
    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Enables or disables wire-level tracing of the remote stream.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Sets the receive timeout for accepted local sockets.
    pub fn with_local_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.local_read_timeout = timeout;
        self
    }

    /// The local socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    /// Base URL of the remote site, without a trailing slash.
    fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("wss://{}.{}", self.remote_name, self.host_suffix),
        }
    }

    /// URL of the tunnel WebSocket.
    pub fn tunnel_url(&self) -> String {
        format!("{}{}", self.base_url(), TUNNEL_PATH)
    }

    /// URL of the tunnel status endpoint.
    pub fn status_url(&self) -> String {
        let base = self.base_url();
        let base = if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            base
        };
        format!("{}{}?{}", base, TUNNEL_PATH, STATUS_QUERY)
    }
}
