//! Opening authenticated connections to the remote tunnel endpoint.
//!
//! [`RemoteEstablisher`] turns a [`TunnelConfig`] into a fresh WebSocket per
//! accepted local client, and can query the tunnel status endpoint over
//! plain HTTPS.
//!
//! The tunnel stream trusts the webpki roots by default. A custom CA can be
//! added with [`TunnelConfig::with_trust_ca`], and certificate validation can
//! be switched off entirely with
//! [`TunnelConfig::with_accept_invalid_certs`]. The status probe ignores both
//! and always uses standard validation.

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::remote_sink::RemoteSink;
use crate::remote_stream::RemoteStream;
use futures::StreamExt;
use http::StatusCode;
use std::path::Path;
use std::sync::Arc;

/// Marker in the status body that means the remote is not set up correctly.
const FAILURE_MARKER: &str = "FAIL";

/// Marker in the status body that means the debug port is at its default.
const DEFAULT_PORT_MARKER: &str = "2222";

/// Both halves of one remote tunnel connection.
pub struct RemoteConnection {
    pub sink: RemoteSink,
    pub stream: RemoteStream,
}

/// Outcome of a successful status probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Raw response body
    pub body: String,
    /// The body contains the failure marker (case-insensitive)
    pub failure_reported: bool,
    /// The body reports the remote debug port at its default, 2222
    pub default_debug_port: bool,
}

impl StatusReport {
    /// Evaluates a status response body.
    ///
    /// The two markers are checked independently: a reported failure does
    /// not affect `default_debug_port`.
    pub fn from_body(body: impl Into<String>) -> Self {
        let body = body.into();
        let failure_reported = body.to_uppercase().contains(FAILURE_MARKER);
        let default_debug_port = body.contains(DEFAULT_PORT_MARKER);
        Self { body, failure_reported, default_debug_port }
    }
}

/// Opens remote tunnel connections for a [`TunnelConfig`].
///
/// TLS settings are resolved once at construction, so a bad CA file fails
/// early instead of on the first accepted client.
pub struct RemoteEstablisher {
    config: TunnelConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl RemoteEstablisher {
    /// Creates an establisher, loading any custom TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConfigError`] if the trusted CA file cannot be
    /// read or contains no certificates.
    pub fn new(config: TunnelConfig) -> Result<Self> {
        let tls = if config.accept_invalid_certs {
            tracing::warn!("Certificate validation is disabled for the tunnel stream");
            Some(Arc::new(build_insecure_tls_config()?))
        } else if let Some(ca_path) = &config.trust_ca {
            Some(Arc::new(build_tls_config(ca_path)?))
        } else {
            None
        };
        Ok(Self { config, tls })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Opens a new WebSocket to the tunnel endpoint.
    ///
    /// `index` tags log events for this connection and `trace` enables
    /// frame-level logging on both halves. No retry is attempted on failure.
    pub async fn connect(&self, index: u64, trace: bool) -> Result<RemoteConnection> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;

        // The Host header must match the authority of the tunnel URL
        let url = self.config.tunnel_url();
        let uri: http::Uri = url.parse()?;
        let authority = uri
            .authority()
            .ok_or_else(|| TunnelError::ConfigError(Arc::from("URL missing host")))?
            .to_string();

        if trace {
            tracing::info!(index, "Websocket tracing enabled");
        } else {
            tracing::warn!(index, "Websocket tracing disabled, use --verbose flag to enable");
        }

        // Upgrade request carrying the deployment credentials
        let request = http::Request::builder()
            .uri(&url)
            .header("Host", authority)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Authorization", self.config.credential.authorization_header())
            .body(())?;

        // No connector means tungstenite's default webpki-roots TLS; Nagle is off
        let connector = self.tls.clone().map(tokio_tungstenite::Connector::Rustls);
        let (ws_stream, response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector).await?;
        tracing::info!(index, url = %url, status = %response.status(), "Websocket connected");

        let (ws_tx, ws_rx) = ws_stream.split();

        Ok(RemoteConnection {
            sink: RemoteSink::new(ws_tx, trace, index),
            stream: RemoteStream::new(ws_rx, trace, index),
        })
    }

    /// Fetches and evaluates the tunnel status endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConnectError`] if the server answers with any
    /// status other than 200, or [`TunnelError::ConnectionFailed`] if the
    /// request could not be made.
    pub async fn fetch_status(&self) -> Result<StatusReport> {
        // Standard certificate validation here, whatever the tunnel uses
        let url = self.config.status_url();
        let client = reqwest::Client::builder().use_rustls_tls().no_proxy().build()?;
        let response = client
            .get(&url)
            .header(http::header::AUTHORIZATION, self.config.credential.authorization_header())
            .send()
            .await?;

        // Only a 200 counts as success
        let status = response.status();
        if status != StatusCode::OK {
            return Err(TunnelError::connect_error(&url, status));
        }

        let body = response.text().await?;
        tracing::info!(body = %body, "Status response message");
        let report = StatusReport::from_body(body);
        if report.failure_reported {
            tracing::warn!(
                body = %report.body,
                "Remote debugging may not be setup properly"
            );
        }
        Ok(report)
    }

    /// Returns `true` if the remote reports its debug port at the default value.
    pub async fn probe_status(&self) -> Result<bool> {
        Ok(self.fetch_status().await?.default_debug_port)
    }
}

/// Reads every PEM certificate from `ca_path`.
fn load_ca_certs(ca_path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let config_error = |what: &str, e: &dyn std::fmt::Display| {
        TunnelError::ConfigError(Arc::from(format!("{} {:?}: {}", what, ca_path, e)))
    };

    let pem = std::fs::read(ca_path).map_err(|e| config_error("Failed to open CA file", &e))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_error("Failed to parse CA certificates from", &e))?;

    if certs.is_empty() {
        return Err(TunnelError::ConfigError(Arc::from(format!(
            "No certificates found in {:?}",
            ca_path
        ))));
    }
    Ok(certs)
}

/// Builds a TLS client config that trusts the CA certificates in `ca_path`
/// on top of the webpki roots.
fn build_tls_config(ca_path: &Path) -> Result<rustls::ClientConfig> {
    let ca_certs = load_ca_certs(ca_path)?;

    // Public roots first, so the real App Service certificate still validates
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let (added, ignored) = root_store.add_parsable_certificates(ca_certs);
    if added == 0 {
        return Err(TunnelError::ConfigError(Arc::from(format!(
            "No usable CA certificates in {:?}",
            ca_path
        ))));
    }
    if ignored > 0 {
        tracing::warn!(ca = ?ca_path, ignored, "Skipped unparsable CA certificates");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Builds a TLS client config that accepts any server certificate.
fn build_insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth())
}

/// Certificate verifier used when validation is explicitly disabled.
///
/// Handshake signatures are still checked so the session keys belong to
/// whoever presented the certificate; only the chain of trust is skipped.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use std::path::PathBuf;

    fn config() -> TunnelConfig {
        TunnelConfig::new("127.0.0.1".parse().unwrap(), 0, "contoso", Credential::new("u", "p"))
    }

    #[test]
    fn test_status_default_port() {
        let report = StatusReport::from_body("SUCCESS: debugger listening on 2222");
        assert!(report.default_debug_port);
        assert!(!report.failure_reported);
    }

    #[test]
    fn test_status_custom_port() {
        let report = StatusReport::from_body("SUCCESS: debugger listening on 9229");
        assert!(!report.default_debug_port);
        assert!(!report.failure_reported);
    }

    #[test]
    fn test_status_failure_and_default_port_are_independent() {
        let report = StatusReport::from_body("FAIL: port 2222 not reachable");
        assert!(report.failure_reported);
        assert!(report.default_debug_port);

        let report = StatusReport::from_body("FAIL: no debugger");
        assert!(report.failure_reported);
        assert!(!report.default_debug_port);
    }

    #[test]
    fn test_status_failure_marker_case_insensitive() {
        assert!(StatusReport::from_body("Connection failed").failure_reported);
    }

    #[test]
    fn test_establisher_default_tls() {
        let establisher = RemoteEstablisher::new(config()).unwrap();
        assert!(establisher.tls.is_none());
    }

    #[test]
    fn test_establisher_insecure_tls() {
        let establisher = RemoteEstablisher::new(config().with_accept_invalid_certs(true)).unwrap();
        assert!(establisher.tls.is_some());
    }

    #[test]
    fn test_establisher_missing_ca_file() {
        let result = RemoteEstablisher::new(
            config().with_trust_ca(PathBuf::from("/nonexistent/webapp-tunnel-ca.pem")),
        );
        assert!(matches!(result, Err(TunnelError::ConfigError(_))));
    }

    #[test]
    fn test_establisher_ca_file_without_certificates() {
        let path = std::env::temp_dir().join(format!("webapp-tunnel-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        let result = RemoteEstablisher::new(config().with_trust_ca(path.clone()));
        std::fs::remove_file(&path).ok();
        match result {
            Err(TunnelError::ConfigError(msg)) => assert!(msg.contains("No certificates found")),
            Err(e) => panic!("expected ConfigError, got {}", e),
            Ok(_) => panic!("accepted a CA file with no certificates"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let establisher =
            RemoteEstablisher::new(config().with_endpoint(format!("ws://{}", addr))).unwrap();
        assert!(establisher.connect(1, false).await.is_err());
    }
}
