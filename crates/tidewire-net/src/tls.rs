//! TLS configuration for listeners and outbound connections.
//!
//! Both sides are built on rustls with the ring provider. PEM material is
//! read once, when the listener is added or the connection is started.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidewire_net::{ClientTls, ServerTls};
//!
//! let server = ServerTls::new("/etc/tidewire/cert.pem", "/etc/tidewire/key.pem");
//! let client = ClientTls::new().ca_cert("/etc/tidewire/ca.pem");
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tidewire_core::Error;
use tidewire_core::error::{ConnectionError, ConnectionErrorKind};

/// Server-side TLS: a certificate chain and its private key, both PEM.
#[derive(Debug, Clone)]
pub struct ServerTls {
    pub cert_chain_path: PathBuf,
    pub key_path: PathBuf,
}

impl ServerTls {
    pub fn new(cert_chain_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_chain_path: cert_chain_path.into(),
            key_path: key_path.into(),
        }
    }

    pub(crate) fn build(&self) -> Result<Arc<rustls::ServerConfig>, Error> {
        let certs = load_certs(&self.cert_chain_path)?;
        let key = load_key(&self.key_path)?;
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| tls_error(format!("Failed to configure server certificate: {}", e)))?;
        Ok(Arc::new(config))
    }
}

/// Client-side TLS options.
///
/// Without a CA file the webpki root bundle is used. `danger_skip_verify`
/// accepts any server certificate, which is common for self-signed database
/// deployments.
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub danger_skip_verify: bool,
    /// Name sent for SNI and checked against the certificate; defaults to
    /// the host passed to `add_connection`.
    pub server_name: Option<String>,
}

impl ClientTls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Resolve the SNI name, preferring the configured override.
    pub(crate) fn sni(&self, host: &str) -> Result<ServerName<'static>, Error> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|e| tls_error(format!("Invalid server name '{}': {}", name, e)))
    }

    pub(crate) fn build(&self) -> Result<Arc<rustls::ClientConfig>, Error> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(tls_error(
                "Client certificate and client key must be configured together",
            ));
        }

        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?;

        if self.danger_skip_verify {
            let config = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier(provider())))
                .with_no_client_auth();
            return Ok(Arc::new(config));
        }

        let mut roots = RootCertStore::empty();
        if let Some(ca_path) = &self.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error(format!("Failed to add CA certificate: {}", e)))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        let builder = builder.with_root_certificates(roots);

        let config = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
                .map_err(|e| tls_error(format!("Failed to configure client auth: {}", e)))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| {
        tls_error(format!(
            "Failed to open certificate '{}': {}",
            path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| {
        tls_error(format!(
            "Failed to open private key '{}': {}",
            path.display(),
            e
        ))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| tls_error(format!("No private key found in '{}'", path.display())))
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Accepts any certificate but still checks handshake signatures.
    #[derive(Debug)]
    pub(super) struct NoVerifier(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
