//! TLS configuration.
//!
//! A [`TlsConfig`] captures everything that makes two TLS connections
//! interchangeable: the root store, the verification mode, and the ALPN
//! offer set. Its [`TlsProfileId`] digest is folded into the pool
//! [`Origin`](crate::origin::Origin) so connections with different TLS
//! settings never share a pool bucket.

use std::{
    fs::File,
    hash::{Hash, Hasher},
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::error::{BoxError, Error};

/// The protocols offered during ALPN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlpnProtos {
    /// Offer `h2` and `http/1.1`; the handshake picks.
    All,
    /// Offer only `http/1.1`.
    Http1,
    /// Offer only `h2`.
    Http2,
    /// Offer only `h3` (QUIC handshakes).
    Http3,
}

impl AlpnProtos {
    fn protocols(&self) -> Vec<Vec<u8>> {
        match self {
            AlpnProtos::All => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            AlpnProtos::Http1 => vec![b"http/1.1".to_vec()],
            AlpnProtos::Http2 => vec![b"h2".to_vec()],
            AlpnProtos::Http3 => vec![b"h3".to_vec()],
        }
    }
}

/// Where trusted roots come from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CaSource {
    /// The bundled Mozilla root set.
    WebpkiRoots,
    /// A PEM bundle file.
    File(PathBuf),
    /// A directory of PEM files.
    Dir(PathBuf),
    /// PEM bytes supplied by the caller.
    Pem(Vec<u8>),
}

/// TLS settings frozen into a client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TlsConfig {
    pub(crate) verify: bool,
    pub(crate) ca: CaSource,
    pub(crate) alpn: AlpnProtos,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            verify: true,
            ca: ca_from_env(),
            alpn: AlpnProtos::All,
        }
    }
}

/// `SSL_CERT_FILE` / `SSL_CERT_DIR` override the bundled roots when no
/// explicit CA was supplied, mirroring OpenSSL's lookup.
fn ca_from_env() -> CaSource {
    if let Some(file) = std::env::var_os("SSL_CERT_FILE") {
        return CaSource::File(PathBuf::from(file));
    }
    if let Some(dir) = std::env::var_os("SSL_CERT_DIR") {
        return CaSource::Dir(PathBuf::from(dir));
    }
    CaSource::WebpkiRoots
}

/// Digest of a [`TlsConfig`], used as the tls-profile slot of an origin key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TlsProfileId(u64);

impl TlsProfileId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> TlsProfileId {
        TlsProfileId(raw)
    }
}

impl TlsConfig {
    pub(crate) fn profile_id(&self) -> TlsProfileId {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        TlsProfileId(hasher.finish())
    }

    /// Builds the rustls config for TCP connections, offering `alpn`.
    pub(crate) fn build(&self, alpn: AlpnProtos) -> Result<Arc<ClientConfig>, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(Error::tls)?;

        let mut config = if self.verify {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
                .with_no_client_auth()
        };

        config.alpn_protocols = alpn.protocols();
        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore, Error> {
        let mut roots = RootCertStore::empty();
        match &self.ca {
            CaSource::WebpkiRoots => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            CaSource::File(path) => add_pem_file(&mut roots, path)?,
            CaSource::Dir(dir) => {
                let entries = std::fs::read_dir(dir).map_err(Error::tls)?;
                for entry in entries {
                    let path = entry.map_err(Error::tls)?.path();
                    if path.is_file() {
                        // Non-PEM files in the directory are skipped, not
                        // fatal, matching OpenSSL's directory lookup.
                        let _ = add_pem_file(&mut roots, &path);
                    }
                }
            }
            CaSource::Pem(bytes) => {
                for cert in rustls_pemfile::certs(&mut bytes.as_slice()) {
                    let cert = cert.map_err(Error::tls)?;
                    roots.add(cert).map_err(Error::tls)?;
                }
            }
        }

        if roots.is_empty() {
            return Err(Error::tls(NoRootsFound));
        }
        Ok(roots)
    }
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> Result<(), Error> {
    let file = File::open(path).map_err(Error::tls)?;
    let mut reader = BufReader::new(file);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert: CertificateDer<'static> = cert.map_err(Error::tls)?;
        roots.add(cert).map_err(Error::tls)?;
    }
    Ok(())
}

#[derive(Debug)]
struct NoRootsFound;

impl std::fmt::Display for NoRootsFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no trusted root certificates found")
    }
}

impl std::error::Error for NoRootsFound {}

/// Accepts any presented certificate. Only reachable through
/// `ClientBuilder::danger_accept_invalid_certs(true)`.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Maps a rustls handshake failure into the client error taxonomy.
pub(crate) fn handshake_error(err: std::io::Error) -> Error {
    // tokio-rustls surfaces alert/verification failures as io errors with
    // the rustls error attached; keep the chain so callers can see
    // certificate reasons (hostname mismatch, expiry, unknown issuer).
    match err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        Some(_) => Error::tls(err),
        None => Error::connect(Box::new(err) as BoxError),
    }
}
