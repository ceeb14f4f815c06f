//! TLS utilities for the HTTP client.
//!
//! Provides the trust-all certificate verifier, cached loading of native root
//! certificates, and construction of the rustls `ClientConfig` used by the
//! connector.

use crate::config::TlsTrust;
use crate::error::HttpError;
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::{Arc, OnceLock};

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// Certificate verifier that accepts any certificate for any host.
///
/// Chain and hostname checks are skipped entirely. Handshake signatures are
/// still verified against the presented certificate, so the peer must hold
/// the key it advertises.
///
/// **WARNING**: the peer's identity is not authenticated. Use only against
/// endpoints reachable over trusted networks.
#[derive(Debug)]
pub struct TrustAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl TrustAllVerifier {
    #[must_use]
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl Default for TrustAllVerifier {
    fn default() -> Self {
        Self::new(get_crypto_provider())
    }
}

impl ServerCertVerifier for TrustAllVerifier {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Load native root certificates from the OS certificate store.
///
/// This function is called once and the result is cached for subsequent calls.
fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();

    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let certs: Vec<CertificateDer<'static>> = result.certs;

    if certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = certs.len(), "loaded native root certificates");
    }

    certs
}

/// Get cached native root certificates (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Get the crypto provider for TLS connections.
///
/// Uses the process-wide default provider when one is installed, otherwise
/// an aws-lc-rs provider that is not installed globally.
pub fn get_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Build the rustls `ClientConfig` for the given trust strategy.
///
/// The connector only speaks HTTP/1.1, so ALPN advertises `http/1.1` alone.
///
/// # Errors
///
/// Returns [`HttpError::Configuration`] if the protocol versions cannot be
/// set, or if `NativeRoots` is requested but no root certificate could be
/// loaded from the OS store.
pub fn client_config(trust: TlsTrust) -> Result<rustls::ClientConfig, HttpError> {
    let provider = get_crypto_provider();

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Configuration(format!("failed to set TLS protocol versions: {e}")))?;

    let mut config = match trust {
        TlsTrust::TrustAll => {
            tracing::warn!("TLS certificate verification disabled: trusting all server certificates");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier::new(provider)))
                .with_no_client_auth()
        }
        TlsTrust::NativeRoots => builder
            .with_root_certificates(native_root_store()?)
            .with_no_client_auth(),
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn native_root_store() -> Result<rustls::RootCertStore, HttpError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(HttpError::Configuration(
            "no native root CA certificates found in OS certificate store".to_owned(),
        ));
    }

    let mut root_store = rustls::RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());

    if ignored > 0 {
        tracing::warn!(
            added = added,
            ignored = ignored,
            "some native root certificates could not be parsed"
        );
    }

    if added == 0 {
        return Err(HttpError::Configuration(format!(
            "no valid native root CA certificates parsed (found {}, all {} failed to parse)",
            certs.len(),
            ignored
        )));
    }

    Ok(root_store)
}
