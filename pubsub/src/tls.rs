//! TLS client configuration for broker connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::{WantsClientCert, WebPkiServerVerifier};
use tokio_rustls::rustls::crypto::{self, CryptoProvider, WebPkiSupportedAlgorithms, ring};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, CertificateError, ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use tracing::{debug, warn};

use crate::config::TlsSettings;
use crate::error::{Error, Result};

/// SHA-256 of a DER encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Build the rustls client configuration for a connection.
pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let verifier: Arc<dyn ServerCertVerifier> =
        Arc::new(PolicyVerifier::new(settings, provider.clone())?);

    let Some(path) = settings.client_certificate_path.as_deref() else {
        return Ok(builder(&provider, &verifier)?.with_no_client_auth());
    };

    if settings.client_certificate_password.is_some() {
        warn!(
            path = %path.display(),
            "client certificate password is ignored, encrypted keys are not supported"
        );
    }

    let identity = match load_identity(path) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "client certificate not loaded");
            return Ok(builder(&provider, &verifier)?.with_no_client_auth());
        }
    };

    let (chain, key) = identity;
    match builder(&provider, &verifier)?.with_client_auth_cert(chain, key) {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "client certificate rejected");
            Ok(builder(&provider, &verifier)?.with_no_client_auth())
        }
    }
}

fn builder(
    provider: &Arc<CryptoProvider>,
    verifier: &Arc<dyn ServerCertVerifier>,
) -> Result<ConfigBuilder<ClientConfig, WantsClientCert>> {
    Ok(ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone()))
}

/// Read a PEM bundle holding a certificate chain and one private key.
fn load_identity(path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let chain = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if chain.is_empty() {
        return Err(Error::Tls(format!("no certificate in {}", path.display())));
    }

    let mut reader = BufReader::new(File::open(path)?);
    let key = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))?;
    Ok((chain, key))
}

/// Which tolerance flag covers a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Chain,
    Revocation,
    Other,
}

fn classify(err: &rustls::Error) -> Failure {
    let rustls::Error::InvalidCertificate(cert) = err else {
        return Failure::Other;
    };
    match cert {
        CertificateError::UnknownIssuer
        | CertificateError::Expired
        | CertificateError::ExpiredContext { .. }
        | CertificateError::NotValidYet
        | CertificateError::NotValidYetContext { .. }
        | CertificateError::BadSignature
        | CertificateError::InvalidPurpose => Failure::Chain,
        CertificateError::Revoked | CertificateError::UnknownRevocationStatus => {
            Failure::Revocation
        }
        _ => Failure::Other,
    }
}

/// Server certificate verifier applying fingerprint pinning and the
/// tolerance flags of a connection on top of webpki validation.
#[derive(Debug)]
struct PolicyVerifier {
    inner: Arc<WebPkiServerVerifier>,
    algorithms: WebPkiSupportedAlgorithms,
    fingerprint: Option<Vec<u8>>,
    allow_untrusted: bool,
    ignore_chain_errors: bool,
    ignore_revocation_errors: bool,
}

impl PolicyVerifier {
    fn new(settings: &TlsSettings, provider: Arc<CryptoProvider>) -> Result<Self> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let algorithms = provider.signature_verification_algorithms;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Self {
            inner,
            algorithms,
            fingerprint: settings.fingerprint()?,
            allow_untrusted: settings.allow_untrusted_certificates,
            ignore_chain_errors: settings.ignore_certificate_chain_errors,
            ignore_revocation_errors: settings.ignore_certificate_revocation_errors,
        })
    }

    fn tolerates(&self, err: &rustls::Error) -> bool {
        if self.allow_untrusted {
            return true;
        }
        match classify(err) {
            Failure::Chain => self.ignore_chain_errors,
            Failure::Revocation => self.ignore_revocation_errors,
            Failure::Other => false,
        }
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.fingerprint {
            if certificate_fingerprint(end_entity.as_ref()).as_slice() == expected.as_slice() {
                debug!("server certificate matches pinned fingerprint");
                return Ok(ServerCertVerified::assertion());
            }
        }

        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(e) if self.tolerates(&e) => {
                warn!(error = %e, "accepting server certificate despite verification failure");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
