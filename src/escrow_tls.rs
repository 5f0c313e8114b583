//! Client TLS settings for talking to the escrow service.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::EscrowTlsConfig;
use crate::server::{load_certs, load_private_key};

/// `None` when nothing under `escrow.tls` is set.
pub fn build_client_config(cfg: &EscrowTlsConfig) -> Result<Option<Arc<ClientConfig>>> {
    if !cfg.is_configured() && cfg.reject_unauthorized {
        return Ok(None);
    }

    let mut roots = RootCertStore::empty();
    if let Some(ca) = cfg.ca_path.as_deref() {
        for cert in load_certs(Path::new(ca))? {
            roots
                .add(cert)
                .map_err(|e| anyhow!("invalid escrow ca certificate: {e}"))?;
        }
    } else if cfg.reject_unauthorized {
        return Err(anyhow!("escrow.tls.caPath is required unless rejectUnauthorized is false"));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (cfg.client_cert_path.as_deref(), cfg.client_key_path.as_deref()) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(Path::new(cert))?, load_private_key(Path::new(key))?)
            .map_err(|e| anyhow!("escrow client cert error: {e}"))?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(anyhow!("escrow.tls.clientCertPath and clientKeyPath must be set together")),
    };

    if !cfg.reject_unauthorized {
        tracing::warn!("escrow tls certificate verification disabled");
        let provider = config.crypto_provider().clone();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
    }
    Ok(Some(Arc::new(config)))
}

/// Skips chain and hostname checks but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::build_client_config;
    use crate::config::EscrowTlsConfig;

    #[test]
    fn unset_section_builds_nothing() {
        assert!(build_client_config(&EscrowTlsConfig::default()).expect("build").is_none());
    }

    #[test]
    fn verification_can_be_disabled_without_a_ca() {
        let cfg = EscrowTlsConfig {
            reject_unauthorized: false,
            ..EscrowTlsConfig::default()
        };
        assert!(build_client_config(&cfg).expect("build").is_some());
    }

    #[test]
    fn unreadable_or_partial_paths_fail() {
        let missing = EscrowTlsConfig {
            ca_path: Some("/definitely/not/here/ca.pem".to_string()),
            ..EscrowTlsConfig::default()
        };
        assert!(build_client_config(&missing).is_err());

        let half = EscrowTlsConfig {
            client_cert_path: Some("/tmp/cert.pem".to_string()),
            reject_unauthorized: false,
            ..EscrowTlsConfig::default()
        };
        assert!(build_client_config(&half).is_err());
    }

    #[test]
    fn garbage_ca_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "not a certificate").expect("write");
        let cfg = EscrowTlsConfig {
            ca_path: Some(path.display().to_string()),
            ..EscrowTlsConfig::default()
        };
        assert!(build_client_config(&cfg).is_err());
    }
}
