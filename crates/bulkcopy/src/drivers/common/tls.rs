//! TLS settings shared by both vendors.
//!
//! `ssl_mode` uses PostgreSQL's vocabulary. PostgreSQL connections get a
//! rustls connector; SQL Server connections map the mode onto tiberius'
//! encryption level.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tiberius::EncryptionLevel;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use crate::error::{BulkError, Result};

/// Connection encryption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP.
    Disable,
    /// TLS without certificate verification.
    #[default]
    Require,
    /// TLS with certificate verification.
    VerifyCa,
    /// TLS with certificate and hostname verification.
    VerifyFull,
}

impl SslMode {
    /// Parse an `ssl_mode` value.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "require" | "" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(BulkError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether the server certificate is checked.
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Tiberius encryption level for this mode.
    pub fn encryption_level(&self) -> EncryptionLevel {
        if self.requires_tls() {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        }
    }
}

/// rustls connector for deadpool-postgres, `None` when TLS is disabled.
pub fn pg_connector(mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    match mode {
        SslMode::Disable => {
            warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
            Ok(None)
        }
        _ => Ok(Some(MakeRustlsConnect::new(client_config(mode)))),
    }
}

/// rustls client configuration for a TLS-enabled mode.
pub fn client_config(mode: SslMode) -> ClientConfig {
    if mode.verifies_certificate() {
        info!("ssl_mode={:?}: certificate and hostname verification enabled", mode);
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        warn!(
            "ssl_mode=require: TLS enabled but the server certificate is NOT verified. \
             Use verify-full outside trusted networks."
        );
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::default()))
            .with_no_client_auth()
    }
}

/// Certificate verifier for `ssl_mode=require`: the handshake signatures are
/// still checked, the certificate chain is not.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl Default for AcceptAnyCert {
    fn default() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Require);
        assert!(SslMode::parse("prefer").is_err());
    }

    #[test]
    fn test_mssql_encryption_level() {
        assert!(matches!(
            SslMode::Disable.encryption_level(),
            EncryptionLevel::NotSupported
        ));
        assert!(matches!(
            SslMode::VerifyFull.encryption_level(),
            EncryptionLevel::Required
        ));
    }

    #[test]
    fn test_pg_connector() {
        assert!(pg_connector(SslMode::Disable).unwrap().is_none());
        assert!(pg_connector(SslMode::Require).unwrap().is_some());
        assert!(pg_connector(SslMode::VerifyFull).unwrap().is_some());
    }
}
