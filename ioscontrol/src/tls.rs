// Devices serve self-issued certificates, so the client side accepts any
// peer certificate. The pair record is what establishes trust.
// https://github.com/rustls/rustls/issues/578

use rustls::{
    ClientConfig, DigitallySignedStruct, ServerConfig,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::{IdeviceError, pair_record::PairRecord};

/// Accepts every server certificate and signature
#[derive(Debug)]
pub struct AcceptAnyDevice;

impl ServerCertVerifier for AcceptAnyDevice {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        // older devices still sign with SHA1
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Installs the process wide crypto provider if nobody has yet
pub fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }

    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();

    // A concurrent install can win the race, which is fine.
    if let Err(e) = CryptoProvider::install_default(provider) {
        error!("Failed to set crypto provider: {e:?}");
    }
}

fn host_key(pair_record: &PairRecord) -> Result<PrivateKeyDer<'static>, IdeviceError> {
    Ok(PrivateKeyDer::from_pem_slice(&pair_record.host_private_key)?)
}

pub fn create_client_config(pair_record: &PairRecord) -> Result<ClientConfig, IdeviceError> {
    let private_key = host_key(pair_record)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyDevice))
        .with_client_auth_cert(vec![pair_record.host_certificate.clone()], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();

    debug!("Created TLS client config for {}", pair_record.host_id);
    Ok(config)
}

pub fn create_server_config(pair_record: &PairRecord) -> Result<ServerConfig, IdeviceError> {
    let private_key = host_key(pair_record)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![pair_record.host_certificate.clone()], private_key)?;

    debug!("Created TLS server config for {}", pair_record.host_id);
    Ok(config)
}
