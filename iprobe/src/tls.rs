// Devices serve self-signed certificates rooted in the pairing record, so the host
// authenticates with its own certificate and accepts whatever the device presents.

use std::sync::Arc;

use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tracing::debug;

use crate::{IdeviceError, pairing_file::PairingFile};

/// Accepts any device certificate, advertising the schemes of the active provider
#[derive(Debug)]
struct TrustDevice {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for TrustDevice {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Client config presenting the host credentials of `pairing_file`
///
/// Session resumption is off; lockdown hands the stream back to plaintext between sessions.
pub fn client_config(
    provider: Arc<CryptoProvider>,
    pairing_file: &PairingFile,
) -> Result<ClientConfig, IdeviceError> {
    let certificate = CertificateDer::from_pem_slice(&pairing_file.host_certificate)?;
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;
    debug!("Loaded host credentials from pairing record");

    let verifier = TrustDevice {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    };
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![certificate], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();
    Ok(config)
}
