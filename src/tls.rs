// Devices present self-signed certificates issued at pairing time, so the usual
// webpki verification can never succeed. Authentication happens through the client
// certificate from the pairing record instead.

use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use crate::{pairing_file::PairingFile, IdeviceError, IdeviceSocket};

#[cfg(not(any(feature = "ring", feature = "aws-lc")))]
compile_error!("enable either the `ring` or the `aws-lc` feature for TLS sessions");

/// Accepts whatever certificate the device serves
#[derive(Debug)]
struct DeviceCertVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for DeviceCertVerifier {
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc", not(feature = "ring")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

fn client_config(pairing_file: &PairingFile) -> Result<ClientConfig, IdeviceError> {
    let provider = Arc::new(crypto_provider());
    let verifier = DeviceCertVerifier {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    };
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![pairing_file.host_certificate.clone()], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();
    Ok(config)
}

/// Runs the TLS handshake on `socket` with the host credentials from `pairing_file`
pub(crate) async fn connect(
    pairing_file: &PairingFile,
    socket: IdeviceSocket,
) -> Result<TlsStream<IdeviceSocket>, IdeviceError> {
    let connector = TlsConnector::from(Arc::new(client_config(pairing_file)?));
    let server_name = ServerName::try_from("Device")
        .map_err(|e| IdeviceError::InternalError(e.to_string()))?;
    debug!("Starting TLS handshake");
    Ok(connector.connect(server_name, socket).await?)
}
