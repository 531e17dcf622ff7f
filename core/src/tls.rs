//! Opportunistic TLS for every connection in the system.
//!
//! The accepting side generates a fresh self-signed certificate per
//! process start; the dialing side performs no certificate validation.
//! Integrity and authenticity rest on the shared transfer ID, not on TLS
//! identity.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};

pub use tokio_rustls::client::TlsStream as ClientTlsStream;
pub use tokio_rustls::server::TlsStream as ServerTlsStream;
pub use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Builds the accepting side with a fresh self-signed certificate.
pub fn acceptor() -> Result<TlsAcceptor> {
    let cert = rcgen::generate_simple_self_signed(vec!["freighter".to_string()])
        .map_err(|e| Error::Tls(e.to_string()))?;

    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], PrivateKeyDer::from(key_der))
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the dialing side. No certificate validation is performed.
pub fn connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify::default()))
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Dials `addr` ("host:port") and completes the TLS handshake.
pub async fn connect(connector: &TlsConnector, addr: &str) -> Result<ClientTlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;

    let host = addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(addr)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let name = ServerName::try_from(host.to_owned())
        .map_err(|_| Error::Tls(format!("invalid server name in {addr:?}")))?;

    Ok(connector.connect(name, stream).await?)
}

/// Accepts every presented certificate.
#[derive(Debug)]
struct NoVerify {
    provider: CryptoProvider,
}

impl Default for NoVerify {
    fn default() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for NoVerify {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
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
    fn test_acceptor_builds() {
        assert!(acceptor().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_with_unvalidated_self_signed_cert() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let acceptor = acceptor().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let connector = connector();
        let mut tls = connect(&connector, &addr.to_string()).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }
}
