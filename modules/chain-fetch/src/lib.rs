//! Downloads certificate chains from hunting targets.
//!
//! Hunting has to observe whatever certificate a target actually presents,
//! valid or not, so the handshake runs with certificate verification
//! disabled; judging the chain is the verification server's job. Targets
//! that reject the default handshake with an illegal-parameter alert are
//! reported as a handshake mismatch so the caller can retry once in legacy
//! mode (no SNI, address-based server name).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hunter::{ChainFetcher, FetchOutcome};
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{AlertDescription, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

pub struct RustlsChainFetcher {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    default_config: Arc<ClientConfig>,
    legacy_config: Arc<ClientConfig>,
}

impl RustlsChainFetcher {
    pub fn new(connect_timeout: Duration, handshake_timeout: Duration) -> anyhow::Result<Self> {
        // Ensure a crypto provider is installed (ring)
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::ring::default_provider(),
        );
        let verifier = Arc::new(AcceptAnyCert(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        ));
        let default_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        let mut legacy_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        legacy_config.enable_sni = false;
        Ok(RustlsChainFetcher {
            connect_timeout,
            handshake_timeout,
            default_config: Arc::new(default_config),
            legacy_config: Arc::new(legacy_config),
        })
    }
}

#[async_trait]
impl ChainFetcher for RustlsChainFetcher {
    async fn fetch_chain(
        &self,
        ip: IpAddr,
        port: u16,
        hostname: &str,
        legacy: bool,
    ) -> FetchOutcome {
        let addr = SocketAddr::new(ip, port);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return FetchOutcome::Failed(format!("connect to {addr} failed: {e}")),
            Err(_) => return FetchOutcome::Failed(format!("connect to {addr} timed out")),
        };

        let (config, server_name) = if legacy {
            (self.legacy_config.clone(), ServerName::IpAddress(ip.into()))
        } else {
            match ServerName::try_from(hostname.to_owned()) {
                Ok(name) => (self.default_config.clone(), name),
                Err(_) => (self.default_config.clone(), ServerName::IpAddress(ip.into())),
            }
        };
        debug!("fetching chain from {addr} (sni host {hostname}, legacy {legacy})");

        let connector = TlsConnector::from(config);
        let tls = match timeout(self.handshake_timeout, connector.connect(server_name, stream))
            .await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return classify_handshake_error(e),
            Err(_) => return FetchOutcome::Failed(format!("handshake with {addr} timed out")),
        };

        let chain = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();
        FetchOutcome::Chain(chain)
    }
}

fn classify_handshake_error(e: std::io::Error) -> FetchOutcome {
    if let Some(rustls_err) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        if matches!(
            rustls_err,
            rustls::Error::AlertReceived(AlertDescription::IllegalParameter)
        ) {
            return FetchOutcome::HandshakeMismatch;
        }
    }
    FetchOutcome::Failed(format!("tls handshake failed: {e}"))
}

/// Verifier that accepts every certificate. The observed chain is the
/// measurement; nothing is trusted because of it.
#[derive(Debug)]
struct AcceptAnyCert(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn fetcher_builds_both_configs() {
        let f = RustlsChainFetcher::new(Duration::from_secs(20), Duration::from_secs(10)).unwrap();
        assert!(f.default_config.enable_sni);
        assert!(!f.legacy_config.enable_sni);
    }

    #[test]
    fn illegal_parameter_alert_maps_to_mismatch() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::IllegalParameter),
        );
        assert!(matches!(
            classify_handshake_error(err),
            FetchOutcome::HandshakeMismatch
        ));
    }

    #[test]
    fn other_errors_map_to_failure() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::HandshakeFailure),
        );
        assert!(matches!(
            classify_handshake_error(err),
            FetchOutcome::Failed(_)
        ));
        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(classify_handshake_error(plain), FetchOutcome::Failed(_)));
    }
}
