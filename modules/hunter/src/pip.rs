//! Attested public-IP acquisition.
//!
//! The client must learn the public IP the server sees for it, over plain
//! HTTP to a specific server address (HTTPS to a bare IP cannot work, and
//! the address family of the connection is the point of the exercise). The
//! reply therefore travels through a sealed channel: the request carries an
//! RSA-OAEP-encrypted session key, the reply comes back AES-encrypted with
//! a SHA-256 trailer. The asymmetric sealing itself lives behind
//! [`PipCipher`]; the trailer check happens here, and a mismatch is treated
//! as an active attack rather than an ordinary failure.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use certhunt_core::report::Reporter;
use certhunt_core::{now_unix, sha256, IpVersion};
use log::info;
use messages::{decode_all, encode, Message};
use net::{HttpTransport, NetError};

/// Opaque sealing primitive for the public-IP channel.
pub trait PipCipher: Send + Sync {
    /// Produce the encrypted session-key blob for a PublicIPNotifRequest
    /// and the session material needed to open the reply.
    fn seal_key(&self) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Decrypt a sealed server reply using the session material.
    fn open(&self, session: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct PublicIpObservation {
    pub version: IpVersion,
    pub ip: IpAddr,
    pub hmac: [u8; 32],
    pub observed_at: i64,
}

pub struct PipFetcher {
    transport: Arc<dyn HttpTransport>,
    cipher: Arc<dyn PipCipher>,
    reporter: Arc<dyn Reporter>,
    server_host: String,
}

impl PipFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cipher: Arc<dyn PipCipher>,
        reporter: Arc<dyn Reporter>,
        server_host: String,
    ) -> Self {
        PipFetcher {
            transport,
            cipher,
            reporter,
            server_host,
        }
    }

    /// Ask the server, over the given address, which public IP it sees for
    /// this client. `Ok(None)` means a transport timeout: no IP learned,
    /// nothing broken.
    pub async fn fetch(
        &self,
        version: IpVersion,
        server_ip: IpAddr,
    ) -> Result<Option<PublicIpObservation>> {
        let (sealed_key, session) = self.cipher.seal_key()?;
        let body = encode(&Message::PublicIpNotifRequest { sealed_key })?;
        let url = match server_ip {
            IpAddr::V4(ip) => format!("http://{ip}:80/getPublicIP"),
            IpAddr::V6(ip) => format!("http://[{ip}]:80/getPublicIP"),
        };
        let host_header = format!("{}:80", self.server_host);

        let reply = match self.transport.post_binary(&url, &host_header, body).await {
            Ok(bytes) => bytes,
            Err(NetError::Timeout) => {
                info!("public-ip request over IPv{version} timed out");
                return Ok(None);
            }
            Err(NetError::Http(e)) => bail!("public-ip request over IPv{version} failed: {e}"),
        };

        let plain = self.cipher.open(&session, &reply)?;
        if plain.len() < 32 {
            bail!("public-ip reply shorter than its digest");
        }
        let (payload, trailer) = plain.split_at(plain.len() - 32);
        if sha256(payload).as_bytes() != trailer {
            self.reporter.warn_attack(
                "somebody modified the data transfer between the verification server and this system",
            );
            bail!("public-ip reply failed its integrity check");
        }

        let decoded = decode_all(payload)?;
        match decoded.as_slice() {
            [Message::PublicIpNotif { ip, hmac }] if IpVersion::of(ip) == version => {
                Ok(Some(PublicIpObservation {
                    version,
                    ip: *ip,
                    hmac: *hmac,
                    observed_at: now_unix(),
                }))
            }
            _ => bail!("unexpected reply to a public-ip request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use certhunt_core::report::{TrustDecision, TrustPrompt};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Sealing stand-in: no key transport, reply passes through unchanged.
    struct NullCipher;

    impl PipCipher for NullCipher {
        fn seal_key(&self) -> Result<(Vec<u8>, Vec<u8>)> {
            Ok((vec![0xaa; 16], Vec::new()))
        }

        fn open(&self, _session: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext.to_vec())
        }
    }

    struct FixedTransport {
        reply: Vec<u8>,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn post_binary(
            &self,
            _url: &str,
            _host: &str,
            _body: Vec<u8>,
        ) -> Result<Vec<u8>, NetError> {
            Ok(self.reply.clone())
        }

        async fn get_binary(&self, _url: &str, _host: &str) -> Result<Vec<u8>, NetError> {
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        attacks: AtomicUsize,
        messages: Mutex<Vec<String>>,
    }

    impl Reporter for RecordingReporter {
        fn info(&self, _message: &str) {}
        fn technical_failure(&self, message: &str, _critical: bool) {
            self.messages.lock().unwrap().push(message.to_string());
        }
        fn warn_attack(&self, _message: &str) {
            self.attacks.fetch_add(1, Ordering::SeqCst);
        }
        fn prompt_trust_decision(&self, _prompt: &TrustPrompt) -> TrustDecision {
            TrustDecision::Undecided
        }
    }

    fn sealed_reply(payload: &[u8]) -> Vec<u8> {
        let mut reply = payload.to_vec();
        reply.extend_from_slice(sha256(payload).as_bytes());
        reply
    }

    fn fetcher(reply: Vec<u8>) -> (PipFetcher, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let f = PipFetcher::new(
            Arc::new(FixedTransport { reply }),
            Arc::new(NullCipher),
            reporter.clone(),
            "verify.certhunt.net".into(),
        );
        (f, reporter)
    }

    #[tokio::test]
    async fn fetches_and_verifies_an_observation() {
        let notif = encode(&Message::PublicIpNotif {
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            hmac: [0x11; 32],
        })
        .unwrap();
        let (f, reporter) = fetcher(sealed_reply(&notif));
        let obs = f
            .fetch(IpVersion::V4, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(obs.hmac, [0x11; 32]);
        assert_eq!(reporter.attacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tampered_reply_is_an_attack_signal() {
        let notif = encode(&Message::PublicIpNotif {
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            hmac: [0x11; 32],
        })
        .unwrap();
        let mut reply = sealed_reply(&notif);
        reply[3] ^= 0xff;
        let (f, reporter) = fetcher(reply);
        let err = f
            .fetch(IpVersion::V4, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("integrity"));
        assert_eq!(reporter.attacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_family_reply_is_rejected() {
        let notif = encode(&Message::PublicIpNotif {
            ip: "2001:db8::9".parse().unwrap(),
            hmac: [0x11; 32],
        })
        .unwrap();
        let (f, _) = fetcher(sealed_reply(&notif));
        assert!(f
            .fetch(IpVersion::V4, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
            .await
            .is_err());
    }
}
