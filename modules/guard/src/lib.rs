//! Certificate-verification request queue.
//!
//! Requests are queued first-in-first-out with at most one server
//! round-trip in flight, and identical pending requests are collapsed.
//! Keeping a single request in flight avoids hammering the verification
//! server and makes the per-(hash, host) dedup race-free.
//!
//! The server piggybacks hunting tasks, public-IP notifications and its
//! current time on verification replies to save round-trips; those ride-along
//! messages are forwarded to the hunting worker and the server clock.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Result};
use certhunt_core::clock::ServerClock;
use certhunt_core::report::{Reporter, TrustDecision, TrustPrompt};
use certhunt_core::{now_unix, CertHash, IpVersion};
use hunter::WorkerEvent;
use log::debug;
use messages::{decode_all, encode, Message};
use net::{HttpTransport, NetError};
use tokio::sync::mpsc;
use trust_cache::TrustDecisionCache;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub server_host: String,
    pub trust_automatically: bool,
    pub rating_to_trust_automatically: u8,
    /// Lifetime in seconds of trust decisions written by this component.
    pub cache_validity: i64,
    /// Set when the user sits behind an intercepting SSL proxy; carried in
    /// the request options byte so the server can judge accordingly.
    pub behind_ssl_proxy: bool,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    chain: Vec<Vec<u8>>,
    hash: CertHash,
    host_key: String,
}

pub struct VerificationGuard {
    cfg: GuardConfig,
    transport: Arc<dyn HttpTransport>,
    cache: TrustDecisionCache,
    clock: Arc<ServerClock>,
    reporter: Arc<dyn Reporter>,
    hunter: mpsc::Sender<WorkerEvent>,
    pending: VecDeque<PendingRequest>,
    currently_requesting: bool,
    forwarded_tasks: usize,
    last_result: Option<(u8, String)>,
}

impl VerificationGuard {
    pub fn new(
        cfg: GuardConfig,
        transport: Arc<dyn HttpTransport>,
        cache: TrustDecisionCache,
        clock: Arc<ServerClock>,
        reporter: Arc<dyn Reporter>,
        hunter: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        VerificationGuard {
            cfg,
            transport,
            cache,
            clock,
            reporter,
            hunter,
            pending: VecDeque::new(),
            currently_requesting: false,
            forwarded_tasks: 0,
            last_result: None,
        }
    }

    pub fn cache_mut(&mut self) -> &mut TrustDecisionCache {
        &mut self.cache
    }

    /// Hunting tasks that rode along on verification replies so far.
    pub fn forwarded_tasks(&self) -> usize {
        self.forwarded_tasks
    }

    /// Rating and report of the most recent server verdict.
    pub fn take_last_result(&mut self) -> Option<(u8, String)> {
        self.last_result.take()
    }

    /// Queue a verification of (hash, host). Returns false when an
    /// identical request is already pending.
    pub fn enqueue(&mut self, chain: Vec<Vec<u8>>, hash: CertHash, host_key: &str) -> bool {
        if self
            .pending
            .iter()
            .any(|r| r.hash == hash && r.host_key == host_key)
        {
            debug!("verification of {hash} for {host_key} already queued");
            return false;
        }
        self.pending.push_back(PendingRequest {
            chain,
            hash,
            host_key: host_key.to_string(),
        });
        true
    }

    /// Drain the pending queue, one request in flight at a time. Re-entry
    /// while a drain is active is a no-op; the active drain reaches every
    /// queued request.
    pub async fn drive(&mut self) -> Result<()> {
        if self.currently_requesting {
            return Ok(());
        }
        self.currently_requesting = true;
        let result = self.drain().await;
        self.currently_requesting = false;
        result
    }

    async fn drain(&mut self) -> Result<()> {
        while let Some(request) = self.pending.front().cloned() {
            let msg = Message::CertVerifyRequest {
                options: self.options_byte(),
                chain: request.chain.clone(),
                host: request.host_key.clone(),
            };
            let body = encode(&msg)?;
            let url = format!("https://{}/verifyCert", self.cfg.server_host);
            let host_header = format!("{}:443", self.cfg.server_host);
            match self.transport.post_binary(&url, &host_header, body).await {
                Ok(bytes) => self.process_reply(&request, &bytes).await?,
                Err(NetError::Timeout) => {
                    self.reporter.technical_failure(
                        "could not reach the verification server (timeout)",
                        false,
                    );
                    // the user still has to decide, with degraded information
                    self.apply_decision(
                        &request,
                        None,
                        "Unable to reach the verification server. Among the possible causes \
                         is an attacker interfering with this connection."
                            .into(),
                        true,
                    );
                }
                Err(NetError::Http(e)) => {
                    self.reporter
                        .technical_failure(&format!("verification request failed: {e}"), true);
                    bail!("verification transport failure: {e}");
                }
            }
            self.pending.pop_front();
        }
        Ok(())
    }

    async fn process_reply(&mut self, request: &PendingRequest, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            self.reporter
                .technical_failure("received an empty reply from the verification server", true);
            bail!("empty verification reply");
        }
        let decoded = decode_all(bytes)?;
        for msg in decoded {
            match msg {
                Message::CertVerifyResult { rating, report } => {
                    self.last_result = Some((rating, report.clone()));
                    if self.cfg.trust_automatically
                        && rating > self.cfg.rating_to_trust_automatically
                    {
                        let domain = domain_of(&request.host_key);
                        self.cache
                            .add(request.hash, domain, true, now_unix() + self.cfg.cache_validity);
                    } else {
                        self.apply_decision(request, Some(rating), report, false);
                    }
                }
                Message::HuntingTask(task) => {
                    self.forwarded_tasks += 1;
                    if self.hunter.send(WorkerEvent::NewTask(task)).await.is_err() {
                        bail!("hunting worker unavailable");
                    }
                }
                Message::PublicIpNotif { ip, hmac } => {
                    let event = WorkerEvent::NewPublicIp {
                        version: IpVersion::of(&ip),
                        ip,
                        hmac,
                        observed_at: now_unix(),
                    };
                    if self.hunter.send(event).await.is_err() {
                        bail!("hunting worker unavailable");
                    }
                }
                Message::CurrentServerTime { unix } => self.clock.sync(unix),
                other => {
                    self.reporter.technical_failure(
                        "received an unexpected message in a verification reply",
                        true,
                    );
                    bail!("unexpected message in verification reply: {other:?}");
                }
            }
        }
        Ok(())
    }

    /// Put the verdict in front of the user and apply the answer to the
    /// cache. An undecided answer leaves the cache alone, so the question
    /// comes back on the next observation.
    fn apply_decision(
        &mut self,
        request: &PendingRequest,
        rating: Option<u8>,
        report: String,
        was_timeout: bool,
    ) {
        let prompt = TrustPrompt {
            host_key: request.host_key.clone(),
            cert_hash: request.hash,
            rating,
            threshold: self.cfg.rating_to_trust_automatically,
            report,
            was_timeout,
        };
        let domain = domain_of(&request.host_key).to_string();
        match self.reporter.prompt_trust_decision(&prompt) {
            TrustDecision::Trust => {
                self.cache
                    .add(request.hash, &domain, true, now_unix() + self.cfg.cache_validity)
            }
            TrustDecision::Distrust => {
                self.cache
                    .add(request.hash, &domain, false, now_unix() + self.cfg.cache_validity)
            }
            TrustDecision::Undecided => {}
        }
    }

    fn options_byte(&self) -> u8 {
        u8::from(self.cfg.behind_ssl_proxy)
    }
}

/// Host keys look like "hostname|ip|port"; cache entries are keyed by the
/// hostname alone.
fn domain_of(host_key: &str) -> &str {
    host_key.split('|').next().unwrap_or(host_key)
}
