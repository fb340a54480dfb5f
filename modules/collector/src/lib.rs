//! Ships batches of completed hunting-task results to the server.

use std::sync::Arc;

use anyhow::{bail, Result};
use certhunt_core::report::Reporter;
use log::warn;
use net::{HttpTransport, NetError};

/// How often a timed-out upload of the same batch is retried before the
/// batch is dropped. Losing a batch is acceptable: the server re-offers
/// unanswered tasks on the next pull.
pub const MAX_RESEND_ATTEMPTS: u32 = 3;

pub struct ProbeCollector {
    transport: Arc<dyn HttpTransport>,
    server_host: String,
    reporter: Arc<dyn Reporter>,
}

impl ProbeCollector {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        server_host: String,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        ProbeCollector {
            transport,
            server_host,
            reporter,
        }
    }

    /// Concatenate the encoded reply frames and post them as one body.
    pub async fn flush(&self, replies: Vec<Vec<u8>>) -> Result<()> {
        if replies.is_empty() {
            return Ok(());
        }
        let payload: Vec<u8> = replies.concat();
        let url = format!("https://{}/reportResults", self.server_host);
        let host_header = format!("{}:443", self.server_host);
        self.reporter.info(&format!(
            "sending {} results to the verification server",
            replies.len()
        ));

        let mut failed_attempts = 0u32;
        loop {
            match self
                .transport
                .post_binary(&url, &host_header, payload.clone())
                .await
            {
                Ok(_) => {
                    self.reporter.info("results delivered");
                    return Ok(());
                }
                Err(NetError::Timeout) => {
                    self.reporter.technical_failure(
                        "could not reach the verification server (timeout)",
                        false,
                    );
                    failed_attempts += 1;
                    if failed_attempts > MAX_RESEND_ATTEMPTS {
                        warn!("giving up on a batch of {} results", replies.len());
                        return Ok(());
                    }
                    self.reporter.info("attempting to resend the hunting-task results");
                }
                Err(NetError::Http(e)) => {
                    self.reporter
                        .technical_failure(&format!("result upload failed: {e}"), true);
                    bail!("result upload failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use certhunt_core::report::{TrustDecision, TrustPrompt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTransport {
        outcomes: Mutex<Vec<Result<Vec<u8>, NetError>>>,
        posts: AtomicUsize,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    impl CountingTransport {
        fn new(outcomes: Vec<Result<Vec<u8>, NetError>>) -> Self {
            CountingTransport {
                outcomes: Mutex::new(outcomes),
                posts: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for CountingTransport {
        async fn post_binary(
            &self,
            _url: &str,
            _host: &str,
            body: Vec<u8>,
        ) -> Result<Vec<u8>, NetError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push(body);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Err(NetError::Timeout)
            } else {
                outcomes.remove(0)
            }
        }

        async fn get_binary(&self, _url: &str, _host: &str) -> Result<Vec<u8>, NetError> {
            Err(NetError::Timeout)
        }
    }

    struct QuietReporter;

    impl Reporter for QuietReporter {
        fn info(&self, _message: &str) {}
        fn technical_failure(&self, _message: &str, _critical: bool) {}
        fn warn_attack(&self, _message: &str) {}
        fn prompt_trust_decision(&self, _prompt: &TrustPrompt) -> TrustDecision {
            TrustDecision::Undecided
        }
    }

    fn collector(transport: Arc<CountingTransport>) -> ProbeCollector {
        ProbeCollector::new(transport, "verify.certhunt.net".into(), Arc::new(QuietReporter))
    }

    #[tokio::test]
    async fn success_posts_concatenated_frames_once() {
        let transport = Arc::new(CountingTransport::new(vec![Ok(vec![])]));
        let c = collector(transport.clone());
        c.flush(vec![vec![1, 2], vec![3, 4, 5]]).await.unwrap();
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
        assert_eq!(transport.bodies.lock().unwrap()[0], vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn persistent_timeout_retries_then_gives_up() {
        let transport = Arc::new(CountingTransport::new(vec![]));
        let c = collector(transport.clone());
        // giving up is not an error; the batch just goes away
        c.flush(vec![vec![1]]).await.unwrap();
        assert_eq!(
            transport.posts.load(Ordering::SeqCst) as u32,
            MAX_RESEND_ATTEMPTS + 1
        );
        // the identical payload was resent every time
        let bodies = transport.bodies.lock().unwrap();
        assert!(bodies.iter().all(|b| *b == vec![1]));
    }

    #[tokio::test]
    async fn recovery_after_one_timeout() {
        let transport = Arc::new(CountingTransport::new(vec![
            Err(NetError::Timeout),
            Ok(vec![]),
        ]));
        let c = collector(transport.clone());
        c.flush(vec![vec![7]]).await.unwrap();
        assert_eq!(transport.posts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hard_http_failure_is_fatal() {
        let transport = Arc::new(CountingTransport::new(vec![Err(NetError::Http(
            "status 503".into(),
        ))]));
        let c = collector(transport);
        assert!(c.flush(vec![vec![1]]).await.is_err());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let transport = Arc::new(CountingTransport::new(vec![]));
        let c = collector(transport.clone());
        c.flush(vec![]).await.unwrap();
        assert_eq!(transport.posts.load(Ordering::SeqCst), 0);
    }
}
