use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use certhunt_core::{now_unix, sha256, IpVersion};
use log::debug;
use messages::{encode, HuntingTask, Message};
use tokio::sync::mpsc;

use crate::events::{WorkerEvent, WorkerRequest};
use crate::trace::prepend_public_ip_strip_private;
use crate::{ChainFetcher, FetchOutcome, Tracer};

#[derive(Debug, Clone)]
pub struct HunterConfig {
    /// Seconds a public-IP observation counts as current.
    pub public_ip_cache_validity: i64,
    /// Seconds a server-IP observation counts as current.
    pub server_ip_cache_validity: i64,
    /// Completed results accumulated before a flush.
    pub batch_size: usize,
}

impl Default for HunterConfig {
    fn default() -> Self {
        HunterConfig {
            public_ip_cache_validity: 60,
            server_ip_cache_validity: 3600,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct PublicIpState {
    ip: IpAddr,
    hmac: [u8; 32],
    observed_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct ServerIpState {
    ip: IpAddr,
    observed_at: i64,
}

// Probe results parked while the current server time is fetched.
struct InFlight {
    public_ip: IpAddr,
    hmac: [u8; 32],
    chain: Vec<Vec<u8>>,
    trace: String,
}

enum HeadOutcome {
    /// A readiness gate is stale; a refresh was requested and hunting is
    /// suspended until the answer arrives.
    Suspended,
    /// Probing finished; the reply is parked until ServerTimeReply.
    AwaitingServerTime,
    /// This task cannot run; drop it and move on.
    Skip,
}

/// The hunting actor. Owns the task queue, the readiness gates and the
/// result batch; driven exclusively through its mailbox.
pub struct HunterWorker {
    cfg: HunterConfig,
    fetcher: Arc<dyn ChainFetcher>,
    tracer: Arc<dyn Tracer>,
    events: mpsc::Receiver<WorkerEvent>,
    out: mpsc::Sender<WorkerRequest>,
    tasks: VecDeque<HuntingTask>,
    public_v4: Option<PublicIpState>,
    public_v6: Option<PublicIpState>,
    server_v4: Option<ServerIpState>,
    server_v6: Option<ServerIpState>,
    done: Vec<Vec<u8>>,
    currently_hunting: bool,
    in_flight: Option<InFlight>,
    worked_since_drain: bool,
}

impl HunterWorker {
    pub fn new(
        cfg: HunterConfig,
        fetcher: Arc<dyn ChainFetcher>,
        tracer: Arc<dyn Tracer>,
        events: mpsc::Receiver<WorkerEvent>,
        out: mpsc::Sender<WorkerRequest>,
    ) -> Self {
        HunterWorker {
            cfg,
            fetcher,
            tracer,
            events,
            out,
            tasks: VecDeque::new(),
            public_v4: None,
            public_v6: None,
            server_v4: None,
            server_v6: None,
            done: Vec::new(),
            currently_hunting: false,
            in_flight: None,
            worked_since_drain: false,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                WorkerEvent::NewTask(task) => self.store_new_task(task).await,
                WorkerEvent::NewPublicIp {
                    version,
                    ip,
                    hmac,
                    observed_at,
                } => {
                    let state = PublicIpState {
                        ip,
                        hmac,
                        observed_at,
                    };
                    match version {
                        IpVersion::V4 => self.public_v4 = Some(state),
                        IpVersion::V6 => self.public_v6 = Some(state),
                    }
                    self.start_if_idle().await;
                }
                WorkerEvent::PublicIpUnavailable(version) => {
                    self.skip_head_if_version(version);
                    self.start_if_idle().await;
                }
                WorkerEvent::NewServerIps {
                    v4,
                    v6,
                    observed_at,
                } => self.store_new_server_ips(v4, v6, observed_at).await,
                WorkerEvent::ServerTimeReply { server_time } => {
                    self.finish_current(server_time).await
                }
                WorkerEvent::Shutdown => break,
            }
        }
    }

    /// Queue a task unless one with the same ID is already waiting. The
    /// server may resend lists; taskIDs make re-delivery idempotent.
    async fn store_new_task(&mut self, task: HuntingTask) {
        if self.tasks.iter().any(|t| t.task_id == task.task_id) {
            debug!("task {} already queued", task.task_id);
            return;
        }
        self.tasks.push_back(task);
        self.start_if_idle().await;
    }

    async fn store_new_server_ips(
        &mut self,
        v4: Option<std::net::Ipv4Addr>,
        v6: Option<std::net::Ipv6Addr>,
        observed_at: i64,
    ) {
        match v4 {
            Some(ip) => {
                self.server_v4 = Some(ServerIpState {
                    ip: IpAddr::V4(ip),
                    observed_at,
                })
            }
            // no v4 connectivity right now; a v4 task at the head of the
            // queue can never run
            None => self.skip_head_if_version(IpVersion::V4),
        }
        match v6 {
            Some(ip) => {
                self.server_v6 = Some(ServerIpState {
                    ip: IpAddr::V6(ip),
                    observed_at,
                })
            }
            None => self.skip_head_if_version(IpVersion::V6),
        }
        self.start_if_idle().await;
    }

    fn skip_head_if_version(&mut self, version: IpVersion) {
        if self.currently_hunting {
            return;
        }
        if self
            .tasks
            .front()
            .map_or(false, |t| t.ip_version == version)
        {
            if let Some(task) = self.tasks.pop_front() {
                debug!("skipping task {}: no IPv{version} connectivity", task.task_id);
                self.worked_since_drain = true;
            }
        }
    }

    async fn start_if_idle(&mut self) {
        if !self.currently_hunting {
            self.currently_hunting = true;
            self.hunt_loop().await;
        }
    }

    /// Drive the head of the queue until it parks (awaiting server time),
    /// suspends (awaiting a gate refresh) or the queue runs dry.
    async fn hunt_loop(&mut self) {
        loop {
            let Some(head) = self.tasks.front().cloned() else {
                self.currently_hunting = false;
                if !self.done.is_empty() {
                    let batch = std::mem::take(&mut self.done);
                    let _ = self.out.send(WorkerRequest::Results(batch)).await;
                }
                if self.worked_since_drain {
                    self.worked_since_drain = false;
                    let _ = self.out.send(WorkerRequest::QueueDrained).await;
                }
                return;
            };

            let now = now_unix();
            let server = match head.ip_version {
                IpVersion::V4 => self.server_v4.clone(),
                IpVersion::V6 => self.server_v6.clone(),
            };
            let server = match server {
                Some(s) if now <= s.observed_at + self.cfg.server_ip_cache_validity => s,
                _ => {
                    self.currently_hunting = false;
                    let _ = self.out.send(WorkerRequest::NeedServerIps).await;
                    return;
                }
            };

            let public = match head.ip_version {
                IpVersion::V4 => self.public_v4.clone(),
                IpVersion::V6 => self.public_v6.clone(),
            };
            let public = match public {
                Some(p) if now <= p.observed_at + self.cfg.public_ip_cache_validity => p,
                _ => {
                    self.currently_hunting = false;
                    let _ = self
                        .out
                        .send(WorkerRequest::NeedPublicIp {
                            version: head.ip_version,
                            server_ip: server.ip,
                        })
                        .await;
                    return;
                }
            };

            match self.probe_head(&head, public).await {
                HeadOutcome::AwaitingServerTime => return,
                HeadOutcome::Skip => {
                    self.tasks.pop_front();
                    self.worked_since_drain = true;
                    continue;
                }
                HeadOutcome::Suspended => {
                    self.currently_hunting = false;
                    return;
                }
            }
        }
    }

    async fn probe_head(&mut self, task: &HuntingTask, public: PublicIpState) -> HeadOutcome {
        let _ = self
            .out
            .send(WorkerRequest::Info(format!("executing task {}", task.task_id)))
            .await;

        let mut outcome = self
            .fetcher
            .fetch_chain(task.target_ip, task.target_port, &task.hostname, false)
            .await;
        if matches!(outcome, FetchOutcome::HandshakeMismatch) {
            // target speaks only a pre-TLS handshake; one legacy retry
            outcome = self
                .fetcher
                .fetch_chain(task.target_ip, task.target_port, &task.hostname, true)
                .await;
        }
        let chain = match outcome {
            FetchOutcome::Chain(chain) => chain,
            FetchOutcome::HandshakeMismatch | FetchOutcome::Failed(_) => {
                let _ = self
                    .out
                    .send(WorkerRequest::Info(format!(
                        "could not obtain a certificate for task {}; continuing with the next one",
                        task.task_id
                    )))
                    .await;
                return HeadOutcome::Skip;
            }
        };

        let raw_trace = match self.tracer.traceroute(task.target_ip).await {
            Ok(t) => t,
            Err(e) => {
                let _ = self
                    .out
                    .send(WorkerRequest::Failure {
                        message: format!("traceroute for task {} failed: {e}", task.task_id),
                        critical: true,
                    })
                    .await;
                return HeadOutcome::Suspended;
            }
        };
        let trace = prepend_public_ip_strip_private(&public.ip, &raw_trace);

        self.in_flight = Some(InFlight {
            public_ip: public.ip,
            hmac: public.hmac,
            chain,
            trace,
        });
        let _ = self.out.send(WorkerRequest::NeedServerTime).await;
        HeadOutcome::AwaitingServerTime
    }

    /// The server-time answer completes the parked probe: persist the
    /// execution, build the reply, batch it, and move to the next task.
    async fn finish_current(&mut self, server_time: u32) {
        let Some(flight) = self.in_flight.take() else {
            let _ = self
                .out
                .send(WorkerRequest::Failure {
                    message: "received a server-time reply with no probe in flight".into(),
                    critical: true,
                })
                .await;
            return;
        };
        let Some(task) = self.tasks.front().cloned() else {
            let _ = self
                .out
                .send(WorkerRequest::Failure {
                    message: "probe finished but the task queue is empty".into(),
                    critical: true,
                })
                .await;
            return;
        };

        let _ = self
            .out
            .send(WorkerRequest::StoreExecution {
                task_id: task.task_id,
                public_ip: flight.public_ip.to_string(),
                server_time: server_time as i64,
            })
            .await;

        let leaf_hash = flight.chain.first().map(|leaf| sha256(leaf));
        let reply = match leaf_hash {
            // the server already has this certificate; the digest is enough
            Some(hash) if task.known_hashes.contains(&hash) => Message::TaskReplyKnownCert {
                task_id: task.task_id,
                server_time,
                hmac: flight.hmac,
                cert_hash: hash,
                trace: flight.trace,
            },
            _ => Message::TaskReplyNewCert {
                task_id: task.task_id,
                server_time,
                hmac: flight.hmac,
                chain: flight.chain,
                trace: flight.trace,
            },
        };
        match encode(&reply) {
            Ok(bytes) => self.done.push(bytes),
            Err(e) => {
                let _ = self
                    .out
                    .send(WorkerRequest::Failure {
                        message: format!("encoding the reply for task {} failed: {e}", task.task_id),
                        critical: true,
                    })
                    .await;
            }
        }

        // flush on a full batch, or right away when this was the last
        // queued task, so small batches don't sit around
        if self.done.len() >= self.cfg.batch_size || self.tasks.len() == 1 {
            let batch = std::mem::take(&mut self.done);
            let _ = self.out.send(WorkerRequest::Results(batch)).await;
        }

        self.tasks.pop_front();
        self.worked_since_drain = true;
        self.hunt_loop().await;
    }
}
