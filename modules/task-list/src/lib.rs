//! Pulls hunting-task lists from the server and decides, per task, whether
//! it should run.
//!
//! A pulled list carries piggybacked public-IP notifications and the
//! current server time next to the tasks themselves. Eligibility is
//! decided against the locally persisted execution history: a task that
//! recently ran from the current public IP is skipped so a handful of
//! clients cannot monopolize the measurement. Eligible tasks go to the
//! scheduler in random order, which keeps the probing pattern
//! unpredictable for anyone watching the wire.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use certhunt_core::clock::ServerClock;
use certhunt_core::report::Reporter;
use certhunt_core::{now_unix, IpVersion};
use hunter::pip::{PipFetcher, PublicIpObservation};
use hunter::WorkerEvent;
use log::{info, warn};
use messages::{decode_all, HuntingTask, Message};
use net::{HttpTransport, NetError};
use rand::Rng;
use store_sqlite::{lock_db, SharedDb};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPolicy {
    Ok,
    Skip,
}

/// Decide whether a task may run now. `public_ip` is the system's public
/// address of the task's family (`None` when that family is unavailable);
/// `last_execution` is the most recent run of this task from one of the
/// current public IPs.
pub fn policy_for_task(
    public_ip: Option<&str>,
    last_execution: Option<i64>,
    current_server_time: i64,
    reexecution_interval: i64,
) -> TaskPolicy {
    // scanning over an unavailable protocol version is simply not possible
    if public_ip.is_none() {
        return TaskPolicy::Skip;
    }
    if let Some(last) = last_execution {
        if last + reexecution_interval > current_server_time {
            return TaskPolicy::Skip;
        }
    }
    TaskPolicy::Ok
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSummary {
    pub received: usize,
    pub accepted: usize,
}

pub struct TaskListProcessor {
    transport: Arc<dyn HttpTransport>,
    server_host: String,
    hunter: mpsc::Sender<WorkerEvent>,
    clock: Arc<ServerClock>,
    db: SharedDb,
    pip: Option<Arc<PipFetcher>>,
    reporter: Arc<dyn Reporter>,
    reexecution_interval: i64,
}

impl TaskListProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        server_host: String,
        hunter: mpsc::Sender<WorkerEvent>,
        clock: Arc<ServerClock>,
        db: SharedDb,
        pip: Option<Arc<PipFetcher>>,
        reporter: Arc<dyn Reporter>,
        reexecution_interval: i64,
    ) -> Self {
        TaskListProcessor {
            transport,
            server_host,
            hunter,
            clock,
            db,
            pip,
            reporter,
            reexecution_interval,
        }
    }

    /// One full round: pull, decode, resolve IP prerequisites, filter
    /// against execution history, dispatch.
    pub async fn pull_and_process(&mut self) -> Result<ProcessSummary> {
        self.reporter
            .info("pulling hunting tasks from the verification server");
        let url = format!("https://{}/getHuntingTaskList", self.server_host);
        let host_header = format!("{}:443", self.server_host);
        let bytes = match self.transport.get_binary(&url, &host_header).await {
            Ok(bytes) => bytes,
            Err(NetError::Timeout) => {
                self.reporter.technical_failure(
                    "could not reach the verification server (timeout)",
                    false,
                );
                return Ok(ProcessSummary::default());
            }
            Err(NetError::Http(e)) => {
                self.reporter
                    .technical_failure(&format!("task list request failed: {e}"), true);
                bail!("task list request failed: {e}");
            }
        };
        if bytes.is_empty() {
            self.reporter
                .technical_failure("received an empty task list from the server", true);
            bail!("empty task list reply");
        }

        let mut tasks: Vec<HuntingTask> = Vec::new();
        let mut public_v4: Option<PublicIpObservation> = None;
        let mut public_v6: Option<PublicIpObservation> = None;
        for msg in decode_all(&bytes)? {
            match msg {
                Message::HuntingTask(task) => tasks.push(task),
                Message::CurrentServerTime { unix } => self.clock.sync(unix),
                Message::PublicIpNotif { ip, hmac } => {
                    let obs = PublicIpObservation {
                        version: IpVersion::of(&ip),
                        ip,
                        hmac,
                        observed_at: now_unix(),
                    };
                    self.forward_public_ip(&obs).await?;
                    match obs.version {
                        IpVersion::V4 => public_v4 = Some(obs),
                        IpVersion::V6 => public_v6 = Some(obs),
                    }
                }
                // the list signature is checked outside the engine
                Message::Signature { .. } => {}
                other => {
                    self.reporter.technical_failure(
                        "received an unexpected message in the task list",
                        true,
                    );
                    bail!("unexpected message in task list: {other:?}");
                }
            }
        }
        let received = tasks.len();
        self.reporter
            .info(&format!("received {received} tasks from the verification server"));
        if tasks.is_empty() {
            return Ok(ProcessSummary::default());
        }

        // A server address of a family means the system can reach that
        // family at all; only then is a missing public IP worth chasing.
        let server_ips = net::resolve(&self.server_host).await;
        if self
            .hunter
            .send(WorkerEvent::NewServerIps {
                v4: server_ips.v4,
                v6: server_ips.v6,
                observed_at: now_unix(),
            })
            .await
            .is_err()
        {
            bail!("hunting worker unavailable");
        }
        if public_v4.is_none() {
            if let Some(ip) = server_ips.v4 {
                public_v4 = self.acquire_public_ip(IpVersion::V4, IpAddr::V4(ip)).await?;
            }
        }
        if public_v6.is_none() {
            if let Some(ip) = server_ips.v6 {
                public_v6 = self.acquire_public_ip(IpVersion::V6, IpAddr::V6(ip)).await?;
            }
        }

        let pip4 = public_v4.map(|o| o.ip.to_string());
        let pip6 = public_v6.map(|o| o.ip.to_string());
        let task_ids: Vec<u32> = tasks.iter().map(|t| t.task_id).collect();
        let known_ips: Vec<&str> = [pip4.as_deref(), pip6.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        let last_times: HashMap<u32, i64> = if known_ips.is_empty() {
            HashMap::new()
        } else {
            match lock_db(&self.db).last_execution_times(&task_ids, &known_ips) {
                Ok(rows) => rows.into_iter().map(|r| (r.task_id, r.server_time)).collect(),
                Err(e) => {
                    warn!("execution-history query failed: {e}");
                    HashMap::new()
                }
            }
        };

        let current_server_time = self.clock.server_time();
        let mut accepted = 0usize;
        let mut rng = rand::thread_rng();
        while !tasks.is_empty() {
            let candidate = tasks.swap_remove(rng.gen_range(0..tasks.len()));
            let public_ip = match candidate.ip_version {
                IpVersion::V4 => pip4.as_deref(),
                IpVersion::V6 => pip6.as_deref(),
            };
            let last = last_times.get(&candidate.task_id).copied();
            match policy_for_task(public_ip, last, current_server_time, self.reexecution_interval)
            {
                TaskPolicy::Skip => {
                    info!("skipping execution of task {}", candidate.task_id);
                }
                TaskPolicy::Ok => {
                    accepted += 1;
                    if self
                        .hunter
                        .send(WorkerEvent::NewTask(candidate))
                        .await
                        .is_err()
                    {
                        bail!("hunting worker unavailable");
                    }
                }
            }
        }
        self.reporter.info(&format!(
            "task list processed; {accepted} tasks have been accepted"
        ));
        Ok(ProcessSummary { received, accepted })
    }

    async fn forward_public_ip(&self, obs: &PublicIpObservation) -> Result<()> {
        let event = WorkerEvent::NewPublicIp {
            version: obs.version,
            ip: obs.ip,
            hmac: obs.hmac,
            observed_at: obs.observed_at,
        };
        if self.hunter.send(event).await.is_err() {
            bail!("hunting worker unavailable");
        }
        Ok(())
    }

    async fn acquire_public_ip(
        &self,
        version: IpVersion,
        server_ip: IpAddr,
    ) -> Result<Option<PublicIpObservation>> {
        let Some(pip) = self.pip.as_ref() else {
            return Ok(None);
        };
        match pip.fetch(version, server_ip).await {
            Ok(Some(obs)) => {
                self.forward_public_ip(&obs).await?;
                Ok(Some(obs))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.reporter
                    .technical_failure(&format!("public-ip request failed: {e}"), false);
                Ok(None)
            }
        }
    }
}
