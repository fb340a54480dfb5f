//! Services the hunting worker's requests.
//!
//! The worker is a pure actor; everything that needs the outside world
//! (DNS, the sealed public-IP exchange, the server clock, the store, the
//! upload path) is answered here, one request at a time.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use certhunt_core::clock::ServerClock;
use certhunt_core::now_unix;
use certhunt_core::report::Reporter;
use collector::ProbeCollector;
use hunter::pip::PipFetcher;
use hunter::{WorkerEvent, WorkerRequest};
use log::warn;
use store_sqlite::{lock_db, SharedDb};
use tokio::sync::mpsc;

pub struct Pump {
    pub events: mpsc::Sender<WorkerEvent>,
    pub requests: mpsc::Receiver<WorkerRequest>,
    pub server_host: String,
    pub clock: Arc<ServerClock>,
    pub db: SharedDb,
    pub collector: ProbeCollector,
    pub pip: Option<Arc<PipFetcher>>,
    pub reporter: Arc<dyn Reporter>,
}

impl Pump {
    /// Run until the worker goes away. A drained task queue asks the
    /// worker to shut down; a critical failure does the same but surfaces
    /// as an error.
    pub async fn run(mut self) -> Result<()> {
        let mut result = Ok(());
        while let Some(request) = self.requests.recv().await {
            match request {
                WorkerRequest::NeedServerIps => {
                    let ips = net::resolve(&self.server_host).await;
                    let event = WorkerEvent::NewServerIps {
                        v4: ips.v4,
                        v6: ips.v6,
                        observed_at: now_unix(),
                    };
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::NeedPublicIp { version, server_ip } => {
                    let observation = match &self.pip {
                        Some(pip) => match pip.fetch(version, server_ip).await {
                            Ok(obs) => obs,
                            Err(e) => {
                                self.reporter.technical_failure(
                                    &format!("public-ip request failed: {e}"),
                                    false,
                                );
                                None
                            }
                        },
                        None => None,
                    };
                    let event = match observation {
                        Some(obs) => WorkerEvent::NewPublicIp {
                            version,
                            ip: obs.ip,
                            hmac: obs.hmac,
                            observed_at: obs.observed_at,
                        },
                        None => WorkerEvent::PublicIpUnavailable(version),
                    };
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::NeedServerTime => {
                    let server_time = self.clock.server_time().clamp(0, u32::MAX as i64) as u32;
                    if self
                        .events
                        .send(WorkerEvent::ServerTimeReply { server_time })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WorkerRequest::StoreExecution {
                    task_id,
                    public_ip,
                    server_time,
                } => {
                    if let Err(e) = lock_db(&self.db).record_execution(task_id, &public_ip, server_time)
                    {
                        warn!("recording execution of task {task_id} failed: {e}");
                    }
                }
                WorkerRequest::Results(batch) => {
                    if let Err(e) = self.collector.flush(batch).await {
                        result = Err(e);
                        let _ = self.events.send(WorkerEvent::Shutdown).await;
                    }
                }
                WorkerRequest::QueueDrained => {
                    let _ = self.events.send(WorkerEvent::Shutdown).await;
                }
                WorkerRequest::Failure { message, critical } => {
                    self.reporter.technical_failure(&message, critical);
                    if critical {
                        result = Err(anyhow!("{message}"));
                        let _ = self.events.send(WorkerEvent::Shutdown).await;
                    }
                }
                WorkerRequest::Info(message) => self.reporter.info(&message),
            }
        }
        result
    }
}
