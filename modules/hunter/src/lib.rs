//! Hunting-task scheduler.
//!
//! The worker owns all hunting state and runs as a single actor: one
//! mailbox in, one request channel out. Probing (certificate download,
//! traceroute) happens here, off the flow that serves verification
//! requests, so a slow target never stalls the rest of the client.

pub mod events;
pub mod pip;
pub mod trace;
mod worker;

pub use events::{WorkerEvent, WorkerRequest};
pub use worker::{HunterConfig, HunterWorker};

use async_trait::async_trait;
use std::net::IpAddr;

/// Result of one certificate-chain fetch attempt.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// DER certificates, leaf first. May be empty if the peer sent none.
    Chain(Vec<Vec<u8>>),
    /// The target rejected the default handshake with an illegal-parameter
    /// alert; a retry in legacy mode may still succeed.
    HandshakeMismatch,
    Failed(String),
}

#[async_trait]
pub trait ChainFetcher: Send + Sync {
    async fn fetch_chain(
        &self,
        ip: IpAddr,
        port: u16,
        hostname: &str,
        legacy: bool,
    ) -> FetchOutcome;
}

#[async_trait]
pub trait Tracer: Send + Sync {
    /// Route to the target as newline-delimited hop records; each record
    /// joins the IPs observed for one TTL with '|'.
    async fn traceroute(&self, ip: IpAddr) -> anyhow::Result<String>;
}
