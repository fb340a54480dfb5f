//! Typed events between the hunting worker and its host loop.
//!
//! All cross-worker communication goes through these two enums; there is no
//! shared mutable state. Both sides match exhaustively, so an unknown event
//! cannot exist.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use certhunt_core::IpVersion;
use messages::HuntingTask;

/// Inbound worker mailbox.
#[derive(Debug)]
pub enum WorkerEvent {
    NewTask(HuntingTask),
    NewPublicIp {
        version: IpVersion,
        ip: IpAddr,
        hmac: [u8; 32],
        observed_at: i64,
    },
    /// A requested public IP could not be obtained; tasks of this family
    /// cannot run right now.
    PublicIpUnavailable(IpVersion),
    NewServerIps {
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
        observed_at: i64,
    },
    ServerTimeReply {
        server_time: u32,
    },
    Shutdown,
}

/// Requests and notifications the worker sends to its host loop.
#[derive(Debug)]
pub enum WorkerRequest {
    NeedPublicIp { version: IpVersion, server_ip: IpAddr },
    NeedServerIps,
    NeedServerTime,
    StoreExecution {
        task_id: u32,
        public_ip: String,
        server_time: i64,
    },
    /// Encoded task-reply frames ready for upload.
    Results(Vec<Vec<u8>>),
    /// The task queue ran dry after at least one task was processed.
    QueueDrained,
    Failure { message: String, critical: bool },
    Info(String),
}
