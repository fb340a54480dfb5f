use serde::{Deserialize, Serialize};

/// One row of the cert_trust table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRow {
    pub cert_hash: String,
    pub host: String,
    pub trust: bool,
    pub valid_until: i64,
}

/// Most recent execution of a task from one of the current public IPs.
#[derive(Debug, Clone, Copy)]
pub struct LastExecution {
    pub task_id: u32,
    pub server_time: i64,
}
