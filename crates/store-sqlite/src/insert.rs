use crate::Db;
use anyhow::Result;
use rusqlite::params;

impl Db {
    /// Record that a hunting task was executed from a public IP. Rows are
    /// append-only; history is never rewritten.
    pub fn record_execution(&self, task_id: u32, public_ip: &str, server_time: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO performed_tasks(task_id, public_ip, server_time_of_execution) VALUES (?,?,?)",
            params![task_id as i64, public_ip, server_time],
        )?;
        Ok(())
    }

    pub fn upsert_trust(&self, cert_hash: &str, host: &str, trust: bool, valid_until: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cert_trust(cert_hash, host, trust, valid_until) VALUES (?,?,?,?)",
            params![cert_hash, host, if trust { 1i64 } else { 0i64 }, valid_until],
        )?;
        Ok(())
    }

    pub fn delete_trust(&self, cert_hash: &str, host: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cert_trust WHERE cert_hash=? AND host=?",
            params![cert_hash, host],
        )?;
        Ok(())
    }

    /// Bulk-delete trust rows whose validity has passed. Run at startup;
    /// lookups already treat expired rows as absent.
    pub fn sweep_expired_trust(&self, now: i64) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM cert_trust WHERE valid_until < ?", params![now])?;
        Ok(n)
    }
}
