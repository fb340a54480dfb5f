use crate::{Db, LastExecution, TrustRow};
use anyhow::Result;
use rusqlite::params;
use rusqlite::types::Value;

impl Db {
    pub fn lookup_trust(&self, cert_hash: &str, host: &str) -> Result<Option<TrustRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT cert_hash, host, trust, valid_until FROM cert_trust WHERE cert_hash=? AND host=? LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![cert_hash, host], |r| {
            Ok(TrustRow {
                cert_hash: r.get(0)?,
                host: r.get(1)?,
                trust: r.get::<_, i64>(2)? != 0,
                valid_until: r.get(3)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_trust(&self) -> Result<Vec<TrustRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cert_hash, host, trust, valid_until FROM cert_trust ORDER BY host")?;
        let rows = stmt.query_map([], |r| {
            Ok(TrustRow {
                cert_hash: r.get(0)?,
                host: r.get(1)?,
                trust: r.get::<_, i64>(2)? != 0,
                valid_until: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// For each of the given tasks, the most recent server time at which it
    /// was executed from one of the given public IPs. Tasks never executed
    /// from those IPs are absent from the result.
    pub fn last_execution_times(
        &self,
        task_ids: &[u32],
        public_ips: &[&str],
    ) -> Result<Vec<LastExecution>> {
        if task_ids.is_empty() || public_ips.is_empty() {
            return Ok(Vec::new());
        }
        let id_marks = vec!["?"; task_ids.len()].join(",");
        let ip_marks = vec!["?"; public_ips.len()].join(",");
        let sql = format!(
            "SELECT task_id, MAX(server_time_of_execution) FROM performed_tasks \
             WHERE task_id IN ({id_marks}) AND public_ip IN ({ip_marks}) GROUP BY task_id",
        );
        let mut values: Vec<Value> = Vec::with_capacity(task_ids.len() + public_ips.len());
        for id in task_ids {
            values.push(Value::Integer(*id as i64));
        }
        for ip in public_ips {
            values.push(Value::Text((*ip).to_string()));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |r| {
            Ok(LastExecution {
                task_id: r.get::<_, i64>(0)? as u32,
                server_time: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::Db;

    #[test]
    fn trust_upsert_replaces_by_key() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_trust("aa", "example.com", true, 100).unwrap();
        db.upsert_trust("aa", "example.com", false, 200).unwrap();
        let row = db.lookup_trust("aa", "example.com").unwrap().unwrap();
        assert!(!row.trust);
        assert_eq!(row.valid_until, 200);
    }

    #[test]
    fn sweep_removes_only_expired_rows() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_trust("aa", "old.example", true, 50).unwrap();
        db.upsert_trust("bb", "new.example", true, 500).unwrap();
        assert_eq!(db.sweep_expired_trust(100).unwrap(), 1);
        assert!(db.lookup_trust("aa", "old.example").unwrap().is_none());
        assert!(db.lookup_trust("bb", "new.example").unwrap().is_some());
    }

    #[test]
    fn last_execution_groups_by_task_and_filters_by_ip() {
        let db = Db::open_in_memory().unwrap();
        db.record_execution(7, "1.2.3.4", 1000).unwrap();
        db.record_execution(7, "1.2.3.4", 2000).unwrap();
        db.record_execution(7, "9.9.9.9", 9000).unwrap();
        db.record_execution(8, "1.2.3.4", 1500).unwrap();
        let rows = db
            .last_execution_times(&[7, 8, 9], &["1.2.3.4", "::1"])
            .unwrap();
        let mut by_id: Vec<(u32, i64)> = rows.iter().map(|r| (r.task_id, r.server_time)).collect();
        by_id.sort_unstable();
        // executions from 9.9.9.9 must not count, task 9 has no history
        assert_eq!(by_id, vec![(7, 2000), (8, 1500)]);
    }
}
