pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE performed_tasks (
  id                        INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id                   INTEGER NOT NULL,
  public_ip                 TEXT NOT NULL,
  server_time_of_execution  INTEGER NOT NULL
);

CREATE TABLE cert_trust (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  cert_hash    TEXT NOT NULL,
  host         TEXT NOT NULL,
  trust        INTEGER NOT NULL CHECK (trust IN (0,1)),
  valid_until  INTEGER NOT NULL,
  UNIQUE (cert_hash, host)
);

CREATE INDEX idx_performed_tasks_lookup ON performed_tasks(task_id, public_ip);
CREATE INDEX idx_performed_tasks_task ON performed_tasks(task_id);

COMMIT;
"#;
