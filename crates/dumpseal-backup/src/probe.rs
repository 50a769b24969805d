//! Database probing: liveness and replication coordinates.

use std::process::Stdio;

use secrecy::SecretString;

use dumpseal_core::config::{ConnectionConfig, DatabaseEngine};
use dumpseal_core::{DumpsealError, ReplicationPosition};

use crate::connection::{query_command, ProcessSpec};
use crate::process::stderr_excerpt;

/// Blocking view of the target database. The orchestrator calls it from
/// blocking tasks only.
pub trait DatabaseProbe: Send + Sync {
    /// Fail unless the server accepts a trivial query.
    fn ping(&self) -> Result<(), DumpsealError>;

    /// Current binary log / WAL position, `Ok(None)` when the server has none
    /// (binary logging off, for example).
    fn replication_position(&self) -> Result<Option<ReplicationPosition>, DumpsealError>;
}

/// Probe that shells out to the engine's command-line client.
pub struct CliProbe {
    conn: ConnectionConfig,
    password: Option<SecretString>,
}

impl CliProbe {
    pub fn new(conn: ConnectionConfig, password: Option<SecretString>) -> Self {
        Self { conn, password }
    }

    fn query(&self, sql: &str) -> Result<String, DumpsealError> {
        run_capture(&query_command(&self.conn, self.password.clone(), sql))
    }
}

impl DatabaseProbe for CliProbe {
    fn ping(&self) -> Result<(), DumpsealError> {
        let out = self.query("SELECT 1")?;
        if out.trim() == "1" {
            Ok(())
        } else {
            Err(DumpsealError::ProcessFailure {
                program: client_name(&self.conn).into(),
                status: "ok".into(),
                stderr: format!("unexpected ping reply: {}", out.trim()),
            })
        }
    }

    fn replication_position(&self) -> Result<Option<ReplicationPosition>, DumpsealError> {
        match self.conn.engine {
            DatabaseEngine::Mysql => {
                // 8.4 removed SHOW MASTER STATUS
                let out = match self.query("SHOW MASTER STATUS") {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::debug!("SHOW MASTER STATUS failed, trying SHOW BINARY LOG STATUS: {e}");
                        self.query("SHOW BINARY LOG STATUS")?
                    }
                };
                Ok(parse_mysql_master_status(&out))
            }
            DatabaseEngine::Postgres => {
                let out = match self.query("SELECT pg_current_wal_lsn()") {
                    Ok(out) => out,
                    // standbys cannot report a write position
                    Err(_) => self.query("SELECT pg_last_wal_replay_lsn()")?,
                };
                Ok(parse_pg_lsn(&out))
            }
        }
    }
}

fn client_name(conn: &ConnectionConfig) -> &str {
    match (&conn.client_program, conn.engine) {
        (Some(p), _) => p,
        (None, DatabaseEngine::Mysql) => "mysql",
        (None, DatabaseEngine::Postgres) => "psql",
    }
}

/// Run `spec` to completion and return its stdout.
fn run_capture(spec: &ProcessSpec) -> Result<String, DumpsealError> {
    let output = spec
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| DumpsealError::ProcessFailure {
            program: spec.program.clone(),
            status: "not started".into(),
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(DumpsealError::ProcessFailure {
            program: spec.program.clone(),
            status: output.status.to_string(),
            stderr: stderr_excerpt(&output.stderr),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `SHOW MASTER STATUS` / `SHOW BINARY LOG STATUS` in batch mode:
/// `File  Position  Binlog_Do_DB  Binlog_Ignore_DB  Executed_Gtid_Set`,
/// tab-separated, no header. Empty output means binary logging is off.
pub fn parse_mysql_master_status(output: &str) -> Option<ReplicationPosition> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let log_file = fields.first().filter(|f| !f.is_empty()).map(|f| f.to_string());
    let log_position = fields.get(1).and_then(|p| p.parse::<u64>().ok());
    let gtid_set = fields
        .get(4)
        .filter(|g| !g.is_empty())
        .map(|g| g.replace("\\n", ""));
    let pos = ReplicationPosition {
        log_file,
        log_position,
        gtid_set,
    };
    (!pos.is_empty()).then_some(pos)
}

/// Parse a bare LSN such as `0/16B3740`.
pub fn parse_pg_lsn(output: &str) -> Option<ReplicationPosition> {
    let lsn = output.trim();
    let (hi, lo) = lsn.split_once('/')?;
    let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex(hi) || !is_hex(lo) {
        return None;
    }
    Some(ReplicationPosition {
        log_file: None,
        log_position: None,
        gtid_set: Some(lsn.to_string()),
    })
}
