//! External process specs for dump, restore and client queries.
//!
//! Passwords never appear on a command line: they travel in the child's
//! environment (`MYSQL_PWD` / `PGPASSWORD`) and are read from the variable
//! named by `connection.password_env`.

use std::fmt;
use std::process::Command;

use secrecy::{ExposeSecret, SecretString};

use dumpseal_core::config::{ConnectionConfig, DatabaseEngine};
use dumpseal_core::DumpsealError;

/// A program to run plus its arguments and secret environment.
#[derive(Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, SecretString)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secret_env(mut self, name: impl Into<String>, value: SecretString) -> Self {
        self.env.push((name.into(), value));
        self
    }

    /// Build the `Command`; the only place secret values are exposed.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (name, value) in &self.env {
            cmd.env(name, value.expose_secret());
        }
        cmd
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env)
            .finish()
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Read the database password from the configured environment variable.
/// An unset variable means "no password" (socket auth, `.my.cnf`, `.pgpass`).
pub fn resolve_password(conn: &ConnectionConfig) -> Option<SecretString> {
    let var = conn.password_env.as_deref()?;
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
        _ => {
            tracing::debug!(var, "database password variable not set");
            None
        }
    }
}

fn require_database(conn: &ConnectionConfig) -> Result<&str, DumpsealError> {
    if conn.database.trim().is_empty() {
        return Err(DumpsealError::Config("connection.database is not set".into()));
    }
    Ok(&conn.database)
}

fn with_password(spec: ProcessSpec, engine: DatabaseEngine, password: Option<SecretString>) -> ProcessSpec {
    match password {
        Some(pw) => spec.secret_env(password_var(engine), pw),
        None => spec,
    }
}

fn password_var(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::Mysql => "MYSQL_PWD",
        DatabaseEngine::Postgres => "PGPASSWORD",
    }
}

/// Connection flags shared by every program of an engine.
fn connection_args(conn: &ConnectionConfig) -> Vec<String> {
    let port = conn.port().to_string();
    match conn.engine {
        DatabaseEngine::Mysql => vec![
            format!("--host={}", conn.host),
            format!("--port={port}"),
            format!("--user={}", conn.user),
        ],
        DatabaseEngine::Postgres => vec![
            format!("--host={}", conn.host),
            format!("--port={port}"),
            format!("--username={}", conn.user),
            "--no-password".into(),
        ],
    }
}

/// Logical dump of `connection.database`, written to stdout.
pub fn dump_command(
    conn: &ConnectionConfig,
    password: Option<SecretString>,
) -> Result<ProcessSpec, DumpsealError> {
    let database = require_database(conn)?;
    let spec = match conn.engine {
        DatabaseEngine::Mysql => {
            ProcessSpec::new(conn.dump_program.as_deref().unwrap_or("mysqldump"))
                .args(connection_args(conn))
                .args([
                    "--single-transaction",
                    "--routines",
                    "--triggers",
                    "--events",
                ])
                .args(conn.extra_dump_args.iter().cloned())
                .arg(database)
        }
        DatabaseEngine::Postgres => {
            ProcessSpec::new(conn.dump_program.as_deref().unwrap_or("pg_dump"))
                .args(connection_args(conn))
                .args(conn.extra_dump_args.iter().cloned())
                .arg(format!("--dbname={database}"))
        }
    };
    Ok(with_password(spec, conn.engine, password))
}

/// Client that replays a dump read from stdin into `connection.database`.
pub fn restore_command(
    conn: &ConnectionConfig,
    password: Option<SecretString>,
) -> Result<ProcessSpec, DumpsealError> {
    let database = require_database(conn)?;
    let spec = match conn.engine {
        DatabaseEngine::Mysql => {
            ProcessSpec::new(conn.client_program.as_deref().unwrap_or("mysql"))
                .args(connection_args(conn))
                .args(conn.extra_restore_args.iter().cloned())
                .arg(database)
        }
        DatabaseEngine::Postgres => {
            ProcessSpec::new(conn.client_program.as_deref().unwrap_or("psql"))
                .args(connection_args(conn))
                .args(["--quiet", "-v", "ON_ERROR_STOP=1"])
                .args(conn.extra_restore_args.iter().cloned())
                .arg(format!("--dbname={database}"))
        }
    };
    Ok(with_password(spec, conn.engine, password))
}

/// Client that runs one query and prints bare, tab-separated rows.
pub fn query_command(
    conn: &ConnectionConfig,
    password: Option<SecretString>,
    sql: &str,
) -> ProcessSpec {
    let spec = match conn.engine {
        DatabaseEngine::Mysql => {
            ProcessSpec::new(conn.client_program.as_deref().unwrap_or("mysql"))
                .args(connection_args(conn))
                .args(["--batch", "--skip-column-names", "--execute"])
                .arg(sql)
        }
        DatabaseEngine::Postgres => {
            let spec = ProcessSpec::new(conn.client_program.as_deref().unwrap_or("psql"))
                .args(connection_args(conn))
                .args(["--no-psqlrc", "--tuples-only", "--no-align", "--field-separator=\t"]);
            let spec = if conn.database.is_empty() {
                spec
            } else {
                spec.arg(format!("--dbname={}", conn.database))
            };
            spec.arg("--command").arg(sql)
        }
    };
    with_password(spec, conn.engine, password)
}
