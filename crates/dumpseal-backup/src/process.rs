//! Child process plumbing: spawning, bounded stderr capture, kill-on-cancel
//! and the blocking byte pump.

use std::future::Future;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dumpseal_core::{Close, DumpsealError};

use crate::connection::ProcessSpec;
use crate::ProgressFn;

/// Bytes of child stderr kept for error reports.
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Copy buffer for the pump
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Last [`STDERR_TAIL_BYTES`] of `stderr`, lossily decoded and trimmed.
pub fn stderr_excerpt(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Drains a child's stderr on a thread, keeping only the tail.
pub struct StderrTail {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl StderrTail {
    pub fn capture(mut stderr: ChildStderr) -> Self {
        let handle = std::thread::spawn(move || {
            let mut tail = Vec::with_capacity(STDERR_TAIL_BYTES);
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > STDERR_TAIL_BYTES {
                            let excess = tail.len() - STDERR_TAIL_BYTES;
                            tail.drain(..excess);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            tail
        });
        Self {
            handle: Some(handle),
        }
    }

    fn empty() -> Self {
        Self { handle: None }
    }

    /// Wait for the child's stderr to close and return what was kept.
    pub fn finish(mut self) -> String {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(tail)) => stderr_excerpt(&tail),
            Some(Err(_)) => "(stderr reader panicked)".into(),
            None => String::new(),
        }
    }
}

/// A spawned child shared between the waiter and the cancellation watcher.
#[derive(Clone)]
pub struct SharedChild {
    child: Arc<Mutex<Child>>,
    program: String,
}

/// Handles produced by [`SharedChild::spawn`].
pub struct Spawned {
    pub child: SharedChild,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: StderrTail,
}

impl SharedChild {
    /// Spawn `spec` with stderr captured. `stdin`/`stdout` choose which ends are piped.
    pub fn spawn(spec: &ProcessSpec, stdin: Stdio, stdout: Stdio) -> Result<Spawned, DumpsealError> {
        let mut child = spec
            .command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DumpsealError::ProcessFailure {
                program: spec.program.clone(),
                status: "not started".into(),
                stderr: e.to_string(),
            })?;
        tracing::info!(command = %spec, pid = child.id(), "started");

        let stderr = child
            .stderr
            .take()
            .map(StderrTail::capture)
            .unwrap_or_else(StderrTail::empty);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Spawned {
            child: SharedChild {
                child: Arc::new(Mutex::new(child)),
                program: spec.program.clone(),
            },
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Kill the child if it is still running.
    pub fn kill(&self) {
        let mut child = self.lock();
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => match child.kill() {
                Ok(()) => tracing::warn!(program = %self.program, "killed child process"),
                Err(e) => tracing::debug!(program = %self.program, "kill failed: {e}"),
            },
        }
    }

    /// Block until the child exits. Polls so [`SharedChild::kill`] never waits
    /// behind the lock.
    pub fn wait_blocking(&self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.lock().try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Spawn a task that kills the child once `cancel` fires. Abort the
    /// returned handle when the child is done.
    pub fn kill_on_cancel(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let child = self.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            child.kill();
        })
    }
}

/// Turn a non-zero exit into `ProcessFailure`.
pub fn check_exit(program: &str, status: ExitStatus, stderr: String) -> Result<(), DumpsealError> {
    if status.success() {
        return Ok(());
    }
    Err(DumpsealError::ProcessFailure {
        program: program.to_string(),
        status: status.to_string(),
        stderr,
    })
}

/// Copy `src` into `dst` until EOF, checking `cancel` between reads.
///
/// Memory stays at one copy buffer; `dst` sees backpressure from every write.
pub fn pump<R: Read, W: Write>(
    mut src: R,
    dst: &mut W,
    cancel: &CancellationToken,
    progress: Option<&ProgressFn>,
    label: &str,
) -> Result<u64, DumpsealError> {
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(DumpsealError::Cancelled);
        }
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(progress) = progress {
            progress(total, label);
        }
    }
    dst.flush()?;
    Ok(total)
}

/// Abort `stage` on a blocking thread. Failures are only logged: the caller
/// is already reporting the error that got it here.
pub(crate) async fn abort_stage<S: Close + Send + 'static>(mut stage: S, label: &'static str) {
    match tokio::task::spawn_blocking(move || stage.abort()).await {
        Ok(Ok(())) => tracing::debug!("{label} aborted"),
        Ok(Err(e)) => tracing::warn!("aborting {label}: {e}"),
        Err(e) => tracing::warn!("aborting {label}: {e}"),
    }
}

/// Run blocking work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, DumpsealError>
where
    F: FnOnce() -> Result<T, DumpsealError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)?
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> DumpsealError {
    DumpsealError::Io(io::Error::other(format!("blocking task failed: {e}")))
}

/// Resolve `fut`, or fail with `Cancelled` as soon as `cancel` fires.
pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, DumpsealError>>,
) -> Result<T, DumpsealError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DumpsealError::Cancelled),
        result = fut => result,
    }
}
