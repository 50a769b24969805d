//! Restore orchestration: artifact → read pipeline → client process.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use dumpseal_core::config::RestoreConfig;
use dumpseal_core::{Close, CompressionAlgorithm, DumpsealError};
use dumpseal_crypto::Key;
use dumpseal_pipeline::{build_read_pipeline, ReadOptions, ReadPipeline, StageObserver};

use crate::artifact::format_from_name;
use crate::checksum::verify_checksum;
use crate::connection::ProcessSpec;
use crate::metadata::{read_sidecar, BackupResult, RestoreResult};
use crate::probe::DatabaseProbe;
use crate::process::{
    abort_stage, blocking, check_exit, join_error, pump, until_cancelled, SharedChild, Spawned,
};
use crate::state::{JobState, JobTracker};
use crate::verify::decode_to_sink;
use crate::ProgressFn;

pub struct RestoreJob {
    pub artifact: PathBuf,
    /// Client that reads the dump on stdin
    pub restore: ProcessSpec,
    pub probe: Arc<dyn DatabaseProbe>,
    pub key: Option<Arc<Key>>,
    /// Overrides the recorded compression of a plain artifact. Encrypted
    /// artifacts always use the algorithm sealed inside them.
    pub compression: Option<CompressionAlgorithm>,
    /// Decode the whole artifact before the client sees a byte
    pub verify_first: bool,
    /// Compare against the sidecar checksum when one was recorded
    pub verify_checksum: bool,
    pub progress: Option<ProgressFn>,
    /// Sees every read stage close or abort
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl RestoreJob {
    pub fn from_config(
        artifact: PathBuf,
        config: &RestoreConfig,
        restore: ProcessSpec,
        probe: Arc<dyn DatabaseProbe>,
        key: Option<Key>,
    ) -> Self {
        Self {
            artifact,
            restore,
            probe,
            key: key.map(Arc::new),
            compression: None,
            verify_first: config.verify_first,
            verify_checksum: config.verify_checksum,
            progress: None,
            observer: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Restore an artifact into the database.
///
/// Any integrity failure (checksum, authentication, truncation) is fatal and
/// never retried. If it surfaces mid-stream the client is killed so it stops
/// consuming input.
pub async fn run_restore(job: RestoreJob, cancel: CancellationToken) -> Result<RestoreResult, DumpsealError> {
    let mut tracker = JobTracker::new("restore");
    let target = job.artifact.display().to_string();
    match execute(&job, &cancel, &mut tracker).await {
        Ok(result) => Ok(result),
        Err(err) => {
            tracker.fail(err.kind());
            tracing::error!(artifact = %target, kind = %err.kind(), "restore failed: {err}");
            Err(err.in_job("restore", target))
        }
    }
}

async fn execute(
    job: &RestoreJob,
    cancel: &CancellationToken,
    tracker: &mut JobTracker,
) -> Result<RestoreResult, DumpsealError> {
    let clock = Instant::now();

    tracker.advance(JobState::Connecting)?;
    let artifact_bytes = std::fs::metadata(&job.artifact)?.len();
    let probe = job.probe.clone();
    until_cancelled(cancel, blocking(move || probe.ping())).await?;

    let path = job.artifact.clone();
    let sidecar = blocking(move || read_sidecar(&path)).await?;
    let mut format = sidecar
        .as_ref()
        .map(BackupResult::format)
        .unwrap_or_else(|| format_from_name(&job.artifact));
    if job.compression.is_some() {
        format.compression = job.compression;
    }

    let mut checksum_verified = false;
    if job.verify_checksum {
        match sidecar.and_then(|meta| meta.checksum) {
            Some(expected) => {
                let path = job.artifact.clone();
                until_cancelled(cancel, blocking(move || verify_checksum(&path, &expected))).await?;
                checksum_verified = true;
            }
            None => tracing::debug!(artifact = %job.artifact.display(), "no recorded checksum to verify"),
        }
    }

    if job.verify_first {
        let path = job.artifact.clone();
        let key = job.key.clone();
        let verify_cancel = cancel.clone();
        let decoded = blocking(move || {
            decode_to_sink(&path, key.as_deref(), format, &verify_cancel)
        })
        .await?;
        tracing::info!(raw_bytes = decoded.raw_bytes, "artifact verified before restore");
    }

    tracker.advance(JobState::Streaming)?;
    let path = job.artifact.clone();
    let key = job.key.clone();
    let observer = job.observer.clone();
    let pipeline = blocking(move || {
        let opts = ReadOptions {
            key: key.as_deref(),
            compression: format.compression,
            encrypted: format.encrypted,
            observer,
        };
        build_read_pipeline(File::open(&path)?, &opts)
    })
    .await?;
    let compression = pipeline.compression();
    let encrypted = pipeline.is_encrypted();

    let (pipeline, raw_bytes) = match stream_restore(job, cancel, pipeline).await {
        (Some(pipeline), Ok(raw_bytes)) => (pipeline, raw_bytes),
        (pipeline, result) => {
            if let Some(pipeline) = pipeline {
                abort_stage(pipeline, "read pipeline").await;
            }
            return Err(result
                .err()
                .unwrap_or_else(|| DumpsealError::InvalidInput("read pipeline lost".into())));
        }
    };

    tracker.advance(JobState::Finalizing)?;
    let mut pipeline = pipeline;
    blocking(move || pipeline.close().map_err(DumpsealError::from)).await?;

    tracker.advance(JobState::Completed)?;
    let result = RestoreResult {
        artifact: job.artifact.clone(),
        artifact_bytes,
        raw_bytes,
        compression,
        encrypted,
        verified_first: job.verify_first,
        checksum_verified,
        duration_ms: clock.elapsed().as_millis() as u64,
        state: tracker.state(),
    };
    tracing::info!(
        artifact = %result.artifact.display(),
        raw_bytes,
        duration_ms = result.duration_ms,
        "restore completed"
    );
    Ok(result)
}

async fn stream_restore(
    job: &RestoreJob,
    cancel: &CancellationToken,
    mut pipeline: ReadPipeline,
) -> (Option<ReadPipeline>, Result<u64, DumpsealError>) {
    let Spawned {
        child,
        stdin,
        stderr,
        ..
    } = match SharedChild::spawn(&job.restore, Stdio::piped(), Stdio::null()) {
        Ok(spawned) => spawned,
        Err(e) => return (Some(pipeline), Err(e)),
    };
    let Some(mut stdin) = stdin else {
        child.kill();
        return (
            Some(pipeline),
            Err(DumpsealError::InvalidInput("restore stdin was not captured".into())),
        );
    };
    let watcher = child.kill_on_cancel(cancel.clone());

    let pump_cancel = cancel.clone();
    let progress = job.progress.clone();
    let pumped = tokio::task::spawn_blocking(move || {
        let result = pump(&mut pipeline, &mut stdin, &pump_cancel, progress.as_ref(), "restoring");
        // closing stdin is the client's end of input
        drop(stdin);
        (pipeline, result)
    })
    .await;
    let (pipeline, pumped) = match pumped {
        Ok((pipeline, result)) => (Some(pipeline), result),
        Err(e) => (None, Err(join_error(e))),
    };

    if let Err(e) = &pumped {
        tracing::warn!(kind = %e.kind(), "stopping restore client");
        child.kill();
    }
    let waiter = child.clone();
    let exit = tokio::task::spawn_blocking(move || (waiter.wait_blocking(), stderr.finish())).await;
    watcher.abort();

    let result = match exit {
        Err(e) => Err(join_error(e)),
        Ok((Err(e), _)) => Err(e.into()),
        Ok(_) if cancel.is_cancelled() => Err(DumpsealError::Cancelled),
        Ok((Ok(status), stderr)) => match pumped {
            Ok(n) => check_exit(child.program(), status, stderr).map(|()| n),
            // a client that quit early shows up as a broken pipe; its exit
            // status says more
            Err(DumpsealError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe && !status.success() => {
                check_exit(child.program(), status, stderr).map(|()| 0)
            }
            Err(e) => Err(e),
        },
    };
    (pipeline, result)
}
