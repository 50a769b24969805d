//! Backup orchestration: dump process → write pipeline → artifact.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dumpseal_core::config::{BackupConfig, ConnectionConfig, DatabaseEngine, FailurePolicy};
use dumpseal_core::{ChecksumAlgorithm, Close, CompressionAlgorithm, DumpsealError, ReplicationPosition};
use dumpseal_crypto::Key;
use dumpseal_pipeline::{build_write_pipeline, StageObserver, WriteOptions, WritePipeline};

use crate::artifact::{artifact_file_name, discard_partial, partial_path, unix_now};
use crate::checksum::checksum_file;
use crate::connection::ProcessSpec;
use crate::metadata::{write_sidecar, BackupResult};
use crate::probe::DatabaseProbe;
use crate::process::{
    abort_stage, blocking, check_exit, join_error, pump, until_cancelled, SharedChild, Spawned,
};
use crate::state::{JobState, JobTracker};
use crate::ProgressFn;

/// Everything one backup run needs. Build it with [`BackupJob::from_config`]
/// or fill the fields directly.
pub struct BackupJob {
    pub database: String,
    pub engine: DatabaseEngine,
    pub dump: ProcessSpec,
    pub probe: Arc<dyn DatabaseProbe>,
    /// Final artifact path; output goes to `<artifact>.partial` until done
    pub artifact: PathBuf,
    pub compression: CompressionAlgorithm,
    pub compression_level: Option<i32>,
    /// `None` writes an unencrypted artifact
    pub key: Option<Arc<Key>>,
    pub chunk_size: u32,
    pub checksum: Option<ChecksumAlgorithm>,
    pub write_metadata: bool,
    pub capture_replication: bool,
    pub replication_timeout: Duration,
    pub on_failure: FailurePolicy,
    pub progress: Option<ProgressFn>,
    /// Sees every stage close or abort
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl BackupJob {
    /// Job for `conn` with the `backup` settings. The artifact is named after
    /// the database and the current time, inside `backup.output_dir`.
    pub fn from_config(
        conn: &ConnectionConfig,
        backup: &BackupConfig,
        dump: ProcessSpec,
        probe: Arc<dyn DatabaseProbe>,
        key: Option<Key>,
    ) -> Result<Self, DumpsealError> {
        let key = match (backup.encrypt, key) {
            (true, Some(key)) => Some(Arc::new(key)),
            (true, None) => {
                return Err(DumpsealError::Config(
                    "backup.encrypt is on but no passphrase was provided".into(),
                ))
            }
            (false, _) => None,
        };
        let name = artifact_file_name(&conn.database, backup.compression, key.is_some(), unix_now());
        Ok(Self {
            database: conn.database.clone(),
            engine: conn.engine,
            dump,
            probe,
            artifact: backup.output_dir.join(name),
            compression: backup.compression,
            compression_level: backup.compression_level,
            key,
            chunk_size: backup.chunk_size,
            checksum: backup.checksum,
            write_metadata: backup.write_metadata,
            capture_replication: backup.capture_replication,
            replication_timeout: Duration::from_secs(backup.replication_timeout_secs),
            on_failure: backup.on_failure,
            progress: None,
            observer: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Run a backup to completion or failure.
///
/// On failure every stage is aborted (an encrypted artifact then lacks its
/// final chunk and can never decode as complete) and the partial file is
/// handled per `job.on_failure`. No file ever appears under the final
/// artifact name unless the backup completed.
pub async fn run_backup(job: BackupJob, cancel: CancellationToken) -> Result<BackupResult, DumpsealError> {
    let mut tracker = JobTracker::new("backup");
    let partial = partial_path(&job.artifact);
    let target = job.artifact.display().to_string();

    match execute(&job, &cancel, &mut tracker, &partial).await {
        Ok(result) => Ok(result),
        Err(err) => {
            tracker.fail(err.kind());
            let kept = discard_partial(&partial, &job.artifact, job.on_failure);
            tracing::error!(
                artifact = %target,
                kind = %err.kind(),
                kept = ?kept,
                "backup failed: {err}"
            );
            Err(err.in_job("backup", target))
        }
    }
}

async fn execute(
    job: &BackupJob,
    cancel: &CancellationToken,
    tracker: &mut JobTracker,
    partial: &Path,
) -> Result<BackupResult, DumpsealError> {
    let started_at = unix_now();
    let clock = Instant::now();

    tracker.advance(JobState::Connecting)?;
    let probe = job.probe.clone();
    until_cancelled(cancel, blocking(move || probe.ping())).await?;

    tracker.advance(JobState::Streaming)?;
    // runs alongside the dump; aborted if the dump fails first
    let replication = job
        .capture_replication
        .then(|| tokio::spawn(capture_replication(job.probe.clone(), job.replication_timeout)));
    let result = stream_to_partial(job, cancel, partial).await;
    let replication = match (replication, result.is_ok()) {
        (Some(task), true) => task.await.unwrap_or_else(|e| {
            tracing::warn!("replication capture task failed: {e}");
            None
        }),
        (Some(task), false) => {
            task.abort();
            None
        }
        (None, _) => None,
    };
    let (pipeline, raw_bytes) = result?;

    tracker.advance(JobState::Finalizing)?;
    let encrypted = pipeline.is_encrypted();
    let mut pipeline = pipeline;
    blocking(move || pipeline.close().map_err(DumpsealError::from)).await?;

    let checksum = match job.checksum {
        Some(algorithm) => {
            let path = partial.to_path_buf();
            Some(blocking(move || checksum_file(&path, algorithm)).await?)
        }
        None => None,
    };
    let artifact_bytes = std::fs::metadata(partial)?.len();
    std::fs::rename(partial, &job.artifact)?;

    tracker.advance(JobState::Completed)?;
    let result = BackupResult {
        database: job.database.clone(),
        engine: job.engine,
        artifact: job.artifact.clone(),
        artifact_bytes,
        raw_bytes,
        compression: job.compression,
        encrypted,
        chunk_size: encrypted.then_some(job.chunk_size),
        checksum,
        replication,
        started_at,
        duration_ms: clock.elapsed().as_millis() as u64,
        state: tracker.state(),
    };
    if job.write_metadata {
        // the artifact is already complete; a missing sidecar only loses extras
        if let Err(e) = write_sidecar(&result) {
            tracing::warn!(artifact = %job.artifact.display(), "could not write metadata: {e}");
        }
    }
    tracing::info!(
        artifact = %result.artifact.display(),
        raw_bytes,
        artifact_bytes,
        duration_ms = result.duration_ms,
        "backup completed"
    );
    Ok(result)
}

/// Open `<artifact>.partial`, build the write pipeline over it and stream the
/// dump through. Returns the still-open pipeline on success; on failure the
/// pipeline has already been aborted.
async fn stream_to_partial(
    job: &BackupJob,
    cancel: &CancellationToken,
    partial: &Path,
) -> Result<(WritePipeline, u64), DumpsealError> {
    if let Some(dir) = job.artifact.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let sink = File::create(partial)?;
    let key = job.key.clone();
    let observer = job.observer.clone();
    let (compression, compression_level, chunk_size) =
        (job.compression, job.compression_level, job.chunk_size);
    let pipeline = blocking(move || {
        let opts = WriteOptions {
            compression,
            compression_level,
            encryption: key.as_deref(),
            chunk_size,
            observer,
        };
        build_write_pipeline(sink, &opts)
    })
    .await?;
    tracing::info!(
        artifact = %job.artifact.display(),
        stages = ?pipeline.stages(),
        "backup streaming"
    );

    match stream_dump(job, cancel, pipeline).await {
        (Some(pipeline), Ok(raw_bytes)) => Ok((pipeline, raw_bytes)),
        (pipeline, result) => {
            if let Some(pipeline) = pipeline {
                abort_stage(pipeline, "write pipeline").await;
            }
            Err(result
                .err()
                .unwrap_or_else(|| DumpsealError::InvalidInput("write pipeline lost".into())))
        }
    }
}

/// Spawn the dump and pump its stdout through `pipeline`. Hands the pipeline
/// back so the caller decides between close and abort; it is only lost if the
/// pump thread panicked.
async fn stream_dump(
    job: &BackupJob,
    cancel: &CancellationToken,
    mut pipeline: WritePipeline,
) -> (Option<WritePipeline>, Result<u64, DumpsealError>) {
    let Spawned {
        child,
        stdout,
        stderr,
        ..
    } = match SharedChild::spawn(&job.dump, Stdio::null(), Stdio::piped()) {
        Ok(spawned) => spawned,
        Err(e) => return (Some(pipeline), Err(e)),
    };
    let Some(stdout) = stdout else {
        child.kill();
        return (
            Some(pipeline),
            Err(DumpsealError::InvalidInput("dump stdout was not captured".into())),
        );
    };
    let watcher = child.kill_on_cancel(cancel.clone());

    let pump_cancel = cancel.clone();
    let progress = job.progress.clone();
    let pumped = tokio::task::spawn_blocking(move || {
        let result = pump(stdout, &mut pipeline, &pump_cancel, progress.as_ref(), "dumping");
        (pipeline, result)
    })
    .await;
    let (pipeline, pumped) = match pumped {
        Ok((pipeline, result)) => (Some(pipeline), result),
        Err(e) => (None, Err(join_error(e))),
    };

    if pumped.is_err() {
        // nobody drains the dump's stdout any more
        child.kill();
    }
    let waiter = child.clone();
    let exit = tokio::task::spawn_blocking(move || (waiter.wait_blocking(), stderr.finish())).await;
    watcher.abort();

    let result = match exit {
        Err(e) => Err(join_error(e)),
        Ok((Err(e), _)) => Err(e.into()),
        Ok(_) if cancel.is_cancelled() => Err(DumpsealError::Cancelled),
        Ok((Ok(status), stderr)) => {
            pumped.and_then(|n| check_exit(child.program(), status, stderr).map(|()| n))
        }
    };
    (pipeline, result)
}

/// Best effort: a slow or failing query never fails the backup.
async fn capture_replication(
    probe: Arc<dyn DatabaseProbe>,
    limit: Duration,
) -> Option<ReplicationPosition> {
    let query = tokio::task::spawn_blocking(move || probe.replication_position());
    match tokio::time::timeout(limit, query).await {
        Ok(Ok(Ok(position))) => {
            match &position {
                Some(p) => tracing::info!(position = %p, "replication position captured"),
                None => tracing::info!("server reports no replication position"),
            }
            position
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!("could not read replication position: {e}");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!("replication position query panicked: {e}");
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "replication position query timed out"
            );
            None
        }
    }
}
