//! Integration test: backup → verify → restore with real child processes
//!
//! `cat` and `sh` stand in for the dump and client programs and a fake probe
//! stands in for the database, so no live server is required.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dumpseal_backup::{
    incomplete_path, metadata_path, partial_path, read_sidecar, run_backup, run_restore,
    verify_artifact, verify_checksum, BackupJob, DatabaseProbe, JobState, ProcessSpec, RestoreJob,
};
use dumpseal_core::config::{DatabaseEngine, FailurePolicy};
use dumpseal_core::{ChecksumAlgorithm, CompressionAlgorithm, DumpsealError, ErrorKind, ReplicationPosition};
use dumpseal_crypto::Key;
use dumpseal_pipeline::{Stage, StageObserver};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct FakeProbe {
    reachable: bool,
    position: Option<ReplicationPosition>,
    delay: Duration,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            reachable: true,
            position: Some(ReplicationPosition {
                log_file: Some("binlog.000042".into()),
                log_position: Some(157),
                gtid_set: None,
            }),
            delay: Duration::ZERO,
        }
    }
}

impl DatabaseProbe for FakeProbe {
    fn ping(&self) -> Result<(), DumpsealError> {
        if self.reachable {
            Ok(())
        } else {
            Err(DumpsealError::ProcessFailure {
                program: "mysql".into(),
                status: "exit status: 1".into(),
                stderr: "ERROR 2003 (HY000): Can't connect to MySQL server".into(),
            })
        }
    }

    fn replication_position(&self) -> Result<Option<ReplicationPosition>, DumpsealError> {
        std::thread::sleep(self.delay);
        Ok(self.position.clone())
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(&'static str, Stage)>>);

impl StageObserver for Recorder {
    fn on_close(&self, stage: &Stage) {
        self.0.lock().unwrap().push(("close", *stage));
    }

    fn on_abort(&self, stage: &Stage) {
        self.0.lock().unwrap().push(("abort", *stage));
    }
}

fn key() -> Key {
    Key::from_bytes([0x5au8; 32])
}

fn dump_sql() -> Vec<u8> {
    (0..5000)
        .map(|i| format!("INSERT INTO orders VALUES ({i}, 'widget-{i}', {});\n", i * 3))
        .collect::<String>()
        .into_bytes()
}

fn cat(path: &Path) -> ProcessSpec {
    ProcessSpec::new("cat").arg(path.display().to_string())
}

fn restore_into(path: &Path) -> ProcessSpec {
    ProcessSpec::new("sh").args(["-c".to_string(), format!("cat > '{}'", path.display())])
}

fn backup_job(dir: &Path, dump: ProcessSpec, probe: FakeProbe) -> BackupJob {
    BackupJob {
        database: "shop".into(),
        engine: DatabaseEngine::Mysql,
        dump,
        probe: Arc::new(probe),
        artifact: dir.join("shop-1714564800.sql.zst.enc"),
        compression: CompressionAlgorithm::Zstd,
        compression_level: None,
        key: Some(Arc::new(key())),
        chunk_size: 4096,
        checksum: Some(ChecksumAlgorithm::Sha256),
        write_metadata: true,
        capture_replication: true,
        replication_timeout: Duration::from_secs(5),
        on_failure: FailurePolicy::MarkIncomplete,
        progress: None,
        observer: None,
    }
}

fn restore_job(artifact: &Path, out: &Path, key: Option<Key>) -> RestoreJob {
    RestoreJob {
        artifact: artifact.to_path_buf(),
        restore: restore_into(out),
        probe: Arc::new(FakeProbe::default()),
        key: key.map(Arc::new),
        compression: None,
        verify_first: true,
        verify_checksum: true,
        progress: None,
        observer: None,
    }
}

/// Back up `dump_sql()` with the given shape and return the artifact path.
async fn backed_up(tmp: &TempDir, compression: CompressionAlgorithm, encrypted: bool) -> PathBuf {
    let source = tmp.path().join("dump.sql");
    std::fs::write(&source, dump_sql()).unwrap();
    let mut job = backup_job(tmp.path(), cat(&source), FakeProbe::default());
    job.compression = compression;
    if !encrypted {
        job.key = None;
        job.artifact = tmp.path().join("shop-1.sql");
    }
    run_backup(job, CancellationToken::new())
        .await
        .expect("backup should succeed")
        .artifact
}

/// Flip one ciphertext byte in a chunk near the middle of a 4096-byte-chunk
/// artifact, leaving every chunk marker intact.
fn flip_inside_chunk(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let frame = 1 + 4096 + 16;
    let chunks = (bytes.len() - 17) / frame;
    let offset = 17 + (chunks / 2) * frame + 50;
    bytes[offset] ^= 0x01;
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn backup_verify_restore_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("dump.sql");
    std::fs::write(&source, dump_sql()).unwrap();

    let seen = Arc::new(AtomicU64::new(0));
    let counter = seen.clone();
    let job = backup_job(tmp.path(), cat(&source), FakeProbe::default())
        .with_progress(Arc::new(move |n: u64, _: &str| counter.store(n, Ordering::SeqCst)));
    let artifact = job.artifact.clone();

    let result = run_backup(job, CancellationToken::new()).await.expect("backup");
    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.raw_bytes, dump_sql().len() as u64);
    assert_eq!(seen.load(Ordering::SeqCst), result.raw_bytes);
    assert!(result.encrypted);
    assert_eq!(result.chunk_size, Some(4096));
    assert_eq!(result.replication.as_ref().unwrap().to_string(), "binlog.000042:157");
    assert!(artifact.exists());
    assert!(!partial_path(&artifact).exists());
    assert_eq!(
        std::fs::metadata(&artifact).unwrap().len(),
        result.artifact_bytes
    );

    // sidecar mirrors the result and its checksum matches the file
    assert_eq!(read_sidecar(&artifact).unwrap().as_ref(), Some(&result));
    verify_checksum(&artifact, result.checksum.as_ref().unwrap()).unwrap();

    let report = verify_artifact(&artifact, Some(&key())).unwrap();
    assert_eq!(report.raw_bytes, result.raw_bytes);
    assert_eq!(report.compression, CompressionAlgorithm::Zstd);
    assert!(report.encrypted);
    assert_eq!(report.checksum, result.checksum);

    let out = tmp.path().join("restored.sql");
    let restored = run_restore(restore_job(&artifact, &out, Some(key())), CancellationToken::new())
        .await
        .expect("restore");
    assert_eq!(restored.state, JobState::Completed);
    assert!(restored.checksum_verified);
    assert!(restored.verified_first);
    assert_eq!(restored.raw_bytes, result.raw_bytes);
    assert_eq!(std::fs::read(&out).unwrap(), dump_sql());
}

#[tokio::test]
async fn plain_gzip_backup_restores_without_key() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::Gzip, false).await;

    let out = tmp.path().join("restored.sql");
    let restored = run_restore(restore_job(&artifact, &out, None), CancellationToken::new())
        .await
        .expect("restore");
    assert!(!restored.encrypted);
    assert_eq!(restored.compression, CompressionAlgorithm::Gzip);
    assert_eq!(std::fs::read(&out).unwrap(), dump_sql());
}

#[tokio::test]
async fn failed_dump_leaves_incomplete_artifact() {
    let tmp = TempDir::new().unwrap();
    let dump = ProcessSpec::new("sh").args([
        "-c",
        "printf 'CREATE TABLE t (id int);\\n'; echo 'mysqldump: Got error: 1045' >&2; exit 2",
    ]);
    let job = backup_job(tmp.path(), dump, FakeProbe::default());
    let artifact = job.artifact.clone();

    let err = run_backup(job, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessFailure);
    assert!(err.to_string().contains("1045"), "{err}");

    assert!(!artifact.exists());
    assert!(!partial_path(&artifact).exists());
    assert!(!metadata_path(&artifact).exists());
    let incomplete = incomplete_path(&artifact);
    assert!(incomplete.exists());

    // the aborted stream never got its final chunk
    let err = verify_artifact(&incomplete, Some(&key())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TruncatedStream);
}

#[tokio::test]
async fn delete_policy_removes_partial_output() {
    let tmp = TempDir::new().unwrap();
    let dump = ProcessSpec::new("sh").args(["-c", "echo partial; exit 1"]);
    let mut job = backup_job(tmp.path(), dump, FakeProbe::default());
    job.on_failure = FailurePolicy::Delete;
    let artifact = job.artifact.clone();

    run_backup(job, CancellationToken::new()).await.unwrap_err();
    assert!(!artifact.exists());
    assert!(!partial_path(&artifact).exists());
    assert!(!incomplete_path(&artifact).exists());
}

#[tokio::test]
async fn unreachable_database_fails_before_streaming() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe {
        reachable: false,
        ..Default::default()
    };
    let job = backup_job(tmp.path(), ProcessSpec::new("true"), probe);

    let err = run_backup(job, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessFailure);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_kills_the_dump() {
    let tmp = TempDir::new().unwrap();
    let dump = ProcessSpec::new("sh").args(["-c", "echo '-- dump started'; exec sleep 30"]);
    let job = backup_job(tmp.path(), dump, FakeProbe::default());
    let artifact = job.artifact.clone();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_backup(job, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("cancelled backup should stop promptly")
        .unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(!artifact.exists());
    assert!(incomplete_path(&artifact).exists());
}

#[tokio::test]
async fn slow_replication_probe_does_not_fail_backup() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("dump.sql");
    std::fs::write(&source, b"SELECT 1;\n").unwrap();
    let probe = FakeProbe {
        delay: Duration::from_millis(800),
        ..Default::default()
    };
    let mut job = backup_job(tmp.path(), cat(&source), probe);
    job.replication_timeout = Duration::from_millis(50);

    let result = run_backup(job, CancellationToken::new()).await.expect("backup");
    assert_eq!(result.state, JobState::Completed);
    assert!(result.replication.is_none());
}

#[tokio::test]
async fn tampered_artifact_never_reaches_the_client() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::None, true).await;
    flip_inside_chunk(&artifact);

    let out = tmp.path().join("restored.sql");
    let mut job = restore_job(&artifact, &out, Some(key()));
    job.verify_checksum = false;
    let err = run_restore(job, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    assert!(!out.exists(), "client must not start when verification fails");
}

#[tokio::test]
async fn tampered_artifact_is_fatal_mid_stream() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::None, true).await;
    flip_inside_chunk(&artifact);

    let out = tmp.path().join("restored.sql");
    let mut job = restore_job(&artifact, &out, Some(key()));
    job.verify_checksum = false;
    job.verify_first = false;
    let err = run_restore(job, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
}

#[tokio::test]
async fn mid_stream_failure_aborts_every_read_stage() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::None, true).await;
    flip_inside_chunk(&artifact);

    let recorder = Arc::new(Recorder::default());
    let out = tmp.path().join("restored.sql");
    let mut job = restore_job(&artifact, &out, Some(key()));
    job.verify_checksum = false;
    job.verify_first = false;
    job.observer = Some(recorder.clone());
    let err = run_restore(job, CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![
            ("abort", Stage::Decrypt { chunk_size: 4096 }),
            ("abort", Stage::Source),
        ]
    );
}

/// Dump output that starts with bytes a compressed or sealed stream could
/// start with.
fn lookalike_dumps() -> Vec<Vec<u8>> {
    let mut header_like = vec![0x01u8];
    header_like.extend_from_slice(&[0x77; 12]);
    header_like.extend_from_slice(&4096u32.to_be_bytes());
    vec![
        [&[0x1f, 0x8b][..], &dump_sql()[..]].concat(),
        [&[0x28, 0xb5, 0x2f, 0xfd][..], &dump_sql()[..]].concat(),
        [&header_like[..], &dump_sql()[..]].concat(),
    ]
}

#[tokio::test]
async fn uncompressed_lookalike_dumps_restore_byte_for_byte() {
    for (i, payload) in lookalike_dumps().into_iter().enumerate() {
        for encrypted in [false, true] {
            for write_metadata in [false, true] {
                let tmp = TempDir::new().unwrap();
                let source = tmp.path().join("dump.bin");
                std::fs::write(&source, &payload).unwrap();
                let mut job = backup_job(tmp.path(), cat(&source), FakeProbe::default());
                job.compression = CompressionAlgorithm::None;
                job.write_metadata = write_metadata;
                if encrypted {
                    job.artifact = tmp.path().join("shop-1.sql.enc");
                } else {
                    job.key = None;
                    job.artifact = tmp.path().join("shop-1.sql");
                }
                let artifact = run_backup(job, CancellationToken::new())
                    .await
                    .expect("backup")
                    .artifact;

                let report = verify_artifact(&artifact, encrypted.then(key).as_ref()).unwrap();
                assert_eq!(report.compression, CompressionAlgorithm::None);
                assert_eq!(report.raw_bytes, payload.len() as u64);

                let out = tmp.path().join("restored.sql");
                let restored = run_restore(
                    restore_job(&artifact, &out, encrypted.then(key)),
                    CancellationToken::new(),
                )
                .await
                .expect("restore");
                assert_eq!(restored.compression, CompressionAlgorithm::None);
                assert_eq!(
                    std::fs::read(&out).unwrap(),
                    payload,
                    "payload {i} encrypted={encrypted} metadata={write_metadata}"
                );
            }
        }
    }
}

#[tokio::test]
async fn checksum_mismatch_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::Zstd, true).await;
    flip_inside_chunk(&artifact);

    let out = tmp.path().join("restored.sql");
    let err = run_restore(restore_job(&artifact, &out, Some(key())), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    assert!(!out.exists());
}

#[tokio::test]
async fn encrypted_artifact_needs_a_key() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::Zstd, true).await;

    let out = tmp.path().join("restored.sql");
    let err = run_restore(restore_job(&artifact, &out, None), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn wrong_key_fails_authentication() {
    let tmp = TempDir::new().unwrap();
    let artifact = backed_up(&tmp, CompressionAlgorithm::Gzip, true).await;

    let out = tmp.path().join("restored.sql");
    let wrong = Key::from_bytes([0x11u8; 32]);
    let err = run_restore(restore_job(&artifact, &out, Some(wrong)), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
}
