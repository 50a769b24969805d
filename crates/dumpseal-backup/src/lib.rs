//! dumpseal-backup: backup and restore orchestration.
//!
//! A backup spawns the engine's dump program, pumps its stdout through the
//! write pipeline into `<artifact>.partial`, then closes every stage, records
//! a checksum and renames the file into place. A restore optionally verifies
//! the artifact end to end, then pumps the read pipeline into the client's
//! stdin. Both run as async tasks: byte copying happens on blocking threads
//! and a [`CancellationToken`](tokio_util::sync::CancellationToken) kills the
//! child process on request.

use std::sync::Arc;

pub mod artifact;
pub mod backup;
pub mod checksum;
pub mod connection;
pub mod metadata;
pub mod probe;
pub mod process;
pub mod restore;
pub mod state;
pub mod verify;

pub use artifact::{
    artifact_file_name, format_from_name, incomplete_path, metadata_path, partial_path,
    ArtifactFormat,
};
pub use backup::{run_backup, BackupJob};
pub use checksum::{checksum_file, verify_checksum, Checksum};
pub use connection::{dump_command, query_command, resolve_password, restore_command, ProcessSpec};
pub use metadata::{read_sidecar, recorded_format, write_sidecar, BackupResult, RestoreResult};
pub use probe::{CliProbe, DatabaseProbe};
pub use restore::{run_restore, RestoreJob};
pub use state::{JobState, JobTracker};
pub use verify::{verify_artifact, VerifyReport};

/// Progress callback: bytes moved so far and a short phase label.
pub type ProgressFn = Arc<dyn Fn(u64, &str) + Send + Sync>;
