use async_trait::async_trait;
use breachgraph_common::{AuditEntry, RunId};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{AuditLease, AuditLog};
use crate::errors::AuditError;

/// File-backed audit log: one `<run_id>.jsonl` per run under `audit_dir`.
///
/// Each append takes an exclusive advisory lock on the run's file, checks the
/// sequence against the last line, writes and `sync_data`s before returning.
/// Processes sharing the directory therefore see a single strictly ordered
/// stream per run.
///
/// A final line without its newline, or one that does not parse, is the
/// remains of a write interrupted by a crash. Reads skip it and the next
/// append truncates it away.
///
/// Leases are advisory locks on `<run_id>.lock`; the OS drops them when the
/// holding process dies.
#[derive(Debug, Clone)]
pub struct JsonlAuditLog {
    audit_dir: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
        }
    }

    pub fn run_file(&self, run_id: &RunId) -> PathBuf {
        self.audit_dir.join(format!("{}.jsonl", run_id))
    }

    fn lock_file(&self, run_id: &RunId) -> PathBuf {
        self.audit_dir.join(format!("{}.lock", run_id))
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, AuditError>
    where
        F: FnOnce() -> Result<R, AuditError> + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(|e| {
            AuditError::Backend(anyhow::Error::new(e).context("audit log task panicked"))
        })?
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Parsed contents of a run file.
struct Trail {
    entries: Vec<AuditEntry>,
    /// Byte length of the intact prefix.
    intact_len: u64,
    torn: bool,
}

fn read_trail(mut file: &File, path: &Path) -> Result<Trail, AuditError> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(io_err(path))?;

    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (line, next, terminated) = match bytes[offset..].iter().position(|&b| b == b'\n') {
            Some(end) => (&bytes[offset..offset + end], offset + end + 1, true),
            None => (&bytes[offset..], bytes.len(), false),
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }
        let is_last = next >= bytes.len();
        match serde_json::from_slice::<AuditEntry>(line) {
            Ok(entry) if terminated => entries.push(entry),
            Err(e) if !is_last => return Err(e.into()),
            _ => {
                return Ok(Trail {
                    entries,
                    intact_len: offset as u64,
                    torn: true,
                });
            }
        }
        offset = next;
    }
    Ok(Trail {
        entries,
        intact_len: bytes.len() as u64,
        torn: false,
    })
}

fn append_locked(dir: &Path, path: &Path, entry: &AuditEntry) -> Result<(), AuditError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    FileExt::lock_exclusive(&file).map_err(io_err(path))?;

    let result = (|| {
        file.seek(SeekFrom::Start(0)).map_err(io_err(path))?;
        let trail = read_trail(&file, path)?;
        if trail.torn {
            warn!(
                run_id = %entry.run_id,
                path = %path.display(),
                intact_len = trail.intact_len,
                "Truncating partially written audit line"
            );
            file.set_len(trail.intact_len).map_err(io_err(path))?;
        }
        let last = trail.entries.last().map(|e| e.sequence).unwrap_or(0);
        if entry.sequence != last + 1 {
            return Err(AuditError::OutOfOrder {
                run_id: entry.run_id.clone(),
                sequence: entry.sequence,
                last,
            });
        }
        file.write_all(line.as_bytes()).map_err(io_err(path))?;
        file.sync_data().map_err(io_err(path))
    })();

    let unlocked = FileExt::unlock(&file).map_err(io_err(path));
    result.and(unlocked)
}

struct FileLease(File);

impl Drop for FileLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let dir = self.audit_dir.clone();
        let path = self.run_file(&entry.run_id);
        let entry = entry.clone();
        self.blocking(move || append_locked(&dir, &path, &entry))
            .await
    }

    async fn last_sequence(&self, run_id: &RunId) -> Result<u64, AuditError> {
        Ok(self.read(run_id).await?.last().map(|e| e.sequence).unwrap_or(0))
    }

    async fn read(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.run_file(run_id);
        self.blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let file = File::open(&path).map_err(io_err(&path))?;
            FileExt::lock_shared(&file).map_err(io_err(&path))?;
            let trail = read_trail(&file, &path);
            let unlocked = FileExt::unlock(&file).map_err(io_err(&path));
            let trail = trail?;
            unlocked?;
            Ok(trail.entries)
        })
        .await
    }

    async fn lease(&self, run_id: &RunId) -> Result<Option<AuditLease>, AuditError> {
        let dir = self.audit_dir.clone();
        let path = self.lock_file(run_id);
        self.blocking(move || {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(io_err(&path))?;
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => Ok(Some(AuditLease::new(FileLease(file)))),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    Ok(None)
                }
                Err(e) => Err(io_err(&path)(e)),
            }
        })
        .await
    }
}
