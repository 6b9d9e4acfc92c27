use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use saga_core::{LogRecord, SagaId};
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::Result;
use crate::error::{LogError, LogWriteError};
use crate::traits::StepLog;

const ACTIVE_DIR: &str = "active";
const ARCHIVE_DIR: &str = "archive";
const LOG_EXTENSION: &str = "jsonl";

/// Step log backed by one JSON-lines file per saga.
///
/// Layout under the root directory:
/// ```text
/// active/<saga-id>.jsonl
/// archive/<saga-id>.jsonl
/// ```
/// Every append is flushed with `sync_data` before it is acknowledged, and
/// directory entries are synced when a file is created or moved.
#[derive(Debug)]
pub struct FileStepLog {
    root: PathBuf,
    /// Per-saga locks of sagas still in `active/`.
    locks: Mutex<HashMap<SagaId, Arc<Mutex<()>>>>,
}

impl FileStepLog {
    /// Opens (creating if needed) a log rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `LogError::Init` if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join(ACTIVE_DIR), root.join(ARCHIVE_DIR)] {
            fs::create_dir_all(&dir).map_err(|source| LogError::Init { path: dir, source })?;
        }
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_path(&self, saga_id: SagaId) -> PathBuf {
        self.root
            .join(ACTIVE_DIR)
            .join(format!("{saga_id}.{LOG_EXTENSION}"))
    }

    fn archive_path(&self, saga_id: SagaId) -> PathBuf {
        self.root
            .join(ARCHIVE_DIR)
            .join(format!("{saga_id}.{LOG_EXTENSION}"))
    }

    fn lock_for(&self, saga_id: SagaId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(saga_id).or_default())
    }

    /// Archived sagas take no more writes, so their lock can go.
    fn release_lock(&self, saga_id: SagaId) {
        self.locks.lock().remove(&saga_id);
    }
}

fn existing(candidates: [PathBuf; 2]) -> Option<PathBuf> {
    candidates.into_iter().find(|path| path.exists())
}

fn read_failed(path: PathBuf, join: &JoinError) -> LogError {
    LogError::Read {
        path,
        source: io::Error::other(join.to_string()),
    }
}

#[async_trait]
impl StepLog for FileStepLog {
    async fn append(&self, record: &LogRecord) -> std::result::Result<(), LogWriteError> {
        let saga_id = record.saga_id();
        let mut line = serde_json::to_string(record)
            .map_err(|source| LogWriteError::Encode { saga_id, source })?;
        line.push('\n');

        let path = self.active_path(saga_id);
        let archived = self.archive_path(saga_id);
        let lock = self.lock_for(saga_id);

        let outcome = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            if archived.exists() {
                return Err(LogWriteError::Archived(saga_id));
            }
            append_line(&path, line.as_bytes())
                .map_err(|source| LogWriteError::Unavailable { saga_id, source })
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(join) => Err(LogWriteError::Unavailable {
                saga_id,
                source: io::Error::other(join.to_string()),
            }),
        }
    }

    async fn read_history(&self, saga_id: SagaId) -> Result<Vec<LogRecord>> {
        let archive_path = self.archive_path(saga_id);
        let candidates = [self.active_path(saga_id), archive_path.clone()];
        let lock = self.lock_for(saga_id);

        let (path, records) = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let Some(path) = existing(candidates) else {
                return Err(LogError::UnknownSaga(saga_id));
            };
            let records = read_records(&path)?;
            Ok((path, records))
        })
        .await
        .map_err(|join| read_failed(self.active_path(saga_id), &join))??;

        if path == archive_path {
            self.release_lock(saga_id);
        }
        Ok(records)
    }

    async fn active_sagas(&self) -> Result<Vec<SagaId>> {
        let dir = self.root.join(ACTIVE_DIR);
        let listed = dir.clone();
        tokio::task::spawn_blocking(move || list_sagas(&listed))
            .await
            .map_err(|join| read_failed(dir, &join))?
    }

    async fn archive(&self, saga_id: SagaId) -> Result<()> {
        let from = self.active_path(saga_id);
        let to = self.archive_path(saga_id);
        let lock = self.lock_for(saga_id);

        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            if to.exists() {
                return Ok(());
            }
            if !from.exists() {
                return Err(LogError::UnknownSaga(saga_id));
            }
            fs::rename(&from, &to)
                .and_then(|()| sync_parent(&to))
                .and_then(|()| sync_parent(&from))
                .map_err(|source| LogWriteError::Unavailable { saga_id, source })?;
            debug!(saga_id = %saga_id, path = %to.display(), "archived saga log");
            Ok(())
        })
        .await
        .map_err(|join| {
            LogError::from(LogWriteError::Unavailable {
                saga_id,
                source: io::Error::other(join.to_string()),
            })
        })??;

        self.release_lock(saga_id);
        Ok(())
    }

    async fn is_archived(&self, saga_id: SagaId) -> Result<bool> {
        let archived = self.archive_path(saga_id);
        let active = self.active_path(saga_id);
        tokio::task::spawn_blocking(move || {
            if archived.exists() {
                Ok(true)
            } else if active.exists() {
                Ok(false)
            } else {
                Err(LogError::UnknownSaga(saga_id))
            }
        })
        .await
        .map_err(|join| read_failed(self.archive_path(saga_id), &join))?
    }
}

fn list_sagas(dir: &Path) -> Result<Vec<SagaId>> {
    let entries = fs::read_dir(dir).map_err(|source| LogError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LogError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()).map(str::parse) {
            Some(Ok(id)) => ids.push(id),
            _ => warn!(path = %path.display(), "ignoring log file with unexpected name"),
        }
    }
    ids.sort();
    Ok(ids)
}

fn append_line(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let created = !path.exists();
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let end = drop_torn_tail(&mut file, path)?;
    file.seek(SeekFrom::Start(end))?;
    file.write_all(bytes)?;
    file.sync_data()?;
    if created {
        sync_parent(path)?;
    }
    Ok(())
}

/// Cuts a partial last record left by an interrupted write, so the next
/// record starts on a line of its own. Returns the resulting file length.
fn drop_torn_tail(file: &mut File, path: &Path) -> io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0_u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |newline| newline as u64 + 1);
    file.set_len(keep)?;
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "truncated torn trailing log record"
    );
    Ok(keep)
}

/// Makes a created or renamed entry in `path`'s directory durable.
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => sync_dir(dir),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Parses a history file.
///
/// A final line without a trailing newline is a write torn by a crash and is
/// skipped, even when it stops inside a multi-byte character. Any other
/// unparseable line is corruption.
fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let content = fs::read(path).map_err(|source| LogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let complete = content.last().is_none_or(|&b| b == b'\n');
    let lines: Vec<&[u8]> = content.split(|&b| b == b'\n').collect();

    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(record) => records.push(record),
            Err(_) if !complete && index + 1 == lines.len() => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    "skipping torn trailing log record"
                );
            }
            Err(source) => {
                return Err(LogError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                });
            }
        }
    }
    Ok(records)
}
