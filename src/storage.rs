//! On-disk journal and snapshot store.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio_stream::Stream;
use tokio_stream::wrappers::LinesStream;

use crate::error::{JournalError, SnapshotStoreError};
use crate::identity::PersistenceId;
use crate::journal::{EventStream, Journal, PersistentRecord};
use crate::snapshot::{SnapshotSelectionCriteria, SnapshotStore, StoredSnapshot};

const EVENTS_FILE: &str = "events.jsonl";
const META_FILE: &str = "meta.json";

/// Manages the on-disk directory layout shared by [`FileJournal`] and
/// [`FileSnapshotStore`].
///
/// ```text
/// <base_dir>/
///     journal/
///         <encoded persistence id>/
///             events.jsonl    -- one JSON array per appended batch
///             meta.json       -- highest sequence number, deletion mark
///     snapshots/
///         <encoded persistence id>/
///             snapshot-<sequence nr>.json
///     meta/
///         streams.jsonl       -- stream registry
/// ```
///
/// Persistence ids are percent-encoded into a single path segment, so any
/// id maps to exactly one directory.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/journal/<segment>`
    pub fn journal_dir(&self, persistence_id: &PersistenceId) -> PathBuf {
        self.base_dir
            .join("journal")
            .join(encode_segment(persistence_id.as_str()))
    }

    /// `<base_dir>/snapshots/<segment>`
    pub fn snapshot_dir(&self, persistence_id: &PersistenceId) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(encode_segment(persistence_id.as_str()))
    }

    /// `<base_dir>/meta`
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    /// Create the journal directory for `persistence_id` and record the id
    /// in the stream registry. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if directory creation or file I/O fails.
    pub fn ensure_stream(&self, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        let dir = self.journal_dir(persistence_id);
        fs::create_dir_all(&dir)?;

        let meta = self.meta_dir();
        fs::create_dir_all(&meta)?;
        let registry_path = meta.join("streams.jsonl");

        let already_registered = match fs::File::open(&registry_path) {
            Ok(file) => {
                let mut found = false;
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line)
                        && entry.get("id").and_then(|v| v.as_str()) == Some(persistence_id.as_str())
                    {
                        found = true;
                        break;
                    }
                }
                found
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        if !already_registered {
            let ts = SystemTime::UNIX_EPOCH
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let entry = serde_json::json!({
                "id": persistence_id.as_str(),
                "type": persistence_id.entity_type(),
                "ts": ts,
            });
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)?;
            writeln!(file, "{entry}")?;
        }

        Ok(dir)
    }

    /// Every persistence id with a journal directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason
    /// other than it not existing.
    pub fn list_streams(&self) -> io::Result<Vec<PersistenceId>> {
        let entries = match fs::read_dir(self.base_dir.join("journal")) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<PersistenceId> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                if !entry.file_type().ok()?.is_dir() {
                    return None;
                }
                let name = entry.file_name();
                let decoded = decode_segment(name.to_str()?)?;
                PersistenceId::new(decoded).ok()
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Percent-encode everything except ASCII alphanumerics, `-` and `_`.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Write `bytes` to `path` atomically via a temporary file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<io::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| E::from(io::Error::other(e)))?
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct StreamMeta {
    highest_sequence_nr: u64,
    deleted_to: u64,
}

fn read_meta(dir: &Path) -> Result<StreamMeta, JournalError> {
    match fs::read(dir.join(META_FILE)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| JournalError::Corrupt(format!("stream metadata: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StreamMeta::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_meta(dir: &Path, meta: &StreamMeta) -> Result<(), JournalError> {
    let bytes = serde_json::to_vec(meta).map_err(|e| JournalError::Corrupt(e.to_string()))?;
    write_atomic(&dir.join(META_FILE), &bytes)?;
    Ok(())
}

/// Parse the batch file, truncating a torn final line left by a crash
/// mid-append. Returns the batches in file order.
fn load_batches(dir: &Path) -> Result<Vec<Vec<PersistentRecord>>, JournalError> {
    let path = dir.join(EVENTS_FILE);
    let content = match fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut batches = Vec::new();
    let mut offset = 0;
    while offset < content.len() {
        let end = content[offset..].iter().position(|b| *b == b'\n');
        let (line, next) = match end {
            Some(end) => (&content[offset..offset + end], offset + end + 1),
            None => (&content[offset..], content.len()),
        };
        match serde_json::from_slice::<Vec<PersistentRecord>>(line) {
            Ok(batch) if end.is_some() => batches.push(batch),
            result => {
                if next < content.len() {
                    let reason = result.err().map(|e| e.to_string()).unwrap_or_default();
                    return Err(JournalError::Corrupt(format!(
                        "batch at byte {offset} of {}: {reason}",
                        path.display()
                    )));
                }
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    "discarding torn batch at end of journal"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(offset as u64)?;
                file.sync_all()?;
                break;
            }
        }
        offset = next;
    }
    Ok(batches)
}

/// Append one batch line and sync it. If either step fails the file is
/// cut back to its previous length, so no partial line stays behind.
fn append_line(path: &Path, line: &[u8]) -> Result<(), JournalError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    let written = file.write_all(line).and_then(|()| file.sync_data());
    if let Err(e) = written {
        if let Err(rollback) = file.set_len(len).and_then(|()| file.sync_data()) {
            tracing::warn!(
                path = %path.display(),
                error = %rollback,
                "could not roll back failed append"
            );
        }
        return Err(e.into());
    }
    Ok(())
}

fn scan_highest(dir: &Path) -> Result<u64, JournalError> {
    let meta = read_meta(dir)?;
    let last = load_batches(dir)?
        .last()
        .and_then(|batch| batch.last())
        .map_or(0, |r| r.sequence_nr);
    Ok(meta.highest_sequence_nr.max(last))
}

/// [`Journal`] storing each stream as a JSONL file of batches.
///
/// Every append writes its whole batch as a single line and syncs it, so a
/// batch is either fully present or, after a crash, a torn final line that
/// is discarded the next time the stream is opened.
#[derive(Debug, Clone)]
pub struct FileJournal {
    layout: StreamLayout,
    highest: Arc<Mutex<HashMap<PersistenceId, u64>>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileJournal {
    /// Create a journal rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StreamLayout::new(base_dir))
    }

    /// Create a journal on an existing layout.
    pub fn with_layout(layout: StreamLayout) -> Self {
        Self {
            layout,
            highest: Arc::new(Mutex::new(HashMap::new())),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The directory layout in use.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn cached_highest(&self, persistence_id: &PersistenceId) -> Option<u64> {
        self.highest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(persistence_id)
            .copied()
    }

    fn cache_highest(&self, persistence_id: &PersistenceId, highest: u64) {
        self.highest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(persistence_id.clone(), highest);
    }

    /// Drop the cached position so the next access rescans the file and
    /// repairs whatever a failed write left behind.
    fn forget_highest(&self, persistence_id: &PersistenceId) {
        self.highest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(persistence_id);
    }

    async fn current_highest(&self, persistence_id: &PersistenceId) -> Result<u64, JournalError> {
        if let Some(highest) = self.cached_highest(persistence_id) {
            return Ok(highest);
        }
        let dir = self.layout.journal_dir(persistence_id);
        let highest = blocking(move || scan_highest(&dir)).await?;
        self.cache_highest(persistence_id, highest);
        Ok(highest)
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        records: Vec<PersistentRecord>,
    ) -> Result<Vec<u64>, JournalError> {
        let _guard = self.write_lock.lock().await;
        let highest = self.current_highest(persistence_id).await?;

        let mut expected = highest + 1;
        for record in &records {
            if record.sequence_nr != expected {
                return Err(JournalError::SequenceConflict {
                    expected,
                    actual: record.sequence_nr,
                });
            }
            expected += 1;
        }
        let committed: Vec<u64> = records.iter().map(|r| r.sequence_nr).collect();
        let Some(&last) = committed.last() else {
            return Ok(committed);
        };

        let mut line =
            serde_json::to_vec(&records).map_err(|e| JournalError::Corrupt(e.to_string()))?;
        line.push(b'\n');

        let layout = self.layout.clone();
        let id = persistence_id.clone();
        let written = blocking(move || -> Result<(), JournalError> {
            let dir = layout.ensure_stream(&id)?;
            append_line(&dir.join(EVENTS_FILE), &line)
        })
        .await;
        if let Err(e) = written {
            self.forget_highest(persistence_id);
            return Err(e);
        }

        self.cache_highest(persistence_id, last);
        Ok(committed)
    }

    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<EventStream, JournalError> {
        // Repairs a torn tail before streaming.
        self.current_highest(persistence_id).await?;

        let dir = self.layout.journal_dir(persistence_id);
        let meta_dir = dir.clone();
        let meta = blocking(move || read_meta(&meta_dir)).await?;
        let from = from_sequence_nr.max(meta.deleted_to + 1);

        let file = match tokio::fs::File::open(dir.join(EVENTS_FILE)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::pin(tokio_stream::empty::<Result<PersistentRecord, JournalError>>()));
            }
            Err(e) => return Err(e.into()),
        };
        let lines = LinesStream::new(tokio::io::BufReader::new(file).lines());
        Ok(Box::pin(BatchStream {
            lines,
            buffered: VecDeque::new(),
            from,
            done: false,
        }))
    }

    async fn delete_up_to(
        &self,
        persistence_id: &PersistenceId,
        to_sequence_nr: u64,
    ) -> Result<(), JournalError> {
        let _guard = self.write_lock.lock().await;
        let highest = self.current_highest(persistence_id).await?;

        let dir = self.layout.journal_dir(persistence_id);
        blocking(move || -> Result<(), JournalError> {
            if !dir.exists() {
                return Ok(());
            }
            let mut meta = read_meta(&dir)?;
            meta.highest_sequence_nr = meta.highest_sequence_nr.max(highest);
            meta.deleted_to = meta.deleted_to.max(to_sequence_nr.min(highest));
            write_meta(&dir, &meta)?;

            let mut content = Vec::new();
            for batch in load_batches(&dir)? {
                let kept: Vec<PersistentRecord> = batch
                    .into_iter()
                    .filter(|r| r.sequence_nr > meta.deleted_to)
                    .collect();
                if kept.is_empty() {
                    continue;
                }
                serde_json::to_writer(&mut content, &kept)
                    .map_err(|e| JournalError::Corrupt(e.to_string()))?;
                content.push(b'\n');
            }
            write_atomic(&dir.join(EVENTS_FILE), &content)?;
            Ok(())
        })
        .await
    }

    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> Result<u64, JournalError> {
        let _guard = self.write_lock.lock().await;
        self.current_highest(persistence_id).await
    }
}

/// Lazily parses batch lines and yields their records one by one.
struct BatchStream {
    lines: LinesStream<tokio::io::BufReader<tokio::fs::File>>,
    buffered: VecDeque<PersistentRecord>,
    from: u64,
    done: bool,
}

impl Stream for BatchStream {
    type Item = Result<PersistentRecord, JournalError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(record) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(record)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.lines).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(Some(Ok(line))) => {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Vec<PersistentRecord>>(&line) {
                        Ok(batch) => {
                            let from = this.from;
                            this.buffered
                                .extend(batch.into_iter().filter(|r| r.sequence_nr >= from));
                        }
                        Err(e) => {
                            this.done = true;
                            return Poll::Ready(Some(Err(JournalError::Corrupt(e.to_string()))));
                        }
                    }
                }
            }
        }
    }
}

/// [`SnapshotStore`] keeping one JSON file per snapshot.
///
/// Saves go through a temporary file and a rename, so a crash never leaves
/// a partially written snapshot behind. Unreadable snapshot files are
/// skipped with a warning when loading, falling back to older snapshots.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StreamLayout::new(base_dir))
    }

    /// Create a store on an existing layout.
    pub fn with_layout(layout: StreamLayout) -> Self {
        Self { layout }
    }
}

fn snapshot_file_name(sequence_nr: u64) -> String {
    format!("snapshot-{sequence_nr:020}.json")
}

/// Snapshot files in `dir` with their sequence numbers, newest first.
fn list_snapshot_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files: Vec<(u64, PathBuf)> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name();
            let seq = name
                .to_str()?
                .strip_prefix("snapshot-")?
                .strip_suffix(".json")?
                .parse()
                .ok()?;
            Some((seq, entry.path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(files)
}

fn read_snapshot(path: &Path) -> Option<StoredSnapshot> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable snapshot, skipping");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt snapshot, skipping");
            None
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: StoredSnapshot) -> Result<(), SnapshotStoreError> {
        let dir = self.layout.snapshot_dir(&snapshot.metadata.persistence_id);
        blocking(move || -> Result<(), SnapshotStoreError> {
            fs::create_dir_all(&dir)?;
            let bytes = serde_json::to_vec(&snapshot)
                .map_err(|e| SnapshotStoreError::Corrupt(e.to_string()))?;
            write_atomic(&dir.join(snapshot_file_name(snapshot.metadata.sequence_nr)), &bytes)?;
            Ok(())
        })
        .await
    }

    async fn load_latest(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<Option<StoredSnapshot>, SnapshotStoreError> {
        let dir = self.layout.snapshot_dir(persistence_id);
        let criteria = *criteria;
        blocking(move || -> Result<Option<StoredSnapshot>, SnapshotStoreError> {
            for (seq, path) in list_snapshot_files(&dir)? {
                if seq < criteria.min_sequence_nr || seq > criteria.max_sequence_nr {
                    continue;
                }
                if let Some(snapshot) = read_snapshot(&path)
                    && criteria.matches_metadata(&snapshot.metadata)
                {
                    return Ok(Some(snapshot));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn delete(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotStoreError> {
        let dir = self.layout.snapshot_dir(persistence_id);
        let criteria = *criteria;
        blocking(move || -> Result<(), SnapshotStoreError> {
            for (seq, path) in list_snapshot_files(&dir)? {
                if seq < criteria.min_sequence_nr || seq > criteria.max_sequence_nr {
                    continue;
                }
                // Unreadable files inside the range go as well.
                let selected = read_snapshot(&path)
                    .is_none_or(|snapshot| criteria.matches_metadata(&snapshot.metadata));
                if selected {
                    fs::remove_file(&path)?;
                }
            }
            Ok(())
        })
        .await
    }
}
