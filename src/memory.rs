//! In-memory journal and snapshot store.
//!
//! Both backends keep everything in process memory and lose it on drop.
//! They are meant for tests and demos, and carry switches to inject
//! failures and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{JournalError, SnapshotStoreError};
use crate::identity::PersistenceId;
use crate::journal::{EventStream, Journal, PersistentRecord};
use crate::snapshot::{SnapshotSelectionCriteria, SnapshotStore, StoredSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn delay(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct Stream {
    records: Vec<PersistentRecord>,
    highest: u64,
}

#[derive(Debug, Default)]
struct JournalInner {
    streams: Mutex<HashMap<PersistenceId, Stream>>,
    fail_appends: AtomicBool,
    fail_reads: AtomicBool,
    fail_deletes: AtomicBool,
    read_delay_ms: AtomicU64,
    append_calls: AtomicU64,
}

/// [`Journal`] held in process memory.
///
/// Cheap to clone; clones share the same streams and switches.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<JournalInner>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail with [`JournalError::Rejected`].
    pub fn fail_appends(&self, fail: bool) {
        self.inner.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with [`JournalError::Rejected`].
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent delete fail with [`JournalError::Rejected`].
    pub fn fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `read_from` call.
    pub fn set_read_delay(&self, delay: Duration) {
        self.inner
            .read_delay_ms
            .store(duration_millis(delay), Ordering::SeqCst);
    }

    /// Snapshot of the records currently stored for `persistence_id`.
    pub fn records(&self, persistence_id: &PersistenceId) -> Vec<PersistentRecord> {
        lock(&self.inner.streams)
            .get(persistence_id)
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    /// Number of append calls that reached the journal, failed ones included.
    pub fn append_calls(&self) -> u64 {
        self.inner.append_calls.load(Ordering::SeqCst)
    }

    /// Store a record without any sequence checks, to simulate a damaged
    /// or foreign-written stream.
    pub fn insert_unchecked(&self, record: PersistentRecord) {
        let mut streams = lock(&self.inner.streams);
        let stream = streams.entry(record.persistence_id.clone()).or_default();
        stream.highest = stream.highest.max(record.sequence_nr);
        stream.records.push(record);
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        records: Vec<PersistentRecord>,
    ) -> Result<Vec<u64>, JournalError> {
        self.inner.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_appends.load(Ordering::SeqCst) {
            return Err(JournalError::Rejected("appends disabled".into()));
        }

        let mut streams = lock(&self.inner.streams);
        let stream = streams.entry(persistence_id.clone()).or_default();

        // Validate the whole batch before storing any of it.
        let mut expected = stream.highest + 1;
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
        if let Some(&last) = committed.last() {
            stream.highest = last;
        }
        stream.records.extend(records);
        Ok(committed)
    }

    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<EventStream, JournalError> {
        delay(&self.inner.read_delay_ms).await;
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(JournalError::Rejected("reads disabled".into()));
        }

        let records: Vec<Result<PersistentRecord, JournalError>> = lock(&self.inner.streams)
            .get(persistence_id)
            .map(|s| {
                s.records
                    .iter()
                    .filter(|r| r.sequence_nr >= from_sequence_nr)
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(records)))
    }

    async fn delete_up_to(
        &self,
        persistence_id: &PersistenceId,
        to_sequence_nr: u64,
    ) -> Result<(), JournalError> {
        if self.inner.fail_deletes.load(Ordering::SeqCst) {
            return Err(JournalError::Rejected("deletes disabled".into()));
        }
        if let Some(stream) = lock(&self.inner.streams).get_mut(persistence_id) {
            stream.records.retain(|r| r.sequence_nr > to_sequence_nr);
        }
        Ok(())
    }

    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> Result<u64, JournalError> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(JournalError::Rejected("reads disabled".into()));
        }
        Ok(lock(&self.inner.streams)
            .get(persistence_id)
            .map_or(0, |s| s.highest))
    }
}

#[derive(Debug, Default)]
struct SnapshotInner {
    snapshots: Mutex<HashMap<PersistenceId, Vec<StoredSnapshot>>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    fail_deletes: AtomicBool,
    load_delay_ms: AtomicU64,
    save_delay_ms: AtomicU64,
    save_calls: AtomicU64,
}

/// [`SnapshotStore`] held in process memory.
///
/// Cheap to clone; clones share the same snapshots and switches.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    inner: Arc<SnapshotInner>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail with [`SnapshotStoreError::Rejected`].
    pub fn fail_saves(&self, fail: bool) {
        self.inner.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent load fail with [`SnapshotStoreError::Rejected`].
    pub fn fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent delete fail with [`SnapshotStoreError::Rejected`].
    pub fn fail_deletes(&self, fail: bool) {
        self.inner.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent load.
    pub fn set_load_delay(&self, delay: Duration) {
        self.inner
            .load_delay_ms
            .store(duration_millis(delay), Ordering::SeqCst);
    }

    /// Delay every subsequent save.
    pub fn set_save_delay(&self, delay: Duration) {
        self.inner
            .save_delay_ms
            .store(duration_millis(delay), Ordering::SeqCst);
    }

    /// Stored snapshots of `persistence_id`, oldest first.
    pub fn snapshots(&self, persistence_id: &PersistenceId) -> Vec<StoredSnapshot> {
        lock(&self.inner.snapshots)
            .get(persistence_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of save calls, failed ones included.
    pub fn save_calls(&self) -> u64 {
        self.inner.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: StoredSnapshot) -> Result<(), SnapshotStoreError> {
        self.inner.save_calls.fetch_add(1, Ordering::SeqCst);
        delay(&self.inner.save_delay_ms).await;
        if self.inner.fail_saves.load(Ordering::SeqCst) {
            return Err(SnapshotStoreError::Rejected("saves disabled".into()));
        }

        let mut all = lock(&self.inner.snapshots);
        let list = all
            .entry(snapshot.metadata.persistence_id.clone())
            .or_default();
        list.retain(|s| s.metadata.sequence_nr != snapshot.metadata.sequence_nr);
        list.push(snapshot);
        list.sort_by_key(|s| s.metadata.sequence_nr);
        Ok(())
    }

    async fn load_latest(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<Option<StoredSnapshot>, SnapshotStoreError> {
        delay(&self.inner.load_delay_ms).await;
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(SnapshotStoreError::Rejected("loads disabled".into()));
        }
        Ok(lock(&self.inner.snapshots).get(persistence_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|s| criteria.matches_metadata(&s.metadata))
                .cloned()
        }))
    }

    async fn delete(
        &self,
        persistence_id: &PersistenceId,
        criteria: &SnapshotSelectionCriteria,
    ) -> Result<(), SnapshotStoreError> {
        if self.inner.fail_deletes.load(Ordering::SeqCst) {
            return Err(SnapshotStoreError::Rejected("deletes disabled".into()));
        }
        if let Some(list) = lock(&self.inner.snapshots).get_mut(persistence_id) {
            list.retain(|s| !criteria.matches_metadata(&s.metadata));
        }
        Ok(())
    }
}
