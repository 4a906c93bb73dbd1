//! Rebuilding entity state from the latest snapshot and the journal.
//!
//! Recovery runs once per entity instance, before any command is handled.
//! Commands arriving meanwhile are stashed and handled afterwards in arrival
//! order. The whole of loading and replaying is bounded by a deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::StreamExt;

use crate::behavior::EventSourcedBehavior;
use crate::error::{EntityError, RecoveryError};
use crate::identity::PersistenceId;
use crate::journal::JournalWriter;
use crate::snapshot::{SnapshotSelectionCriteria, SnapshotStore};
use crate::stash::StashBuffer;

/// Where an entity stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    /// Spawned, recovery not started yet.
    Idle,
    /// Waiting for the latest snapshot.
    LoadingSnapshot,
    /// Folding journal events written after the snapshot.
    ReplayingEvents,
    /// Recovered; commands are being handled.
    Running,
    /// Recovery failed; the entity never handled a command.
    Failed,
}

/// Outcome of a successful recovery.
#[derive(Debug)]
pub(crate) struct Recovered<S> {
    pub(crate) state: S,
    /// Baseline for the next write.
    pub(crate) last_sequence_nr: u64,
    /// Events folded on top of the snapshot.
    pub(crate) replayed: u64,
    pub(crate) snapshot_sequence_nr: Option<u64>,
}

/// Load the latest snapshot and fold every later journal event into it.
pub(crate) async fn recover<B: EventSourcedBehavior>(
    behavior: &B,
    writer: &JournalWriter<B::Event>,
    snapshot_store: &dyn SnapshotStore,
    persistence_id: &PersistenceId,
    phase: &watch::Sender<RecoveryPhase>,
) -> Result<Recovered<B::State>, RecoveryError> {
    phase.send_replace(RecoveryPhase::LoadingSnapshot);
    let snapshot = snapshot_store
        .load_latest(persistence_id, &SnapshotSelectionCriteria::latest())
        .await
        .map_err(RecoveryError::SnapshotLoad)?;

    let (mut state, snapshot_sequence_nr) = match snapshot {
        Some(snapshot) => {
            let sequence_nr = snapshot.metadata.sequence_nr;
            let state = serde_json::from_value(snapshot.state).map_err(|e| {
                RecoveryError::SnapshotDecode {
                    sequence_nr,
                    source: Arc::new(e),
                }
            })?;
            tracing::debug!(sequence_nr, "loaded snapshot");
            (state, Some(sequence_nr))
        }
        None => (behavior.empty_state(), None),
    };

    phase.send_replace(RecoveryPhase::ReplayingEvents);
    let journal = Arc::clone(writer.journal());
    let mut last = snapshot_sequence_nr.unwrap_or(0);
    let mut events = journal
        .read_from(persistence_id, last + 1)
        .await
        .map_err(RecoveryError::Replay)?;

    let mut replayed = 0u64;
    while let Some(record) = events.next().await {
        let record = record.map_err(RecoveryError::Replay)?;
        let sequence_nr = record.sequence_nr;
        if sequence_nr <= last {
            return Err(RecoveryError::OutOfOrder {
                previous: last,
                actual: sequence_nr,
            });
        }
        // Leading gaps are expected after events were deleted.
        if replayed > 0 && sequence_nr != last + 1 {
            tracing::warn!(previous = last, sequence_nr, "gap in replayed events");
        }
        let event = writer
            .decode(&record)
            .map_err(|source| RecoveryError::EventDecode {
                sequence_nr,
                source,
            })?;
        state = behavior.apply_event(state, &event);
        last = sequence_nr;
        replayed += 1;
    }

    let highest = journal
        .highest_sequence_nr(persistence_id)
        .await
        .map_err(RecoveryError::Replay)?;

    Ok(Recovered {
        state,
        last_sequence_nr: last.max(highest),
        replayed,
        snapshot_sequence_nr,
    })
}

/// Drive `recovery` to completion while stashing mailbox traffic.
///
/// Fails with [`RecoveryError::Timeout`] once `deadline` passes and with
/// [`EntityError::StashOverflow`] if more messages arrive than the stash
/// holds. `mailbox_closed` is set when every sender went away.
pub(crate) async fn stash_until<T, M, F>(
    recovery: F,
    rx: &mut mpsc::Receiver<M>,
    stash: &mut StashBuffer<M>,
    deadline: Instant,
    timeout: Duration,
    mailbox_closed: &mut bool,
) -> Result<T, EntityError>
where
    F: Future<Output = Result<T, RecoveryError>>,
{
    tokio::pin!(recovery);
    loop {
        tokio::select! {
            biased;
            result = &mut recovery => return result.map_err(EntityError::from),
            () = tokio::time::sleep_until(deadline) => {
                return Err(RecoveryError::Timeout(timeout).into());
            }
            msg = rx.recv(), if !*mailbox_closed => match msg {
                Some(msg) => {
                    if stash.push(msg).is_err() {
                        return Err(EntityError::StashOverflow {
                            capacity: stash.capacity(),
                        });
                    }
                    tracing::trace!(stashed = stash.len(), "stashed message during recovery");
                }
                None => *mailbox_closed = true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    use super::*;
    use crate::adapter::{EncodedEvent, JsonEventAdapter};
    use crate::behavior::test_fixtures::{Counter, CounterEvent, CounterState};
    use crate::clock::ManualClock;
    use crate::error::SnapshotStoreError;
    use crate::journal::{Journal, PersistentRecord};
    use crate::memory::{InMemoryJournal, InMemorySnapshotStore};
    use crate::snapshot::{SnapshotMetadata, StoredSnapshot};

    fn pid() -> PersistenceId {
        PersistenceId::new("r1").expect("valid id")
    }

    fn writer(journal: &InMemoryJournal) -> JournalWriter<CounterEvent> {
        JournalWriter::new(
            pid(),
            Arc::new(journal.clone()),
            Arc::new(JsonEventAdapter::new()),
            None,
            Arc::new(ManualClock::new(0)),
        )
    }

    fn raw_record(sequence_nr: u64, event_type: &str) -> PersistentRecord {
        PersistentRecord {
            persistence_id: pid(),
            sequence_nr,
            event_id: Uuid::new_v4(),
            event: EncodedEvent {
                event_type: event_type.into(),
                data: None,
            },
            tags: BTreeSet::new(),
            written_at: 0,
        }
    }

    #[tokio::test]
    async fn empty_journal_recovers_empty_state() {
        let journal = InMemoryJournal::new();
        let store = InMemorySnapshotStore::new();
        let (phase, _) = watch::channel(RecoveryPhase::Idle);

        let recovered = recover(&Counter::default(), &writer(&journal), &store, &pid(), &phase)
            .await
            .expect("recovery succeeds");
        assert_eq!(recovered.state, CounterState::default());
        assert_eq!(recovered.last_sequence_nr, 0);
        assert_eq!(recovered.replayed, 0);
        assert_eq!(recovered.snapshot_sequence_nr, None);
        assert_eq!(*phase.borrow(), RecoveryPhase::ReplayingEvents);
    }

    #[tokio::test]
    async fn replays_after_snapshot_only() {
        let journal = InMemoryJournal::new();
        let mut w = writer(&journal);
        w.write(&vec![CounterEvent::Incremented; 5]).await.expect("write");

        let store = InMemorySnapshotStore::new();
        let snapshot_state = CounterState {
            value: 3,
            history: vec![0, 1, 2],
        };
        store
            .save(StoredSnapshot {
                metadata: SnapshotMetadata {
                    persistence_id: pid(),
                    sequence_nr: 3,
                    timestamp: 0,
                },
                state: serde_json::to_value(&snapshot_state).expect("serialize"),
            })
            .await
            .expect("save");

        let counter = Counter::default();
        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let recovered = recover(&counter, &writer(&journal), &store, &pid(), &phase)
            .await
            .expect("recovery succeeds");

        assert_eq!(recovered.replayed, 2);
        assert_eq!(counter.applied(), 2);
        assert_eq!(recovered.snapshot_sequence_nr, Some(3));
        assert_eq!(recovered.last_sequence_nr, 5);
        assert_eq!(recovered.state.history, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn baseline_covers_deleted_tail() {
        let journal = InMemoryJournal::new();
        let mut w = writer(&journal);
        w.write(&vec![CounterEvent::Incremented; 4]).await.expect("write");
        journal.delete_up_to(&pid(), 4).await.expect("delete");

        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let recovered = recover(
            &Counter::default(),
            &writer(&journal),
            &InMemorySnapshotStore::new(),
            &pid(),
            &phase,
        )
        .await
        .expect("recovery succeeds");

        // Nothing is left to replay, but new writes must continue after 4.
        assert_eq!(recovered.replayed, 0);
        assert_eq!(recovered.last_sequence_nr, 4);
    }

    #[tokio::test]
    async fn out_of_order_replay_is_fatal() {
        let journal = InMemoryJournal::new();
        journal.insert_unchecked(raw_record(2, "Incremented"));
        journal.insert_unchecked(raw_record(1, "Incremented"));

        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let err = recover(
            &Counter::default(),
            &writer(&journal),
            &InMemorySnapshotStore::new(),
            &pid(),
            &phase,
        )
        .await
        .expect_err("must fail");
        assert!(matches!(
            err,
            RecoveryError::OutOfOrder {
                previous: 2,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn undecodable_event_is_fatal() {
        let journal = InMemoryJournal::new();
        journal.insert_unchecked(raw_record(1, "Exploded"));

        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let err = recover(
            &Counter::default(),
            &writer(&journal),
            &InMemorySnapshotStore::new(),
            &pid(),
            &phase,
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, RecoveryError::EventDecode { sequence_nr: 1, .. }));
    }

    #[tokio::test]
    async fn corrupt_snapshot_state_is_fatal() {
        let store = InMemorySnapshotStore::new();
        store
            .save(StoredSnapshot {
                metadata: SnapshotMetadata {
                    persistence_id: pid(),
                    sequence_nr: 1,
                    timestamp: 0,
                },
                state: serde_json::json!("not a counter"),
            })
            .await
            .expect("save");

        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let err = recover(
            &Counter::default(),
            &writer(&InMemoryJournal::new()),
            &store,
            &pid(),
            &phase,
        )
        .await
        .expect_err("must fail");
        assert!(matches!(err, RecoveryError::SnapshotDecode { sequence_nr: 1, .. }));
    }

    #[tokio::test]
    async fn snapshot_load_failure_is_fatal() {
        let store = InMemorySnapshotStore::new();
        store.fail_loads(true);
        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        let err = recover(
            &Counter::default(),
            &writer(&InMemoryJournal::new()),
            &store,
            &pid(),
            &phase,
        )
        .await
        .expect_err("must fail");
        assert!(matches!(
            err,
            RecoveryError::SnapshotLoad(SnapshotStoreError::Rejected(_))
        ));
        assert_eq!(*phase.borrow(), RecoveryPhase::LoadingSnapshot);
    }

    #[tokio::test]
    async fn stash_collects_messages_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut stash = StashBuffer::new(8);
        let mut closed = false;
        for i in 0..3 {
            tx.send(i).await.expect("send");
        }

        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, RecoveryError>("done")
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = stash_until(slow, &mut rx, &mut stash, deadline, Duration::from_secs(5), &mut closed)
            .await
            .expect("recovery completes");

        assert_eq!(out, "done");
        let stashed: Vec<i32> = std::iter::from_fn(|| stash.pop_front()).collect();
        assert_eq!(stashed, vec![0, 1, 2]);
        assert!(!closed);
    }

    #[tokio::test]
    async fn deadline_fails_recovery() {
        let (_tx, mut rx) = mpsc::channel::<u8>(1);
        let mut stash = StashBuffer::new(1);
        let mut closed = false;
        let never = std::future::pending::<Result<(), RecoveryError>>();
        let timeout = Duration::from_millis(20);

        let err = stash_until(never, &mut rx, &mut stash, Instant::now() + timeout, timeout, &mut closed)
            .await
            .expect_err("deadline must fire");
        assert!(matches!(
            err,
            EntityError::Recovery(RecoveryError::Timeout(t)) if t == timeout
        ));
    }

    #[tokio::test]
    async fn stash_overflow_is_fatal() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut stash = StashBuffer::new(2);
        let mut closed = false;
        for i in 0..3 {
            tx.send(i).await.expect("send");
        }
        let never = std::future::pending::<Result<(), RecoveryError>>();
        let timeout = Duration::from_secs(5);

        let err = stash_until(never, &mut rx, &mut stash, Instant::now() + timeout, timeout, &mut closed)
            .await
            .expect_err("overflow must fail");
        assert!(matches!(err, EntityError::StashOverflow { capacity: 2 }));
    }

    #[tokio::test]
    async fn closed_mailbox_is_reported() {
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        drop(tx);
        let mut stash = StashBuffer::new(1);
        let mut closed = false;
        let slow = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, RecoveryError>(())
        };
        let timeout = Duration::from_secs(5);
        stash_until(slow, &mut rx, &mut stash, Instant::now() + timeout, timeout, &mut closed)
            .await
            .expect("recovery completes");
        assert!(closed);
        assert!(stash.is_empty());
    }
}
