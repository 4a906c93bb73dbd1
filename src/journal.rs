//! Journal contract and the per-entity writer that assigns sequence numbers.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use uuid::Uuid;

use crate::adapter::{EncodedEvent, EventAdapter, Tagger};
use crate::clock::Clock;
use crate::error::{AdapterError, EntityError, JournalError};
use crate::identity::PersistenceId;

/// One event as stored in a [`Journal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRecord {
    /// Stream the record belongs to.
    pub persistence_id: PersistenceId,
    /// Position in the stream, starting at 1 and without gaps.
    pub sequence_nr: u64,
    /// Unique id generated when the event was written.
    pub event_id: Uuid,
    /// Adapter output for the domain event.
    #[serde(flatten)]
    pub event: EncodedEvent,
    /// Routing tags computed by the entity's tagger.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Write time in Unix epoch milliseconds.
    pub written_at: u64,
}

/// Lazily produced replay stream, ordered by ascending sequence number.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<PersistentRecord, JournalError>> + Send>>;

/// Append-only, per-identity durable event log.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append a batch atomically.
    ///
    /// The batch carries consecutive sequence numbers continuing the
    /// stream. Either every record becomes durable or none does. On success
    /// the sequence numbers actually committed are returned, in order.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SequenceConflict`] if the batch does not
    /// continue the stream, or any backend failure.
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        records: Vec<PersistentRecord>,
    ) -> Result<Vec<u64>, JournalError>;

    /// Stream every record with a sequence number of at least
    /// `from_sequence_nr`, oldest first.
    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<EventStream, JournalError>;

    /// Delete records up to and including `to_sequence_nr`.
    ///
    /// The highest sequence number of the stream is unaffected, so new
    /// appends continue after it.
    async fn delete_up_to(
        &self,
        persistence_id: &PersistenceId,
        to_sequence_nr: u64,
    ) -> Result<(), JournalError>;

    /// Highest sequence number ever written to the stream, 0 if none.
    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> Result<u64, JournalError>;
}

/// Owns the journal side of one entity: numbering, encoding and tagging.
pub(crate) struct JournalWriter<E> {
    persistence_id: PersistenceId,
    journal: Arc<dyn Journal>,
    adapter: Arc<dyn EventAdapter<E>>,
    tagger: Option<Tagger<E>>,
    clock: Arc<dyn Clock>,
    last_sequence_nr: u64,
}

impl<E: 'static> JournalWriter<E> {
    pub(crate) fn new(
        persistence_id: PersistenceId,
        journal: Arc<dyn Journal>,
        adapter: Arc<dyn EventAdapter<E>>,
        tagger: Option<Tagger<E>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence_id,
            journal,
            adapter,
            tagger,
            clock,
            last_sequence_nr: 0,
        }
    }

    pub(crate) fn last_sequence_nr(&self) -> u64 {
        self.last_sequence_nr
    }

    pub(crate) fn set_last_sequence_nr(&mut self, sequence_nr: u64) {
        self.last_sequence_nr = sequence_nr;
    }

    pub(crate) fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Decode a replayed record with the entity's adapter.
    pub(crate) fn decode(&self, record: &PersistentRecord) -> Result<E, AdapterError> {
        self.adapter.from_journal(&record.event)
    }

    /// Append `events` as one batch and return the sequence numbers they
    /// were committed at.
    ///
    /// The writer's position only advances after the journal acknowledged
    /// exactly the numbers it assigned. An empty batch is a no-op that
    /// never reaches the journal.
    pub(crate) async fn write(&mut self, events: &[E]) -> Result<RangeInclusive<u64>, EntityError> {
        let first = self.last_sequence_nr + 1;
        let count = events.len() as u64;
        if count == 0 {
            return Ok(first..=self.last_sequence_nr);
        }
        let last = self.last_sequence_nr + count;
        let written_at = self.clock.now_millis();

        let mut records = Vec::with_capacity(events.len());
        for (sequence_nr, event) in (first..=last).zip(events) {
            let encoded = self.adapter.to_journal(event)?;
            let tags = self.tagger.as_ref().map(|tag| tag(event)).unwrap_or_default();
            records.push(PersistentRecord {
                persistence_id: self.persistence_id.clone(),
                sequence_nr,
                event_id: Uuid::new_v4(),
                event: encoded,
                tags,
                written_at,
            });
        }

        let acknowledged = self
            .journal
            .append(&self.persistence_id, records)
            .await
            .map_err(|source| EntityError::Persistence {
                from_sequence_nr: first,
                to_sequence_nr: last,
                source,
            })?;

        if !acknowledged.iter().copied().eq(first..=last) {
            return Err(EntityError::AcknowledgementMismatch {
                expected: (first..=last).collect(),
                acknowledged,
            });
        }

        self.last_sequence_nr = last;
        tracing::debug!(from = first, to = last, "events persisted");
        Ok(first..=last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::adapter::JsonEventAdapter;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryJournal;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum Ev {
        Added { amount: i64 },
        Reset,
    }

    fn pid() -> PersistenceId {
        PersistenceId::new("w1").expect("valid id")
    }

    fn writer(journal: Arc<dyn Journal>) -> JournalWriter<Ev> {
        JournalWriter::new(
            pid(),
            journal,
            Arc::new(JsonEventAdapter::new()),
            None,
            Arc::new(ManualClock::new(42)),
        )
    }

    #[tokio::test]
    async fn assigns_consecutive_sequence_numbers() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut w = writer(journal.clone());

        let first = w.write(&[Ev::Added { amount: 1 }]).await.expect("write");
        assert_eq!(first, 1..=1);
        let second = w
            .write(&[Ev::Added { amount: 2 }, Ev::Reset, Ev::Added { amount: 3 }])
            .await
            .expect("write");
        assert_eq!(second, 2..=4);
        assert_eq!(w.last_sequence_nr(), 4);

        let stored = journal.records(&pid());
        let seqs: Vec<u64> = stored.iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(stored[2].event.event_type, "Reset");
        assert!(stored.iter().all(|r| r.written_at == 42));
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_journal() {
        let journal = Arc::new(InMemoryJournal::new());
        journal.fail_appends(true);
        let mut w = writer(journal.clone());

        let range = w.write(&[]).await.expect("empty write is a no-op");
        assert!(range.is_empty());
        assert_eq!(w.last_sequence_nr(), 0);
    }

    #[tokio::test]
    async fn failed_append_keeps_position() {
        let journal = Arc::new(InMemoryJournal::new());
        let mut w = writer(journal.clone());
        w.write(&[Ev::Reset]).await.expect("write");

        journal.fail_appends(true);
        let err = w
            .write(&[Ev::Reset, Ev::Reset])
            .await
            .expect_err("append must fail");
        match err {
            EntityError::Persistence {
                from_sequence_nr,
                to_sequence_nr,
                ..
            } => assert_eq!((from_sequence_nr, to_sequence_nr), (2, 3)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(w.last_sequence_nr(), 1);
        assert_eq!(journal.records(&pid()).len(), 1);
    }

    /// Journal that acknowledges whatever it was told to.
    struct LyingJournal {
        ack: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Journal for LyingJournal {
        async fn append(
            &self,
            _persistence_id: &PersistenceId,
            _records: Vec<PersistentRecord>,
        ) -> Result<Vec<u64>, JournalError> {
            Ok(self.ack.lock().expect("lock").clone())
        }

        async fn read_from(
            &self,
            _persistence_id: &PersistenceId,
            _from_sequence_nr: u64,
        ) -> Result<EventStream, JournalError> {
            Ok(Box::pin(tokio_stream::empty::<Result<PersistentRecord, JournalError>>()))
        }

        async fn delete_up_to(
            &self,
            _persistence_id: &PersistenceId,
            _to_sequence_nr: u64,
        ) -> Result<(), JournalError> {
            Ok(())
        }

        async fn highest_sequence_nr(
            &self,
            _persistence_id: &PersistenceId,
        ) -> Result<u64, JournalError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn mismatched_acknowledgement_is_fatal() {
        let journal = Arc::new(LyingJournal {
            ack: Mutex::new(vec![1, 3]),
        });
        let mut w = writer(journal);
        let err = w
            .write(&[Ev::Reset, Ev::Reset])
            .await
            .expect_err("ack mismatch must fail");
        assert!(matches!(
            err,
            EntityError::AcknowledgementMismatch { ref expected, ref acknowledged }
                if expected == &[1, 2] && acknowledged == &[1, 3]
        ));
        assert_eq!(w.last_sequence_nr(), 0);
    }

    #[test]
    fn record_json_flattens_event_and_omits_empty_tags() {
        let record = PersistentRecord {
            persistence_id: pid(),
            sequence_nr: 7,
            event_id: Uuid::nil(),
            event: EncodedEvent {
                event_type: "Reset".into(),
                data: None,
            },
            tags: BTreeSet::new(),
            written_at: 0,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["event_type"], "Reset");
        assert!(json.get("tags").is_none());

        let back: PersistentRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn record_json_keeps_null_payload() {
        let json = serde_json::json!({
            "persistence_id": "acct-1",
            "sequence_nr": 1,
            "event_id": Uuid::nil(),
            "event_type": "Closed",
            "data": null,
            "written_at": 0,
        });
        let record: PersistentRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(record.event.data, Some(serde_json::Value::Null));

        let again = serde_json::to_value(&record).expect("serialize");
        assert_eq!(again.get("data"), Some(&serde_json::Value::Null));
    }

    #[tokio::test]
    async fn tagger_output_is_stored() {
        let journal = Arc::new(InMemoryJournal::new());
        let tagger: Tagger<Ev> = Arc::new(|e: &Ev| match e {
            Ev::Reset => BTreeSet::from(["reset".to_string()]),
            Ev::Added { .. } => BTreeSet::new(),
        });
        let mut w = JournalWriter::new(
            pid(),
            journal.clone(),
            Arc::new(JsonEventAdapter::new()),
            Some(tagger),
            Arc::new(ManualClock::new(0)),
        );
        w.write(&[Ev::Added { amount: 1 }, Ev::Reset]).await.expect("write");

        let stored = journal.records(&pid());
        assert!(stored[0].tags.is_empty());
        assert!(stored[1].tags.contains("reset"));
    }
}
