//! The per-identity task that owns an entity's state and processes commands.
//!
//! Each entity runs as one Tokio task. It first recovers its state while
//! stashing incoming commands, then handles one message at a time from a
//! bounded `mpsc` mailbox. Snapshot writes and retention deletes run as
//! background tasks in a [`JoinSet`]; their completions are observed by the
//! same task between commands, so state is never shared.
//!
//! Public API: [`EntityRef`] (cloneable async handle) and [`Termination`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use crate::behavior::EventSourcedBehavior;
use crate::clock::Clock;
use crate::config::{EntityOptions, EntitySettings};
use crate::effect::{EffectAction, ReplyTo};
use crate::error::{AskError, EntityError, JournalError, SendError, SnapshotStoreError};
use crate::identity::PersistenceId;
use crate::journal::{Journal, JournalWriter};
use crate::recovery::{RecoveryPhase, recover, stash_until};
use crate::signal::Signal;
use crate::snapshot::{
    SnapshotMetadata, SnapshotPredicate, SnapshotScheduler, SnapshotSelectionCriteria,
    SnapshotStore, StoredSnapshot,
};
use crate::stash::StashBuffer;

/// Used when the configured recovery timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Messages sent from [`EntityRef`] to the entity task.
pub(crate) enum EntityMessage<C> {
    /// A domain command.
    Command(C),
    /// Stop gracefully once every earlier message was handled.
    Stop,
}

/// Why an entity task ended.
#[derive(Debug, Clone)]
pub enum Termination {
    /// Stopped by [`EntityRef::stop`], a terminal effect, or because every
    /// handle was dropped.
    Stopped,
    /// Stopped after the idle timeout elapsed without messages.
    Passivated,
    /// A fatal fault ended the entity.
    Failed(EntityError),
    /// The task ended without reporting a reason, e.g. because a handler
    /// panicked.
    Aborted,
}

impl Termination {
    /// Whether the entity ended because of a fault.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Aborted)
    }
}

/// Outcome of a background task, handled by the entity task.
enum Completion {
    SnapshotSaved {
        metadata: SnapshotMetadata,
        result: Result<(), SnapshotStoreError>,
    },
    EventsDeleted {
        to_sequence_nr: u64,
        result: Result<(), JournalError>,
        /// Snapshots to delete once the events are gone.
        snapshots: SnapshotSelectionCriteria,
    },
    SnapshotsDeleted {
        criteria: SnapshotSelectionCriteria,
        result: Result<(), SnapshotStoreError>,
    },
}

/// What a background task was started for, so a task that panicked can
/// still be reported.
enum BackgroundTask {
    Snapshot(SnapshotMetadata),
    DeleteEvents(u64),
    DeleteSnapshots(SnapshotSelectionCriteria),
}

/// Async handle to a running entity.
///
/// Lightweight, cloneable, and `Send + Sync`. Commands are delivered in the
/// order they are sent from one handle. Dropping every handle stops the
/// entity once its mailbox is drained.
pub struct EntityRef<C> {
    persistence_id: PersistenceId,
    sender: mpsc::Sender<EntityMessage<C>>,
    signals: broadcast::Sender<Signal>,
    phase: watch::Receiver<RecoveryPhase>,
    termination: watch::Receiver<Option<Termination>>,
}

// Manual `Clone` because `C` itself need not be `Clone`.
impl<C> Clone for EntityRef<C> {
    fn clone(&self) -> Self {
        Self {
            persistence_id: self.persistence_id.clone(),
            sender: self.sender.clone(),
            signals: self.signals.clone(),
            phase: self.phase.clone(),
            termination: self.termination.clone(),
        }
    }
}

impl<C> std::fmt::Debug for EntityRef<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRef")
            .field("persistence_id", &self.persistence_id)
            .field("phase", &*self.phase.borrow())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<C: Send + 'static> EntityRef<C> {
    /// Identity of the entity.
    pub fn persistence_id(&self) -> &PersistenceId {
        &self.persistence_id
    }

    /// Enqueue a command without waiting for it to be handled.
    ///
    /// Waits only while the mailbox is full.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::EntityGone`] if the entity has terminated.
    pub async fn send(&self, command: C) -> Result<(), SendError> {
        self.deliver(EntityMessage::Command(command))
            .await
            .map_err(|_| SendError::EntityGone)
    }

    /// Send a command built around a fresh [`ReplyTo`] and wait for the
    /// reply.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let state = entity.ask(CounterCommand::Get).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// * [`AskError::EntityGone`] -- the entity has terminated.
    /// * [`AskError::NoReply`] -- the command was accepted but the reply
    ///   handle was dropped, e.g. because the entity failed while handling
    ///   it.
    pub async fn ask<R, F>(&self, build: F) -> Result<R, AskError>
    where
        F: FnOnce(ReplyTo<R>) -> C,
    {
        let (reply_to, reply) = ReplyTo::channel();
        self.send(build(reply_to)).await?;
        reply.await.map_err(|_| AskError::NoReply)
    }

    /// Ask the entity to stop after every message sent before this one.
    ///
    /// Returns once the request is queued; use [`terminated`](Self::terminated)
    /// to wait for the entity to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::EntityGone`] if the entity has already
    /// terminated.
    pub async fn stop(&self) -> Result<(), SendError> {
        self.deliver(EntityMessage::Stop)
            .await
            .map_err(|_| SendError::EntityGone)
    }

    pub(crate) async fn deliver(
        &self,
        message: EntityMessage<C>,
    ) -> Result<(), EntityMessage<C>> {
        self.sender
            .send(message)
            .await
            .map_err(|mpsc::error::SendError(message)| message)
    }
}

impl<C> EntityRef<C> {
    /// Subscribe to lifecycle signals emitted from now on.
    ///
    /// Use [`EntityBuilder::spawn_with_signals`](crate::EntityBuilder::spawn_with_signals)
    /// to observe recovery signals as well.
    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.borrow()
    }

    /// Wait until the entity reaches `phase` or terminates, whichever comes
    /// first. Returns the phase observed last.
    pub async fn wait_for_phase(&self, phase: RecoveryPhase) -> RecoveryPhase {
        let mut rx = self.phase.clone();
        let seen = rx.wait_for(|current| *current == phase).await.map(|current| *current);
        seen.unwrap_or_else(|_| *rx.borrow())
    }

    /// Wait for the entity to terminate and return why it did.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.termination.clone();
        let seen = rx
            .wait_for(Option::is_some)
            .await
            .map(|termination| termination.clone());
        seen.unwrap_or_else(|_| rx.borrow().clone())
            .unwrap_or(Termination::Aborted)
    }

    /// Termination reason, if the entity already terminated.
    pub fn termination(&self) -> Option<Termination> {
        self.termination.borrow().clone()
    }

    /// Check whether the entity still accepts messages.
    ///
    /// Returns `false` once the entity stopped, passivated or failed. The
    /// store uses this to evict stale handles and re-activate the entity on
    /// the next command.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// State owned by the entity task.
struct Entity<B: EventSourcedBehavior> {
    persistence_id: PersistenceId,
    behavior: B,
    state: B::State,
    writer: JournalWriter<B::Event>,
    snapshot_store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    settings: EntitySettings,
    snapshot_predicate: Option<SnapshotPredicate<B::State, B::Event>>,
    scheduler: SnapshotScheduler,
    background: JoinSet<Completion>,
    /// Purpose of every task in `background`, by task id.
    background_tasks: HashMap<Id, BackgroundTask>,
    signals: broadcast::Sender<Signal>,
    phase: watch::Sender<RecoveryPhase>,
}

/// Spawn an entity task and return its handle plus a signal subscription
/// taken before the task starts.
///
/// Internal entry point used by [`EntityBuilder`](crate::EntityBuilder) and
/// [`EntityStore`](crate::EntityStore); settings are validated by callers.
pub(crate) fn spawn_entity<B: EventSourcedBehavior>(
    persistence_id: PersistenceId,
    behavior: B,
    journal: Arc<dyn Journal>,
    snapshot_store: Arc<dyn SnapshotStore>,
    options: EntityOptions<B>,
) -> (EntityRef<B::Command>, broadcast::Receiver<Signal>) {
    let EntityOptions {
        settings,
        clock,
        snapshot_predicate,
        tagger,
        adapter,
    } = options;

    let (sender, rx) = mpsc::channel(settings.mailbox_capacity);
    let (signals, signal_rx) = broadcast::channel(settings.signal_capacity);
    let (phase_tx, phase_rx) = watch::channel(RecoveryPhase::Idle);
    let (termination_tx, termination_rx) = watch::channel(None);

    let writer = JournalWriter::new(
        persistence_id.clone(),
        journal,
        adapter,
        tagger,
        Arc::clone(&clock),
    );
    let entity = Entity {
        persistence_id: persistence_id.clone(),
        state: behavior.empty_state(),
        behavior,
        writer,
        snapshot_store,
        clock,
        settings,
        snapshot_predicate,
        scheduler: SnapshotScheduler::default(),
        background: JoinSet::new(),
        background_tasks: HashMap::new(),
        signals: signals.clone(),
        phase: phase_tx,
    };

    let span = tracing::info_span!("entity", persistence_id = %persistence_id);
    tokio::spawn(
        async move {
            let termination = entity.run(rx).await;
            if let Termination::Failed(error) = &termination {
                tracing::error!(error = %error, "entity failed");
            }
            termination_tx.send_replace(Some(termination));
        }
        .instrument(span),
    );

    let entity_ref = EntityRef {
        persistence_id,
        sender,
        signals,
        phase: phase_rx,
        termination: termination_rx,
    };
    (entity_ref, signal_rx)
}

impl<B: EventSourcedBehavior> Entity<B> {
    /// Recover, then process messages until the entity stops or fails.
    async fn run(mut self, mut rx: mpsc::Receiver<EntityMessage<B::Command>>) -> Termination {
        let mut stash = StashBuffer::new(self.settings.stash_capacity);
        let mut mailbox_closed = false;
        let timeout = self.settings.recovery_timeout;
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        let recovered = stash_until(
            recover(
                &self.behavior,
                &self.writer,
                self.snapshot_store.as_ref(),
                &self.persistence_id,
                &self.phase,
            ),
            &mut rx,
            &mut stash,
            deadline,
            timeout,
            &mut mailbox_closed,
        )
        .await;

        let recovered = match recovered {
            Ok(recovered) => recovered,
            Err(error) => {
                self.phase.send_replace(RecoveryPhase::Failed);
                self.emit(Signal::RecoveryFailed {
                    error: error.clone(),
                });
                return self.fail(error);
            }
        };

        self.state = recovered.state;
        self.writer.set_last_sequence_nr(recovered.last_sequence_nr);
        self.phase.send_replace(RecoveryPhase::Running);
        tracing::info!(
            highest_sequence_nr = recovered.last_sequence_nr,
            replayed = recovered.replayed,
            snapshot_sequence_nr = ?recovered.snapshot_sequence_nr,
            stashed = stash.len(),
            "entity recovered"
        );
        self.emit(Signal::RecoveryCompleted {
            highest_sequence_nr: recovered.last_sequence_nr,
            replayed_events: recovered.replayed,
        });

        while let Some(message) = stash.pop_front() {
            match self.handle(message).await {
                Ok(false) => {}
                Ok(true) => return self.shutdown(rx, Termination::Stopped).await,
                Err(error) => return self.fail(error),
            }
        }
        if mailbox_closed {
            return self.shutdown(rx, Termination::Stopped).await;
        }

        let idle_timeout = self.settings.idle_timeout;
        let mut last_activity = Instant::now();
        loop {
            let idle_deadline = idle_timeout
                .and_then(|idle| last_activity.checked_add(idle))
                .unwrap_or_else(|| last_activity + FAR_FUTURE);

            tokio::select! {
                biased;
                Some(joined) = self.background.join_next_with_id(), if !self.background.is_empty() => {
                    self.on_background(joined);
                }
                message = rx.recv() => match message {
                    Some(message) => {
                        last_activity = Instant::now();
                        match self.handle(message).await {
                            Ok(false) => {}
                            Ok(true) => return self.shutdown(rx, Termination::Stopped).await,
                            Err(error) => return self.fail(error),
                        }
                    }
                    None => return self.shutdown(rx, Termination::Stopped).await,
                },
                () = tokio::time::sleep_until(idle_deadline), if idle_timeout.is_some() => {
                    tracing::info!("entity idle, passivating");
                    return self.shutdown(rx, Termination::Passivated).await;
                }
            }
        }
    }

    /// Handle one mailbox message. Returns `true` if the entity must stop.
    async fn handle(&mut self, message: EntityMessage<B::Command>) -> Result<bool, EntityError> {
        match message {
            EntityMessage::Command(command) => self.process_command(command).await,
            EntityMessage::Stop => {
                tracing::debug!("stop requested");
                Ok(true)
            }
        }
    }

    /// Run the command handler and interpret its effect.
    async fn process_command(&mut self, command: B::Command) -> Result<bool, EntityError> {
        let effect = self
            .behavior
            .handle_command(&self.state, command)
            .map_err(EntityError::handler)?;
        let (action, side_effects, stop) = effect.into_parts();

        match action {
            EffectAction::Persist(events) => self.persist(events).await?,
            EffectAction::None => {}
            EffectAction::Unhandled => tracing::warn!(
                sequence_nr = self.writer.last_sequence_nr(),
                "command unhandled in current state"
            ),
        }

        for side_effect in side_effects {
            side_effect.run(&self.state);
        }
        Ok(stop)
    }

    /// Write `events` as one batch, fold them and evaluate snapshot
    /// triggers. Nothing is folded unless the whole batch was committed.
    async fn persist(&mut self, events: Vec<B::Event>) -> Result<(), EntityError> {
        if events.is_empty() {
            return Ok(());
        }
        let previous = self.writer.last_sequence_nr();
        let committed = self.writer.write(&events).await?;
        let last = *committed.end();

        let mut snapshot_due = false;
        let mut state = std::mem::replace(&mut self.state, self.behavior.empty_state());
        for (sequence_nr, event) in committed.zip(&events) {
            state = self.behavior.apply_event(state, event);
            if let Some(predicate) = &self.snapshot_predicate
                && predicate(&state, event, sequence_nr)
            {
                snapshot_due = true;
            }
        }
        self.state = state;

        if let Some(retention) = &self.settings.retention
            && retention.crosses_snapshot_boundary(previous, last)
        {
            snapshot_due = true;
        }
        if snapshot_due {
            self.request_snapshot(last);
        }
        Ok(())
    }

    /// Capture the current state and hand it to the scheduler.
    fn request_snapshot(&mut self, sequence_nr: u64) {
        let metadata = SnapshotMetadata {
            persistence_id: self.persistence_id.clone(),
            sequence_nr,
            timestamp: self.clock.now_millis(),
        };
        let state = match serde_json::to_value(&self.state) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(sequence_nr, error = %e, "state could not be serialized for snapshot");
                self.emit(Signal::SnapshotFailed {
                    metadata,
                    error: SnapshotStoreError::Corrupt(e.to_string()),
                });
                return;
            }
        };
        if let Some(snapshot) = self.scheduler.request(StoredSnapshot { metadata, state }) {
            self.start_snapshot(snapshot);
        }
    }

    fn start_snapshot(&mut self, snapshot: StoredSnapshot) {
        let store = Arc::clone(&self.snapshot_store);
        let metadata = snapshot.metadata.clone();
        let metadata_for_task = metadata.clone();
        tracing::debug!(sequence_nr = metadata.sequence_nr, "saving snapshot");
        let handle = self.background.spawn(
            async move {
                let result = store.save(snapshot).await;
                Completion::SnapshotSaved { metadata, result }
            }
            .in_current_span(),
        );
        self.background_tasks
            .insert(handle.id(), BackgroundTask::Snapshot(metadata_for_task));
    }

    fn on_background(&mut self, joined: Result<(Id, Completion), JoinError>) {
        let completion = match joined {
            Ok((id, completion)) => {
                self.background_tasks.remove(&id);
                completion
            }
            Err(e) => {
                tracing::error!(error = %e, "background task failed");
                if let Some(task) = self.background_tasks.remove(&e.id()) {
                    self.report_lost_task(task, &e);
                }
                return;
            }
        };

        match completion {
            Completion::SnapshotSaved { metadata, result } => {
                self.finish_snapshot();
                match result {
                    Ok(()) => {
                        let sequence_nr = metadata.sequence_nr;
                        tracing::debug!(sequence_nr, "snapshot saved");
                        self.emit(Signal::SnapshotCompleted { metadata });
                        self.apply_retention(sequence_nr);
                    }
                    Err(error) => {
                        tracing::warn!(sequence_nr = metadata.sequence_nr, error = %error, "snapshot failed");
                        self.emit(Signal::SnapshotFailed { metadata, error });
                    }
                }
            }
            Completion::EventsDeleted {
                to_sequence_nr,
                result,
                snapshots,
            } => match result {
                Ok(()) => {
                    tracing::debug!(to_sequence_nr, "events deleted");
                    self.emit(Signal::DeleteEventsCompleted { to_sequence_nr });
                    self.delete_snapshots(snapshots);
                }
                Err(error) => {
                    tracing::warn!(to_sequence_nr, error = %error, "deleting events failed");
                    self.emit(Signal::DeleteEventsFailed {
                        to_sequence_nr,
                        error,
                    });
                }
            },
            Completion::SnapshotsDeleted { criteria, result } => match result {
                Ok(()) => {
                    tracing::debug!(
                        min_sequence_nr = criteria.min_sequence_nr,
                        max_sequence_nr = criteria.max_sequence_nr,
                        "snapshots deleted"
                    );
                    self.emit(Signal::DeleteSnapshotsCompleted { criteria });
                }
                Err(error) => {
                    tracing::warn!(error = %error, "deleting snapshots failed");
                    self.emit(Signal::DeleteSnapshotsFailed { criteria, error });
                }
            },
        }
    }

    /// Report a background task that panicked or was cancelled as failed.
    fn report_lost_task(&mut self, task: BackgroundTask, cause: &JoinError) {
        let reason = format!("background task did not complete: {cause}");
        match task {
            BackgroundTask::Snapshot(metadata) => {
                self.finish_snapshot();
                self.emit(Signal::SnapshotFailed {
                    metadata,
                    error: SnapshotStoreError::Rejected(reason),
                });
            }
            BackgroundTask::DeleteEvents(to_sequence_nr) => {
                self.emit(Signal::DeleteEventsFailed {
                    to_sequence_nr,
                    error: JournalError::Rejected(reason),
                });
            }
            BackgroundTask::DeleteSnapshots(criteria) => {
                self.emit(Signal::DeleteSnapshotsFailed {
                    criteria,
                    error: SnapshotStoreError::Rejected(reason),
                });
            }
        }
    }

    /// Start the parked snapshot, if any, once the previous one finished.
    fn finish_snapshot(&mut self) {
        if let Some(next) = self.scheduler.complete() {
            self.start_snapshot(next);
        }
    }

    /// Delete what the snapshot at `sequence_nr` superseded. Events go
    /// first; snapshots follow only once the events are gone.
    fn apply_retention(&mut self, sequence_nr: u64) {
        let Some(plan) = self
            .settings
            .retention
            .and_then(|retention| retention.deletion_plan(sequence_nr))
        else {
            return;
        };

        match plan.delete_events_to {
            Some(to_sequence_nr) => {
                let journal = Arc::clone(self.writer.journal());
                let persistence_id = self.persistence_id.clone();
                let snapshots = plan.snapshots;
                let handle = self.background.spawn(
                    async move {
                        let result = journal.delete_up_to(&persistence_id, to_sequence_nr).await;
                        Completion::EventsDeleted {
                            to_sequence_nr,
                            result,
                            snapshots,
                        }
                    }
                    .in_current_span(),
                );
                self.background_tasks
                    .insert(handle.id(), BackgroundTask::DeleteEvents(to_sequence_nr));
            }
            None => self.delete_snapshots(plan.snapshots),
        }
    }

    fn delete_snapshots(&mut self, criteria: SnapshotSelectionCriteria) {
        let store = Arc::clone(&self.snapshot_store);
        let persistence_id = self.persistence_id.clone();
        let handle = self.background.spawn(
            async move {
                let result = store.delete(&persistence_id, &criteria).await;
                Completion::SnapshotsDeleted { criteria, result }
            }
            .in_current_span(),
        );
        self.background_tasks
            .insert(handle.id(), BackgroundTask::DeleteSnapshots(criteria));
    }

    fn emit(&self, signal: Signal) {
        tracing::debug!(signal = signal.name(), "signal");
        self.behavior.on_signal(&self.state, &signal);
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    /// Stop accepting messages and wait for background writes so their
    /// signals are delivered.
    async fn shutdown(
        mut self,
        mut rx: mpsc::Receiver<EntityMessage<B::Command>>,
        termination: Termination,
    ) -> Termination {
        rx.close();
        while let Some(joined) = self.background.join_next_with_id().await {
            self.on_background(joined);
        }
        tracing::info!(
            highest_sequence_nr = self.writer.last_sequence_nr(),
            reason = ?termination,
            "entity stopped"
        );
        termination
    }

    /// Terminate after a fatal fault. Background writes keep running but
    /// their outcome is no longer reported.
    fn fail(mut self, error: EntityError) -> Termination {
        self.background.detach_all();
        Termination::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::behavior::test_fixtures::{Counter, CounterCommand, CounterState};
    use crate::config::EntityBuilder;
    use crate::error::RecoveryError;
    use crate::memory::{InMemoryJournal, InMemorySnapshotStore};
    use crate::retention::RetentionCriteria;

    fn pid() -> PersistenceId {
        PersistenceId::new("counter-1").expect("valid id")
    }

    fn builder(
        counter: &Counter,
        journal: &InMemoryJournal,
        snapshots: &InMemorySnapshotStore,
    ) -> EntityBuilder<Counter> {
        EntityBuilder::new(
            pid(),
            counter.clone(),
            Arc::new(journal.clone()),
            Arc::new(snapshots.clone()),
        )
    }

    fn spawn(counter: &Counter, journal: &InMemoryJournal) -> EntityRef<CounterCommand> {
        builder(counter, journal, &InMemorySnapshotStore::new())
            .spawn()
            .expect("valid settings")
    }

    #[tokio::test]
    async fn increments_fold_in_order() {
        let counter = Counter::default();
        let journal = InMemoryJournal::new();
        let entity = spawn(&counter, &journal);

        for _ in 0..3 {
            entity.send(CounterCommand::Increment).await.expect("send");
        }
        let state = entity.ask(CounterCommand::Get).await.expect("ask");
        assert_eq!(state.value, 3);
        assert_eq!(state.history, vec![0, 1, 2]);

        let seqs: Vec<u64> = journal.records(&pid()).iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(entity.phase(), RecoveryPhase::Running);
    }

    #[tokio::test]
    async fn restart_recovers_from_journal() {
        let journal = InMemoryJournal::new();
        let first = spawn(&Counter::default(), &journal);
        first.send(CounterCommand::IncrementBy(4)).await.expect("send");
        first.stop().await.expect("stop");
        assert!(matches!(first.terminated().await, Termination::Stopped));
        assert!(!first.is_alive());

        let counter = Counter::default();
        let second = spawn(&counter, &journal);
        let state = second
            .ask(CounterCommand::IncrementAndGet)
            .await
            .expect("ask");
        assert_eq!(state.value, 5);
        assert_eq!(state.history, vec![0, 1, 2, 3, 4]);
        assert_eq!(counter.signal_names(), vec!["recovery_completed"]);
        let seqs: Vec<u64> = journal.records(&pid()).iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn handler_error_is_fatal() {
        let journal = InMemoryJournal::new();
        let entity = spawn(&Counter::default(), &journal);
        entity.send(CounterCommand::Increment).await.expect("send");

        let err = entity
            .ask(|_: ReplyTo<()>| CounterCommand::Fail)
            .await
            .expect_err("entity fails before replying");
        assert_eq!(err, AskError::NoReply);

        let termination = entity.terminated().await;
        assert!(matches!(
            termination,
            Termination::Failed(EntityError::Handler(_))
        ));
        assert!(termination.is_failure());
        assert_eq!(
            entity.send(CounterCommand::Increment).await,
            Err(SendError::EntityGone)
        );
        assert_eq!(journal.records(&pid()).len(), 1);
    }

    #[tokio::test]
    async fn failed_append_folds_nothing_and_skips_replies() {
        let journal = InMemoryJournal::new();
        let counter = Counter::default();
        let entity = spawn(&counter, &journal);
        entity
            .ask(CounterCommand::Get)
            .await
            .expect("recovered");

        journal.fail_appends(true);
        let err = entity
            .ask(CounterCommand::IncrementAndGet)
            .await
            .expect_err("append fails");
        assert_eq!(err, AskError::NoReply);
        assert!(matches!(
            entity.terminated().await,
            Termination::Failed(EntityError::Persistence { from_sequence_nr: 1, to_sequence_nr: 1, .. })
        ));
        assert_eq!(counter.applied(), 0);
        assert!(journal.records(&pid()).is_empty());
    }

    #[tokio::test]
    async fn empty_batch_runs_callbacks_without_journal_write() {
        let journal = InMemoryJournal::new();
        let entity = spawn(&Counter::default(), &journal);

        let log = entity.ask(CounterCommand::Touch).await.expect("ask");
        assert_eq!(log, vec!["first", "second"]);
        assert_eq!(journal.append_calls(), 0);
    }

    #[tokio::test]
    async fn unhandled_command_is_a_noop() {
        let journal = InMemoryJournal::new();
        let entity = spawn(&Counter::default(), &journal);
        entity.send(CounterCommand::Ignore).await.expect("send");
        let state = entity.ask(CounterCommand::Get).await.expect("still running");
        assert_eq!(state, CounterState::default());
    }

    #[tokio::test]
    async fn terminal_effect_drops_later_commands() {
        let journal = InMemoryJournal::new();
        let counter = Counter::default();
        let entity = spawn(&counter, &journal);

        entity.send(CounterCommand::IncrementAndStop).await.expect("send");
        // Accepted into the mailbox or rejected, but never handled.
        let _ = entity.send(CounterCommand::Increment).await;

        assert!(matches!(entity.terminated().await, Termination::Stopped));
        assert_eq!(journal.records(&pid()).len(), 1);
        assert_eq!(counter.handled(), 1);
    }

    #[tokio::test]
    async fn commands_during_recovery_are_stashed_in_order() {
        let journal = InMemoryJournal::new();
        let seed = spawn(&Counter::default(), &journal);
        seed.send(CounterCommand::IncrementBy(2)).await.expect("send");
        seed.stop().await.expect("stop");
        seed.terminated().await;

        journal.set_read_delay(Duration::from_millis(100));
        let entity = spawn(&Counter::default(), &journal);
        entity.send(CounterCommand::Increment).await.expect("send");
        entity.send(CounterCommand::Increment).await.expect("send");
        let state = entity.ask(CounterCommand::Get).await.expect("ask");

        assert_eq!(state.value, 4);
        assert_eq!(state.history, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn recovery_timeout_fails_entity() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        snapshots.set_load_delay(Duration::from_secs(3600));
        let counter = Counter::default();

        let (entity, mut signals) = builder(&counter, &journal, &snapshots)
            .recovery_timeout(Duration::from_millis(50))
            .spawn_with_signals()
            .expect("valid settings");
        let reply = entity.ask(CounterCommand::Get).await;

        assert_eq!(reply, Err(AskError::NoReply));
        assert!(matches!(
            entity.terminated().await,
            Termination::Failed(EntityError::Recovery(RecoveryError::Timeout(_)))
        ));
        assert_eq!(entity.phase(), RecoveryPhase::Failed);
        let signal = signals.recv().await.expect("signal");
        assert!(matches!(signal, Signal::RecoveryFailed { .. }));
        assert_eq!(counter.handled(), 0);
    }

    #[tokio::test]
    async fn stash_overflow_is_fatal() {
        let journal = InMemoryJournal::new();
        journal.set_read_delay(Duration::from_millis(200));
        let entity = builder(&Counter::default(), &journal, &InMemorySnapshotStore::new())
            .stash_capacity(2)
            .spawn()
            .expect("valid settings");

        for _ in 0..3 {
            let _ = entity.send(CounterCommand::Increment).await;
        }
        assert!(matches!(
            entity.terminated().await,
            Termination::Failed(EntityError::StashOverflow { capacity: 2 })
        ));
        assert!(journal.records(&pid()).is_empty());
    }

    #[tokio::test]
    async fn periodic_snapshots_apply_retention() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let counter = Counter::default();
        let entity = builder(&counter, &journal, &snapshots)
            .retention(
                RetentionCriteria::snapshot_every(2, 2)
                    .expect("valid")
                    .with_delete_events_on_snapshot(),
            )
            .spawn()
            .expect("valid settings");

        for _ in 0..6 {
            entity.send(CounterCommand::Increment).await.expect("send");
        }
        entity.stop().await.expect("stop");
        assert!(matches!(entity.terminated().await, Termination::Stopped));

        let stored: Vec<u64> = snapshots
            .snapshots(&pid())
            .iter()
            .map(|s| s.metadata.sequence_nr)
            .collect();
        assert_eq!(stored.last(), Some(&6));
        assert!(!stored.contains(&2));
        assert_eq!(journal.records(&pid()).first().map(|r| r.sequence_nr), Some(4));

        let names = counter.signal_names();
        assert!(names.contains(&"snapshot_completed"));
        assert!(names.contains(&"delete_events_completed"));
        assert!(names.contains(&"delete_snapshots_completed"));
    }

    #[tokio::test]
    async fn predicate_snapshot_is_used_on_restart() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let entity = builder(&Counter::default(), &journal, &snapshots)
            .snapshot_when(|state: &CounterState, _, _| state.value == 3)
            .spawn()
            .expect("valid settings");
        entity.send(CounterCommand::IncrementBy(2)).await.expect("send");
        entity.send(CounterCommand::IncrementBy(2)).await.expect("send");
        entity.stop().await.expect("stop");
        entity.terminated().await;

        let stored = snapshots.snapshots(&pid());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].metadata.sequence_nr, 4);

        let counter = Counter::default();
        let restarted = builder(&counter, &journal, &snapshots)
            .spawn()
            .expect("valid settings");
        let state = restarted.ask(CounterCommand::Get).await.expect("ask");
        assert_eq!(state.value, 4);
        assert_eq!(counter.applied(), 0);
    }

    #[tokio::test]
    async fn snapshot_failure_is_not_fatal() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        snapshots.fail_saves(true);
        let counter = Counter::default();
        let (entity, mut signals) = builder(&counter, &journal, &snapshots)
            .retention(RetentionCriteria::snapshot_every(1, 1).expect("valid"))
            .spawn_with_signals()
            .expect("valid settings");

        assert!(matches!(
            signals.recv().await.expect("signal"),
            Signal::RecoveryCompleted { .. }
        ));
        entity.send(CounterCommand::Increment).await.expect("send");
        assert!(matches!(
            signals.recv().await.expect("signal"),
            Signal::SnapshotFailed { .. }
        ));
        let state = entity.ask(CounterCommand::IncrementAndGet).await.expect("alive");
        assert_eq!(state.value, 2);
    }

    #[tokio::test]
    async fn large_batch_does_not_strand_old_snapshots() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let entity = builder(&Counter::default(), &journal, &snapshots)
            .retention(RetentionCriteria::snapshot_every(2, 2).expect("valid"))
            .spawn()
            .expect("valid settings");

        for n in [2, 18, 2, 2, 2] {
            entity.send(CounterCommand::IncrementBy(n)).await.expect("send");
        }
        entity.stop().await.expect("stop");
        entity.terminated().await;

        let stored: Vec<u64> = snapshots
            .snapshots(&pid())
            .iter()
            .map(|s| s.metadata.sequence_nr)
            .collect();
        assert_eq!(stored.last(), Some(&26));
        assert!(!stored.contains(&2), "stranded snapshot: {stored:?}");
        assert!(stored.len() <= 2, "kept too many: {stored:?}");
    }

    /// Snapshot store whose writes panic inside the background task.
    struct PanickingSnapshotStore;

    #[async_trait::async_trait]
    impl SnapshotStore for PanickingSnapshotStore {
        async fn save(&self, _snapshot: StoredSnapshot) -> Result<(), SnapshotStoreError> {
            panic!("disk controller on fire");
        }

        async fn load_latest(
            &self,
            _persistence_id: &PersistenceId,
            _criteria: &SnapshotSelectionCriteria,
        ) -> Result<Option<StoredSnapshot>, SnapshotStoreError> {
            Ok(None)
        }

        async fn delete(
            &self,
            _persistence_id: &PersistenceId,
            _criteria: &SnapshotSelectionCriteria,
        ) -> Result<(), SnapshotStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_snapshot_write_is_reported_as_failure() {
        let journal = InMemoryJournal::new();
        let (entity, mut signals) = EntityBuilder::new(
            pid(),
            Counter::default(),
            Arc::new(journal.clone()),
            Arc::new(PanickingSnapshotStore),
        )
        .snapshot_when(|_, _, _| true)
        .spawn_with_signals()
        .expect("valid settings");

        assert!(matches!(
            signals.recv().await.expect("signal"),
            Signal::RecoveryCompleted { .. }
        ));
        entity.send(CounterCommand::Increment).await.expect("send");
        match signals.recv().await.expect("signal") {
            Signal::SnapshotFailed { metadata, error } => {
                assert_eq!(metadata.sequence_nr, 1);
                assert!(matches!(error, SnapshotStoreError::Rejected(_)));
            }
            other => panic!("unexpected signal: {other:?}"),
        }

        // The slot is free again, so the next snapshot is attempted too.
        entity.send(CounterCommand::Increment).await.expect("send");
        match signals.recv().await.expect("signal") {
            Signal::SnapshotFailed { metadata, .. } => assert_eq!(metadata.sequence_nr, 2),
            other => panic!("unexpected signal: {other:?}"),
        }
        let state = entity.ask(CounterCommand::Get).await.expect("alive");
        assert_eq!(state.value, 2);
    }

    #[tokio::test]
    async fn idle_entity_passivates() {
        let journal = InMemoryJournal::new();
        let entity = builder(&Counter::default(), &journal, &InMemorySnapshotStore::new())
            .idle_timeout(Duration::from_millis(50))
            .spawn()
            .expect("valid settings");
        entity.send(CounterCommand::Increment).await.expect("send");

        assert!(matches!(entity.terminated().await, Termination::Passivated));
        assert!(!entity.is_alive());
        assert_eq!(journal.records(&pid()).len(), 1);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_entity() {
        let journal = InMemoryJournal::new();
        let entity = spawn(&Counter::default(), &journal);
        let mut termination = entity.termination.clone();
        drop(entity);

        let done = termination
            .wait_for(Option::is_some)
            .await
            .expect("termination reported")
            .clone();
        assert!(matches!(done, Some(Termination::Stopped)));
    }
}
