//! Self-contained example demonstrating an event-sourced counter entity
//! with file-backed persistence, periodic snapshots and recovery.
//!
//! Run with: `RUST_LOG=entityfold=debug cargo run --example counter`

use std::sync::Arc;

use entityfold::{
    Effect, EntityStoreBuilder, EventSourcedBehavior, FileJournal, FileSnapshotStore,
    PersistenceId, ReplyTo, RetentionCriteria, Signal, StreamLayout,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Counter entity
// ---------------------------------------------------------------------------

/// Current value plus the value before every increment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterState {
    value: i64,
    history: Vec<i64>,
}

/// Commands accepted by the [`Counter`] entity.
enum CounterCommand {
    Increment,
    Decrement,
    Reset,
    Get(ReplyTo<CounterState>),
}

/// Events persisted by the [`Counter`] entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Incremented,
    Decremented,
    WasReset { previous: i64 },
}

#[derive(Debug, thiserror::Error)]
#[error("counter cannot fail")]
struct CounterError;

struct Counter;

impl EventSourcedBehavior for Counter {
    type Command = CounterCommand;
    type Event = CounterEvent;
    type State = CounterState;
    type Error = CounterError;

    fn empty_state(&self) -> CounterState {
        CounterState::default()
    }

    fn handle_command(
        &self,
        state: &CounterState,
        command: CounterCommand,
    ) -> Result<Effect<CounterEvent, CounterState>, CounterError> {
        Ok(match command {
            CounterCommand::Increment => Effect::persist(CounterEvent::Incremented),
            // Going below zero is not an error, just not meaningful.
            CounterCommand::Decrement if state.value <= 0 => Effect::unhandled(),
            CounterCommand::Decrement => Effect::persist(CounterEvent::Decremented),
            CounterCommand::Reset => Effect::persist(CounterEvent::WasReset {
                previous: state.value,
            }),
            CounterCommand::Get(reply_to) => Effect::reply(reply_to, state.clone()),
        })
    }

    fn apply_event(&self, mut state: CounterState, event: &CounterEvent) -> CounterState {
        match event {
            CounterEvent::Incremented => {
                state.history.push(state.value);
                state.value += 1;
            }
            CounterEvent::Decremented => state.value -= 1,
            CounterEvent::WasReset { .. } => state.value = 0,
        }
        state
    }

    fn on_signal(&self, state: &CounterState, signal: &Signal) {
        if let Signal::SnapshotCompleted { metadata } = signal {
            println!(
                "snapshot of {} at #{} (value {})",
                metadata.persistence_id, metadata.sequence_nr, state.value
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;
    let layout = StreamLayout::new(tmp.path());
    let journal = Arc::new(FileJournal::with_layout(layout.clone()));
    let snapshots = Arc::new(FileSnapshotStore::with_layout(layout.clone()));

    let store = EntityStoreBuilder::new(journal.clone(), snapshots.clone(), |_: &PersistenceId| {
        Counter
    })
    .retention(RetentionCriteria::snapshot_every(3, 2)?.with_delete_events_on_snapshot())
    .build()?;

    let alpha = PersistenceId::of("counter", "alpha")?;
    let beta = PersistenceId::of("counter", "beta")?;

    for _ in 0..7 {
        store.send(&alpha, CounterCommand::Increment).await?;
    }
    store.send(&beta, CounterCommand::Increment).await?;
    store.send(&beta, CounterCommand::Decrement).await?;
    store.send(&beta, CounterCommand::Decrement).await?;
    store.send(&beta, CounterCommand::Increment).await?;

    let alpha_state = store.ask(&alpha, CounterCommand::Get).await?;
    let beta_state = store.ask(&beta, CounterCommand::Get).await?;
    println!("alpha = {} (history {:?})", alpha_state.value, alpha_state.history);
    println!("beta  = {}", beta_state.value);

    // Stopping and asking again re-activates alpha from snapshot + journal.
    store.stop(&alpha).await;
    store.send(&alpha, CounterCommand::Reset).await?;
    let recovered = store.ask(&alpha, CounterCommand::Get).await?;
    println!("alpha after reset = {}", recovered.value);

    store.stop_all().await;

    assert_eq!(alpha_state.value, 7);
    assert_eq!(alpha_state.history, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(beta_state.value, 1);
    assert_eq!(recovered.value, 0);
    assert_eq!(layout.list_streams()?, vec![alpha, beta]);

    println!("all assertions passed");
    Ok(())
}
