//! The user-supplied behavior of an event-sourced entity.

use serde::{Serialize, de::DeserializeOwned};

use crate::effect::Effect;
use crate::signal::Signal;

/// Domain logic of an event-sourced entity.
///
/// State is never mutated directly. A command handler inspects the current
/// state and returns an [`Effect`] describing which events to persist; the
/// entity then folds those events into the state with
/// [`apply_event`](EventSourcedBehavior::apply_event). During recovery the
/// same fold replays the journal, so replaying the stored events always
/// reproduces the state the entity had when it wrote them.
///
/// # Contract
///
/// - [`handle_command`](EventSourcedBehavior::handle_command) decides; it
///   must not perform I/O. Side effects go into the returned effect.
/// - [`apply_event`](EventSourcedBehavior::apply_event) must be pure and
///   total. It runs during replay without any command context.
/// - Returning `Err` from the command handler is fatal for the entity
///   instance. Reject invalid commands by replying instead.
pub trait EventSourcedBehavior: Send + Sync + 'static {
    /// Commands the entity accepts.
    type Command: Send + 'static;

    /// Events the entity persists.
    type Event: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Folded state; serialized into snapshots.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Fatal handler failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// State of an entity without events or snapshots.
    fn empty_state(&self) -> Self::State;

    /// Decide what a command does.
    fn handle_command(
        &self,
        state: &Self::State,
        command: Self::Command,
    ) -> Result<Effect<Self::Event, Self::State>, Self::Error>;

    /// Fold one event into the state.
    fn apply_event(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// React to a lifecycle signal. The default ignores all signals.
    fn on_signal(&self, state: &Self::State, signal: &Signal) {
        let _ = (state, signal);
    }
}
