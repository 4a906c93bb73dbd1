//! Effects: immutable descriptions of what must happen after a command.
//!
//! A command handler never touches the journal itself. It returns an
//! [`Effect`] value and the entity interprets it in a fixed order:
//!
//! 1. persist the events (if any) as one atomic batch,
//! 2. fold them into state, left to right,
//! 3. run chained side effects in chaining order with the final state,
//! 4. stop the entity if the effect is terminal.

use std::fmt;

use tokio::sync::oneshot;

/// What the entity must do with the journal for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectAction<E> {
    /// Persist the events atomically. An empty batch is a valid no-op that
    /// still runs the chained side effects.
    Persist(Vec<E>),
    /// Persist nothing.
    None,
    /// The command was not meaningful in the current state. Logged, then
    /// treated like [`EffectAction::None`].
    Unhandled,
}

/// Boxed post-persistence callback receiving the final folded state.
type Callback<S> = Box<dyn FnOnce(&S) + Send + 'static>;

/// A single post-persistence action, run exactly once.
pub(crate) enum SideEffect<S> {
    /// Arbitrary callback registered with [`Effect::then_run`].
    Run(Callback<S>),
    /// Reply registered with [`Effect::then_reply`] or [`Effect::reply`].
    Reply(Callback<S>),
}

impl<S> SideEffect<S> {
    pub(crate) fn run(self, state: &S) {
        match self {
            Self::Run(f) | Self::Reply(f) => f(state),
        }
    }
}

/// Directive returned by a command handler.
///
/// Effects are built by value: every chaining method consumes the effect
/// and returns a new one, so a finished `Effect` can be inspected but not
/// mutated.
///
/// # Examples
///
/// ```
/// use entityfold::{Effect, EffectAction};
///
/// let effect: Effect<u32, u64> = Effect::persist_all([1, 2, 3])
///     .then_run(|state| println!("now at {state}"))
///     .then_stop();
///
/// assert_eq!(effect.action(), &EffectAction::Persist(vec![1, 2, 3]));
/// assert_eq!(effect.side_effect_count(), 1);
/// assert!(effect.is_stop());
/// ```
#[must_use = "an effect does nothing unless returned from a command handler"]
pub struct Effect<E, S> {
    action: EffectAction<E>,
    side_effects: Vec<SideEffect<S>>,
    stop: bool,
}

impl<E, S> Effect<E, S> {
    fn from_action(action: EffectAction<E>) -> Self {
        Self {
            action,
            side_effects: Vec::new(),
            stop: false,
        }
    }

    /// Persist a single event.
    pub fn persist(event: E) -> Self {
        Self::from_action(EffectAction::Persist(vec![event]))
    }

    /// Persist several events as one atomic batch.
    ///
    /// Either all of them are durably recorded and folded in order, or the
    /// entity fails with none of them applied.
    pub fn persist_all(events: impl IntoIterator<Item = E>) -> Self {
        Self::from_action(EffectAction::Persist(events.into_iter().collect()))
    }

    /// Persist nothing.
    pub fn none() -> Self {
        Self::from_action(EffectAction::None)
    }

    /// Mark the command as unhandled in the current state.
    pub fn unhandled() -> Self {
        Self::from_action(EffectAction::Unhandled)
    }

    /// Persist nothing and stop the entity.
    pub fn stop() -> Self {
        Self::none().then_stop()
    }

    /// Persist nothing and answer `reply_to` with `value`.
    pub fn reply<R>(reply_to: ReplyTo<R>, value: R) -> Self
    where
        R: Send + 'static,
    {
        Self::none().then_reply(reply_to, move |_| value)
    }

    /// Chain a callback that runs after persistence with the final state.
    pub fn then_run<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&S) + Send + 'static,
    {
        self.side_effects.push(SideEffect::Run(Box::new(callback)));
        self
    }

    /// Chain a reply computed from the final state.
    ///
    /// The reply is sent once persistence has been acknowledged, in its
    /// chained position relative to other side effects.
    pub fn then_reply<R, F>(mut self, reply_to: ReplyTo<R>, reply: F) -> Self
    where
        R: Send + 'static,
        F: FnOnce(&S) -> R + Send + 'static,
    {
        self.side_effects
            .push(SideEffect::Reply(Box::new(move |state| reply_to.send(reply(state)))));
        self
    }

    /// Stop the entity once every side effect has run.
    pub fn then_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    /// The journal action of this effect.
    pub fn action(&self) -> &EffectAction<E> {
        &self.action
    }

    /// Events this effect persists; empty for non-persisting effects.
    pub fn events(&self) -> &[E] {
        match &self.action {
            EffectAction::Persist(events) => events,
            EffectAction::None | EffectAction::Unhandled => &[],
        }
    }

    /// Number of chained side effects, replies included.
    pub fn side_effect_count(&self) -> usize {
        self.side_effects.len()
    }

    /// Whether the entity stops after this effect.
    pub fn is_stop(&self) -> bool {
        self.stop
    }

    pub(crate) fn into_parts(self) -> (EffectAction<E>, Vec<SideEffect<S>>, bool) {
        (self.action, self.side_effects, self.stop)
    }
}

impl<E: fmt::Debug, S> fmt::Debug for Effect<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("action", &self.action)
            .field("side_effects", &self.side_effects.len())
            .field("stop", &self.stop)
            .finish()
    }
}

/// One-shot handle for answering a command.
///
/// Commands that expect an answer carry a `ReplyTo`. The handler moves it
/// into [`Effect::then_reply`], which guarantees the answer is sent at most
/// once and only after the command's events are durable. Dropping a
/// `ReplyTo` unanswered surfaces as [`AskError::NoReply`](crate::AskError)
/// on the asking side.
pub struct ReplyTo<R> {
    sender: oneshot::Sender<R>,
}

impl<R> ReplyTo<R> {
    /// Create a reply handle and the receiver that observes its answer.
    pub fn channel() -> (Self, oneshot::Receiver<R>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Answer the request. A caller that stopped waiting is ignored.
    pub fn send(self, value: R) {
        let _ = self.sender.send(value);
    }

    /// Whether the asking side is still waiting for an answer.
    pub fn is_waiting(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyTo")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}
