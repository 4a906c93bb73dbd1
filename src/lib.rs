//! Durable, replay-based event-sourced entities.
//!
//! An entity is identified by a [`PersistenceId`] and driven by an
//! [`EventSourcedBehavior`]: commands produce an [`Effect`], whose events
//! are appended to a [`Journal`] and folded into state. On start the state
//! is recovered from the latest snapshot plus the events written after it.
//! Entities run as Tokio tasks and are addressed through an [`EntityRef`]
//! or an [`EntityStore`].

mod actor;
pub use actor::{EntityRef, Termination};
mod adapter;
pub use adapter::{EncodedEvent, EventAdapter, JsonEventAdapter, Tagger};
mod behavior;
pub use behavior::EventSourcedBehavior;
mod clock;
mod config;
mod effect;
mod error;
mod identity;
mod journal;
mod memory;
mod recovery;
mod retention;
mod signal;
mod snapshot;
mod stash;
mod storage;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_MAILBOX_CAPACITY, DEFAULT_RECOVERY_TIMEOUT, DEFAULT_SIGNAL_CAPACITY, EntityBuilder,
    EntitySettings,
};
pub use effect::{Effect, EffectAction, ReplyTo};
pub use error::{
    AdapterError, AskError, BoxError, ConfigError, EntityError, IdentityError, JournalError,
    RecoveryError, SendError, SnapshotStoreError,
};
pub use identity::PersistenceId;
pub use journal::{EventStream, Journal, PersistentRecord};
pub use memory::{InMemoryJournal, InMemorySnapshotStore};
pub use recovery::RecoveryPhase;
pub use retention::{DeletionPlan, DeletionWindow, RetentionCriteria};
pub use signal::Signal;
pub use snapshot::{
    SnapshotMetadata, SnapshotPredicate, SnapshotSelectionCriteria, SnapshotStore, StoredSnapshot,
};
pub use stash::DEFAULT_STASH_CAPACITY;
pub use storage::{FileJournal, FileSnapshotStore, StreamLayout};
pub use store::{DEFAULT_IDLE_TIMEOUT, EntityStore, EntityStoreBuilder};
