//! Entity configuration and the builder that spawns a single entity.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::actor::{EntityRef, spawn_entity};
use crate::adapter::{EventAdapter, JsonEventAdapter, Tagger};
use crate::behavior::EventSourcedBehavior;
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::identity::PersistenceId;
use crate::journal::Journal;
use crate::retention::RetentionCriteria;
use crate::signal::Signal;
use crate::snapshot::{SnapshotPredicate, SnapshotStore};
use crate::stash::DEFAULT_STASH_CAPACITY;

/// Default bound on snapshot loading plus event replay: 30 seconds.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default mailbox size per entity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default number of signals buffered per subscriber.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 64;

/// Tunables shared by every entity of a store or set on a single entity.
///
/// Deserializes with defaults for absent fields, so it can be embedded in
/// an application's own configuration file.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use entityfold::EntitySettings;
///
/// let settings: EntitySettings = serde_json::from_str(
///     r#"{ "stash_capacity": 10, "retention": { "snapshot_every_n_events": 100, "keep_n_snapshots": 2 } }"#,
/// ).unwrap();
///
/// assert_eq!(settings.stash_capacity, 10);
/// assert_eq!(settings.recovery_timeout, Duration::from_secs(30));
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySettings {
    /// Upper bound on recovery. Exceeding it is fatal.
    pub recovery_timeout: Duration,
    /// Passivate after this long without messages. `None` keeps the entity
    /// running until stopped.
    pub idle_timeout: Option<Duration>,
    /// Messages held while recovering. Overflowing is fatal.
    pub stash_capacity: usize,
    /// Bounded mailbox size.
    pub mailbox_capacity: usize,
    /// Signals buffered per subscriber before it starts lagging.
    pub signal_capacity: usize,
    /// Periodic snapshots and cleanup.
    pub retention: Option<RetentionCriteria>,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            idle_timeout: None,
            stash_capacity: DEFAULT_STASH_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            retention: None,
        }
    }
}

impl EntitySettings {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero mailbox, stash or signal capacities
    /// or invalid retention criteria.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                setting: "mailbox_capacity",
            });
        }
        if self.stash_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                setting: "stash_capacity",
            });
        }
        if self.signal_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                setting: "signal_capacity",
            });
        }
        if let Some(retention) = &self.retention {
            retention.validate()?;
        }
        Ok(())
    }
}

/// Everything besides the behavior and the backends that shapes an entity.
pub(crate) struct EntityOptions<B: EventSourcedBehavior> {
    pub(crate) settings: EntitySettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) snapshot_predicate: Option<SnapshotPredicate<B::State, B::Event>>,
    pub(crate) tagger: Option<Tagger<B::Event>>,
    pub(crate) adapter: Arc<dyn EventAdapter<B::Event>>,
}

impl<B: EventSourcedBehavior> Default for EntityOptions<B> {
    fn default() -> Self {
        Self {
            settings: EntitySettings::default(),
            clock: Arc::new(SystemClock),
            snapshot_predicate: None,
            tagger: None,
            adapter: Arc::new(JsonEventAdapter::<B::Event>::new()),
        }
    }
}

// Manual `Clone`: `B` itself need not be `Clone`.
impl<B: EventSourcedBehavior> Clone for EntityOptions<B> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            clock: Arc::clone(&self.clock),
            snapshot_predicate: self.snapshot_predicate.clone(),
            tagger: self.tagger.clone(),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

/// Setters shared by [`EntityBuilder`] and
/// [`EntityStoreBuilder`](crate::EntityStoreBuilder).
macro_rules! entity_option_setters {
    () => {
        /// Replace all settings at once.
        pub fn settings(mut self, settings: $crate::EntitySettings) -> Self {
            self.options.settings = settings;
            self
        }

        /// Snapshot periodically and clean up superseded data.
        pub fn retention(mut self, retention: $crate::RetentionCriteria) -> Self {
            self.options.settings.retention = Some(retention);
            self
        }

        /// Bound snapshot loading plus event replay.
        pub fn recovery_timeout(mut self, timeout: ::std::time::Duration) -> Self {
            self.options.settings.recovery_timeout = timeout;
            self
        }

        /// Passivate after `timeout` without messages.
        pub fn idle_timeout(mut self, timeout: ::std::time::Duration) -> Self {
            self.options.settings.idle_timeout = Some(timeout);
            self
        }

        /// Number of messages stashed while recovering.
        pub fn stash_capacity(mut self, capacity: usize) -> Self {
            self.options.settings.stash_capacity = capacity;
            self
        }

        /// Clock used for record and snapshot timestamps.
        pub fn clock(mut self, clock: impl $crate::Clock) -> Self {
            self.options.clock = ::std::sync::Arc::new(clock);
            self
        }

        /// Snapshot after a batch when `predicate(state, event, sequence_nr)`
        /// holds for any of its events.
        pub fn snapshot_when<F>(mut self, predicate: F) -> Self
        where
            F: Fn(&B::State, &B::Event, u64) -> bool + Send + Sync + 'static,
        {
            self.options.snapshot_predicate = Some(::std::sync::Arc::new(predicate));
            self
        }

        /// Attach routing tags to every stored event.
        pub fn tagger<F>(mut self, tagger: F) -> Self
        where
            F: Fn(&B::Event) -> ::std::collections::BTreeSet<String> + Send + Sync + 'static,
        {
            self.options.tagger = Some(::std::sync::Arc::new(tagger));
            self
        }

        /// Replace the default JSON event adapter.
        pub fn event_adapter(mut self, adapter: impl $crate::EventAdapter<B::Event>) -> Self {
            self.options.adapter = ::std::sync::Arc::new(adapter);
            self
        }
    };
}

pub(crate) use entity_option_setters;

/// Builder for a single entity outside of an
/// [`EntityStore`](crate::EntityStore).
///
/// Nothing guards against spawning two entities with the same
/// [`PersistenceId`] this way; the journal then rejects the loser's writes
/// with a sequence conflict. Use a store to get one entity per id.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use entityfold::*;
/// # fn demo<B: EventSourcedBehavior>(behavior: B) -> Result<(), Box<dyn std::error::Error>> {
/// let entity = EntityBuilder::new(
///     PersistenceId::new("counter-1")?,
///     behavior,
///     Arc::new(InMemoryJournal::new()),
///     Arc::new(InMemorySnapshotStore::new()),
/// )
/// .retention(RetentionCriteria::snapshot_every(100, 2)?)
/// .spawn()?;
/// # let _ = entity;
/// # Ok(())
/// # }
/// ```
pub struct EntityBuilder<B: EventSourcedBehavior> {
    persistence_id: PersistenceId,
    behavior: B,
    journal: Arc<dyn Journal>,
    snapshot_store: Arc<dyn SnapshotStore>,
    options: EntityOptions<B>,
}

impl<B: EventSourcedBehavior> EntityBuilder<B> {
    /// Start building an entity for `persistence_id`.
    pub fn new(
        persistence_id: PersistenceId,
        behavior: B,
        journal: Arc<dyn Journal>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            persistence_id,
            behavior,
            journal,
            snapshot_store,
            options: EntityOptions::default(),
        }
    }

    entity_option_setters!();

    /// Spawn the entity on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings are invalid.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn spawn(self) -> Result<EntityRef<B::Command>, ConfigError> {
        self.spawn_with_signals().map(|(entity, _)| entity)
    }

    /// Spawn the entity and subscribe to its signals before recovery
    /// starts, so no signal can be missed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings are invalid.
    pub fn spawn_with_signals(
        self,
    ) -> Result<(EntityRef<B::Command>, broadcast::Receiver<Signal>), ConfigError> {
        self.options.settings.validate()?;
        Ok(spawn_entity(
            self.persistence_id,
            self.behavior,
            self.journal,
            self.snapshot_store,
            self.options,
        ))
    }
}
