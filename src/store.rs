//! Registry that keeps at most one live entity per identity.
//!
//! The store is built via [`EntityStoreBuilder`]. Entities are spawned on
//! first use, cached by [`PersistenceId`], and evicted once they stop,
//! passivate or fail. The next command re-activates the entity, which
//! recovers its state from the journal before handling it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{EntityMessage, EntityRef, Termination, spawn_entity};
use crate::behavior::EventSourcedBehavior;
use crate::config::{EntityOptions, entity_option_setters};
use crate::effect::ReplyTo;
use crate::error::{AskError, ConfigError, SendError};
use crate::identity::PersistenceId;
use crate::journal::Journal;
use crate::snapshot::SnapshotStore;

/// Default idle timeout for entities owned by a store: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Creates the behavior for a newly activated entity.
type BehaviorFactory<B> = Arc<dyn Fn(&PersistenceId) -> B + Send + Sync>;

type RefCache<C> = HashMap<PersistenceId, EntityRef<C>>;

/// Owns every live entity of one behavior type.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
pub struct EntityStore<B: EventSourcedBehavior> {
    factory: BehaviorFactory<B>,
    journal: Arc<dyn Journal>,
    snapshot_store: Arc<dyn SnapshotStore>,
    options: EntityOptions<B>,
    cache: Arc<RwLock<RefCache<B::Command>>>,
}

// Manual `Clone` because `B` itself need not be `Clone`.
impl<B: EventSourcedBehavior> Clone for EntityStore<B> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            journal: Arc::clone(&self.journal),
            snapshot_store: Arc::clone(&self.snapshot_store),
            options: self.options.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<B: EventSourcedBehavior> std::fmt::Debug for EntityStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("settings", &self.options.settings)
            .finish_non_exhaustive()
    }
}

impl<B: EventSourcedBehavior> EntityStore<B> {
    /// Get a handle to the entity for `persistence_id`, spawning it if
    /// needed.
    ///
    /// If the entity is cached and alive, returns a clone of the existing
    /// handle. Otherwise the stale entry is replaced by a freshly spawned
    /// entity, which starts by recovering.
    pub async fn entity_ref(&self, persistence_id: &PersistenceId) -> EntityRef<B::Command> {
        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(entity) = cache.get(persistence_id)
                && entity.is_alive()
            {
                return entity.clone();
            }
        }

        // Slow path: re-check under the write lock so concurrent callers
        // spawn only one entity.
        let mut cache = self.cache.write().await;
        if let Some(entity) = cache.get(persistence_id)
            && entity.is_alive()
        {
            return entity.clone();
        }

        tracing::debug!(persistence_id = %persistence_id, "spawning entity");
        let (entity, _) = spawn_entity(
            persistence_id.clone(),
            (self.factory)(persistence_id),
            Arc::clone(&self.journal),
            Arc::clone(&self.snapshot_store),
            self.options.clone(),
        );
        cache.insert(persistence_id.clone(), entity.clone());
        entity
    }

    /// Deliver a command to the entity, activating it if needed.
    ///
    /// An entity that passivates between lookup and delivery is
    /// re-activated once and the command delivered to the new instance.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::EntityGone`] if the re-activated entity
    /// terminated before accepting the command as well.
    pub async fn send(
        &self,
        persistence_id: &PersistenceId,
        command: B::Command,
    ) -> Result<(), SendError> {
        let entity = self.entity_ref(persistence_id).await;
        let Err(message) = entity.deliver(EntityMessage::Command(command)).await else {
            return Ok(());
        };
        tracing::debug!(persistence_id = %persistence_id, "entity gone, re-activating");
        self.entity_ref(persistence_id)
            .await
            .deliver(message)
            .await
            .map_err(|_| SendError::EntityGone)
    }

    /// Send a command built around a fresh [`ReplyTo`] and wait for the
    /// reply.
    ///
    /// # Errors
    ///
    /// See [`EntityRef::ask`].
    pub async fn ask<R, F>(&self, persistence_id: &PersistenceId, build: F) -> Result<R, AskError>
    where
        F: FnOnce(ReplyTo<R>) -> B::Command,
    {
        let (reply_to, reply) = ReplyTo::channel();
        self.send(persistence_id, build(reply_to)).await?;
        reply.await.map_err(|_| AskError::NoReply)
    }

    /// Stop the entity, if it is running, and wait for it to terminate.
    ///
    /// Returns `None` if no live entity was cached for `persistence_id`.
    pub async fn stop(&self, persistence_id: &PersistenceId) -> Option<Termination> {
        let entity = self.cache.write().await.remove(persistence_id)?;
        if entity.stop().await.is_err() {
            tracing::debug!(persistence_id = %persistence_id, "entity already terminated");
        }
        Some(entity.terminated().await)
    }

    /// Stop every cached entity and wait for all of them to terminate.
    pub async fn stop_all(&self) {
        let entities: Vec<_> = self.cache.write().await.drain().map(|(_, e)| e).collect();
        for entity in &entities {
            let _ = entity.stop().await;
        }
        for entity in &entities {
            entity.terminated().await;
        }
    }

    /// Identities of the entities currently alive, sorted.
    pub async fn active_ids(&self) -> Vec<PersistenceId> {
        let cache = self.cache.read().await;
        let mut ids: Vec<_> = cache
            .iter()
            .filter(|(_, entity)| entity.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Builder for configuring an [`EntityStore`].
///
/// Entities created by the store passivate after [`DEFAULT_IDLE_TIMEOUT`]
/// unless configured otherwise.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use entityfold::*;
/// # fn demo<B: EventSourcedBehavior + Default>() -> Result<(), ConfigError> {
/// let store = EntityStoreBuilder::new(
///     Arc::new(InMemoryJournal::new()),
///     Arc::new(InMemorySnapshotStore::new()),
///     |_id: &PersistenceId| B::default(),
/// )
/// .idle_timeout(Duration::from_secs(60))
/// .retention(RetentionCriteria::snapshot_every(100, 2)?)
/// .build()?;
/// # let _ = store;
/// # Ok(())
/// # }
/// ```
pub struct EntityStoreBuilder<B: EventSourcedBehavior> {
    factory: BehaviorFactory<B>,
    journal: Arc<dyn Journal>,
    snapshot_store: Arc<dyn SnapshotStore>,
    options: EntityOptions<B>,
}

impl<B: EventSourcedBehavior> EntityStoreBuilder<B> {
    /// Start building a store whose entities use `journal` and
    /// `snapshot_store`, with behaviors created by `factory`.
    pub fn new<F>(
        journal: Arc<dyn Journal>,
        snapshot_store: Arc<dyn SnapshotStore>,
        factory: F,
    ) -> Self
    where
        F: Fn(&PersistenceId) -> B + Send + Sync + 'static,
    {
        let mut options = EntityOptions::default();
        options.settings.idle_timeout = Some(DEFAULT_IDLE_TIMEOUT);
        Self {
            factory: Arc::new(factory),
            journal,
            snapshot_store,
            options,
        }
    }

    entity_option_setters!();

    /// Keep entities running until stopped explicitly.
    pub fn without_idle_timeout(mut self) -> Self {
        self.options.settings.idle_timeout = None;
        self
    }

    /// Build the [`EntityStore`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings are invalid.
    pub fn build(self) -> Result<EntityStore<B>, ConfigError> {
        self.options.settings.validate()?;
        Ok(EntityStore {
            factory: self.factory,
            journal: self.journal,
            snapshot_store: self.snapshot_store,
            options: self.options,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}
