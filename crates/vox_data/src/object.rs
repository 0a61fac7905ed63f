//! Versioned objects
//!
//! A [`VersionedObject`] owns its current [`Snapshot`] and the bookkeeping
//! needed to hand out update handles safely:
//!
//! ```text
//!   create ──► Initialized (seq 0)
//!                 │
//!   create_update ──► NewUpdate (seq n, "n+")  ──writes──►  finish ──► UpdateFinished (seq n+1)
//! ```
//!
//! One lock protects the bookkeeping (current snapshot, sequence counter,
//! open updates, container links and properties). It is held only for short
//! sections and never while a listener runs or while another object's update
//! may be released: both happen from values carried out of the locked
//! section.

use crate::container::{ContainmentLink, DataContainer};
use crate::coordinator::DataContext;
use crate::error::{DataError, Result};
use crate::event::{ChangeNotifier, ChangeReason, DataChanged, PendingNotification, SubscriberId};
use crate::guard::{FinishGuard, GuardToken};
use crate::property::{PropertyDefinition, PropertyStore, ReplaceMode, WriteAccess};
use crate::snapshot::{Metadata, Snapshot, VersionToken};
use crate::update::{ContainerUpdates, HeldContainerUpdate, PhaseCell, UpdateHandle, UpdatePhase};
use crate::value::Value;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use vox_core::{ObjectId, UpdateId};

/// What kind of payload an object carries; the payload itself is opaque here
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataKind {
    Volume,
    Surface,
    /// Raw projection stream of a tomography scan
    TomographyRaw,
    Image,
    Series,
    Container,
    Custom(String),
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "{}", name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Bookkeeping for an update that is currently running
struct OpenUpdate {
    handle: Weak<UpdateHandle>,
    guard: Weak<GuardToken>,
    held: Vec<HeldContainerUpdate>,
}

struct ObjectState {
    current: Arc<Snapshot>,
    last_sequence: u64,
    initialized: bool,
    open_updates: HashMap<UpdateId, OpenUpdate>,
    containers: HashMap<ObjectId, ContainmentLink>,
    properties: PropertyStore,
}

/// The mutable tracked entity
pub struct VersionedObject {
    id: ObjectId,
    kind: DataKind,
    context: Arc<DataContext>,
    weak_self: Weak<VersionedObject>,
    state: Mutex<ObjectState>,
    notifier: ChangeNotifier,
}

impl VersionedObject {
    /// Create and initialize an object; its first snapshot has sequence 0
    pub fn create(context: &Arc<DataContext>, kind: DataKind) -> Result<Arc<Self>> {
        let object = Self::new(context, kind)?;
        object.initialize()?;
        Ok(object)
    }

    /// Construct an object that has not announced itself yet
    ///
    /// Listeners registered before [`VersionedObject::initialize`] receive
    /// the `Initialized` event. Updates are rejected until then.
    pub fn new(context: &Arc<DataContext>, kind: DataKind) -> Result<Arc<Self>> {
        let ctx = context.clone();
        context
            .coordinator()
            .execute(move || Self::construct(ctx, kind))?
    }

    fn construct(context: Arc<DataContext>, kind: DataKind) -> Result<Arc<Self>> {
        context.coordinator().check_current("VersionedObject::construct")?;

        let id = ObjectId::new();
        let object = Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let snapshot = Snapshot::new(
                weak_self.clone(),
                id,
                VersionToken::new(0, false),
                Metadata::new(),
            );
            Self {
                id,
                kind,
                context,
                weak_self: weak_self.clone(),
                state: Mutex::new(ObjectState {
                    current: snapshot,
                    last_sequence: 0,
                    initialized: false,
                    open_updates: HashMap::new(),
                    containers: HashMap::new(),
                    properties: PropertyStore::new(id),
                }),
                notifier: ChangeNotifier::new(),
            }
        });

        log::trace!("Created {} ({})", object.id, object.kind);
        Ok(object)
    }

    /// Publish the sequence 0 snapshot with reason `Initialized`
    pub fn initialize(&self) -> Result<Arc<Snapshot>> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| DataError::internal(format!("{} is being destroyed", self.id)))?;
        self.context
            .coordinator()
            .execute(move || this.announce())?
    }

    fn announce(&self) -> Result<Arc<Snapshot>> {
        self.context.coordinator().check_current("VersionedObject::initialize")?;

        let snapshot = {
            let mut state = self.state.lock();
            if state.initialized {
                return Err(DataError::invalid(format!("{} was already initialized", self.id)));
            }
            state.initialized = true;
            state.current.clone()
        };

        PendingNotification::new(snapshot.clone(), ChangeReason::Initialized).dispatch(&self.notifier);
        Ok(snapshot)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> &DataKind {
        &self.kind
    }

    pub fn context(&self) -> &Arc<DataContext> {
        &self.context
    }

    /// The live snapshot
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.state.lock().current.clone()
    }

    /// Sequence number of the most recent snapshot
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Construct an uninitialized update bound to this object and `container_updates`
    pub fn new_update(&self, container_updates: ContainerUpdates) -> Result<Arc<UpdateHandle>> {
        let this = self
            .weak_self
            .upgrade()
            .ok_or_else(|| DataError::internal(format!("{} is being destroyed", self.id)))?;
        Ok(UpdateHandle::new(this, container_updates))
    }

    /// Construct and initialize an update
    ///
    /// `container_updates` must map every container currently linking this
    /// object to that container's running update.
    pub fn create_update(&self, container_updates: ContainerUpdates) -> Result<Arc<UpdateHandle>> {
        let update = self.new_update(container_updates)?;
        update.initialize()?;
        Ok(update)
    }

    /// The running update, if any
    pub fn open_update(&self) -> Option<Arc<UpdateHandle>> {
        let state = self.state.lock();
        state.open_updates.values().find_map(|u| u.handle.upgrade())
    }

    pub fn has_running_update(&self) -> bool {
        !self.state.lock().open_updates.is_empty()
    }

    /// Increment the sequence, swap in a new snapshot and prepare its event
    ///
    /// Runs on the coordinator with the bookkeeping lock held; the returned
    /// notification must be dispatched after the lock is released.
    fn bump_version(
        &self,
        state: &mut ObjectState,
        reason: ChangeReason,
        metadata: Metadata,
    ) -> Result<(Arc<Snapshot>, PendingNotification)> {
        self.context.coordinator().check_current("VersionedObject::bump_version")?;

        let sequence = state
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| DataError::Overflow(format!("version sequence of {}", self.id)))?;
        let token = VersionToken::new(sequence, !state.open_updates.is_empty());
        let snapshot = Snapshot::new(self.weak_self.clone(), self.id, token, metadata);

        state.last_sequence = sequence;
        state.current = snapshot.clone();
        log::trace!("{} -> version {} ({})", self.id, token, reason);

        Ok((snapshot.clone(), PendingNotification::new(snapshot, reason)))
    }

    /// Register a running update; called on the coordinator by `UpdateHandle::initialize`
    pub(crate) fn begin_update(
        &self,
        update: UpdateId,
        handle: Weak<UpdateHandle>,
        phase: PhaseCell,
        held: Vec<HeldContainerUpdate>,
    ) -> Result<Arc<Snapshot>> {
        let outcome = {
            let mut state = self.state.lock();
            self.register_update(&mut state, update, handle, &phase, held)
        };

        match outcome {
            Ok((snapshot, pending)) => {
                pending.dispatch(&self.notifier);
                Ok(snapshot)
            }
            // Rejected container guards are released here, outside the lock
            Err((err, rejected)) => {
                drop(rejected);
                Err(err)
            }
        }
    }

    fn register_update(
        &self,
        state: &mut ObjectState,
        update: UpdateId,
        handle: Weak<UpdateHandle>,
        phase: &PhaseCell,
        held: Vec<HeldContainerUpdate>,
    ) -> std::result::Result<(Arc<Snapshot>, PendingNotification), (DataError, Vec<HeldContainerUpdate>)> {
        if phase.get() != UpdatePhase::Created {
            return Err((DataError::invalid(format!("{} is not in the created state", update)), held));
        }
        if !state.initialized {
            return Err((
                DataError::invalid(format!("{} has not been initialized", self.id)),
                held,
            ));
        }
        if !state.open_updates.is_empty() {
            return Err((
                DataError::invalid(format!("{} already has a running update", self.id)),
                held,
            ));
        }
        if let Some(container) = state
            .containers
            .keys()
            .find(|c| !held.iter().any(|h| h.container == **c))
        {
            return Err((
                DataError::internal(format!(
                    "{} is linked to container {} without update coverage",
                    self.id, container
                )),
                held,
            ));
        }

        if self.context.config().verbose_containers {
            log::debug!(
                "Creating {} for {} which has {} containers",
                update,
                self.id,
                state.containers.len()
            );
        }

        state.open_updates.insert(
            update,
            OpenUpdate {
                handle,
                guard: Weak::new(),
                held,
            },
        );
        phase.set(UpdatePhase::Running);

        // A new update keeps the current metadata
        let metadata = state.current.metadata().clone();
        match self.bump_version(state, ChangeReason::NewUpdate, metadata) {
            Ok(bumped) => Ok(bumped),
            Err(err) => {
                phase.set(UpdatePhase::Aborted);
                let held = state
                    .open_updates
                    .remove(&update)
                    .map(|u| u.held)
                    .unwrap_or_default();
                Err((err, held))
            }
        }
    }

    /// Finish a running update; called on the coordinator by `UpdateHandle`
    ///
    /// `force` skips the finish-guard check (drop fallback).
    pub(crate) fn finish_update(
        &self,
        update: UpdateId,
        phase: PhaseCell,
        metadata: Metadata,
        force: bool,
    ) -> Result<Option<Arc<Snapshot>>> {
        let (bumped, released) = {
            let mut state = self.state.lock();

            let guarded = match state.open_updates.get(&update) {
                None => return Ok(None),
                Some(open) => open.guard.strong_count() > 0,
            };
            if guarded {
                if !force {
                    return Err(DataError::invalid(format!(
                        "Attempting to finish {} which is still in use elsewhere",
                        update
                    )));
                }
                log::warn!("Finishing {} while finish guards are still alive", update);
            }

            let open = match state.open_updates.remove(&update) {
                Some(open) => open,
                None => return Ok(None),
            };
            match self.bump_version(&mut state, ChangeReason::UpdateFinished, metadata) {
                Ok(bumped) => {
                    phase.set(UpdatePhase::Finished);
                    (Ok(bumped), open.held)
                }
                Err(err) => {
                    // The update stays running
                    state.open_updates.insert(update, open);
                    (Err(err), Vec::new())
                }
            }
        };

        let result = bumped.map(|(snapshot, pending)| {
            pending.dispatch(&self.notifier);
            snapshot
        });

        // Releasing the container guards may let those updates finish or drop
        for held in &released {
            log::trace!(
                "{} releases guard on {} (container {})",
                update,
                held.guard.update_id(),
                held.update.object_id()
            );
        }
        drop(released);

        result.map(Some)
    }

    pub(crate) fn finish_guard_for(&self, update: UpdateId) -> Result<FinishGuard> {
        let mut state = self.state.lock();
        let open = state
            .open_updates
            .get_mut(&update)
            .ok_or_else(|| DataError::invalid(format!("{} is not running", update)))?;

        if let Some(guard) = FinishGuard::upgrade(&open.guard) {
            return Ok(guard);
        }
        let guard = FinishGuard::new(update);
        open.guard = guard.downgrade();
        Ok(guard)
    }

    // Properties

    /// Write (`Some`) or remove (`None`) a property through a running update
    pub fn set_property(
        &self,
        update: &UpdateHandle,
        definition: &Arc<PropertyDefinition>,
        value: Option<Value>,
        mode: ReplaceMode,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let access = WriteAccess {
            owner: update.object_id(),
            running: state.open_updates.contains_key(&update.id()),
        };
        state.properties.set(access, definition, value, mode).map(|_| ())
    }

    /// Read a property by key
    pub fn get_property(&self, key: &str, allow_missing: bool) -> Result<Option<Value>> {
        self.state.lock().properties.get(key, allow_missing)
    }

    /// Read a property, requiring it to be stored under `definition`
    pub fn get_defined_property(
        &self,
        definition: &PropertyDefinition,
        allow_missing: bool,
    ) -> Result<Option<Value>> {
        self.state.lock().properties.get_defined(definition, allow_missing)
    }

    /// Definitions of all stored properties, in key order
    pub fn list_properties(&self) -> Vec<Arc<PropertyDefinition>> {
        self.state.lock().properties.definitions()
    }

    // Containment

    /// Link this object into `container`
    ///
    /// Rejected with `InvalidOperation` while an update is running.
    pub(crate) fn add_container(&self, container: &DataContainer) -> Result<()> {
        let container_id = container.id();
        let mut state = self.state.lock();

        if !state.open_updates.is_empty() {
            return Err(DataError::invalid(format!(
                "Attempting to add {} to container {} while it has updates running",
                self.id, container_id
            )));
        }

        match state.containers.get_mut(&container_id) {
            Some(link) => {
                link.retain()?;
            }
            None => {
                let subscription = container.subscribe_teardown(self.weak_self.clone());
                state
                    .containers
                    .insert(container_id, ContainmentLink::new(subscription));
            }
        }

        if self.context.config().verbose_containers {
            log::debug!(
                "Linked {} into container {} (refcount {})",
                self.id,
                container_id,
                state.containers.get(&container_id).map(|l| l.refcount()).unwrap_or(0)
            );
        }
        Ok(())
    }

    /// Drop one link to `container_id`
    pub(crate) fn remove_container(&self, container_id: ObjectId) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            let last = match state.containers.get_mut(&container_id) {
                Some(link) => link.release().map_err(|e| {
                    log::error!("{}: {}", self.id, e);
                    e
                })?,
                None => {
                    log::error!(
                        "Attempting to remove {} from container {} which does not contain it",
                        self.id,
                        container_id
                    );
                    return Err(DataError::internal(format!(
                        "{} is not linked to container {}",
                        self.id, container_id
                    )));
                }
            };
            if last {
                state.containers.remove(&container_id)
            } else {
                None
            }
        };

        if self.context.config().verbose_containers {
            log::debug!(
                "Unlinked {} from container {}{}",
                self.id,
                container_id,
                if removed.is_some() { " (last link)" } else { "" }
            );
        }
        Ok(())
    }

    /// The container went away; forget every link to it
    pub(crate) fn container_destroyed(&self, container_id: ObjectId) {
        let removed = self.state.lock().containers.remove(&container_id);
        if removed.is_none() {
            log::warn!(
                "Container {} was destroyed but {} has no link to it",
                container_id,
                self.id
            );
        }
    }

    /// Ids of the containers currently linking this object
    pub fn container_ids(&self) -> Vec<ObjectId> {
        self.state.lock().containers.keys().copied().collect()
    }

    /// `(container, refcount)` pairs
    pub fn containers(&self) -> Vec<(ObjectId, u64)> {
        self.state
            .lock()
            .containers
            .iter()
            .map(|(id, link)| (*id, link.refcount()))
            .collect()
    }

    // Notifications

    /// Call `listener` on the coordinator after every version bump
    pub fn subscribe<F>(&self, listener: F) -> SubscriberId
    where
        F: Fn(&DataChanged) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    /// Receive change events through a channel
    pub fn subscribe_channel(&self) -> (SubscriberId, Receiver<DataChanged>) {
        self.notifier
            .subscribe_channel(self.context.config().notification_capacity)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.len()
    }
}

impl fmt::Debug for VersionedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
