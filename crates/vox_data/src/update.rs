//! Update handles - transactional permits to mutate a versioned object
//!
//! An [`UpdateHandle`] moves through `Created -> Running -> Finished`.
//! Initialization fails (`Created -> Aborted`) unless the caller supplied a
//! running update for every container the object currently belongs to; the
//! handle takes a finish guard on each of them, which keeps those container
//! updates open until this one finishes. A running handle that is dropped
//! finishes itself with an error status.

use crate::error::{DataError, Result};
use crate::guard::FinishGuard;
use crate::object::VersionedObject;
use crate::property::{PropertyDefinition, ReplaceMode};
use crate::snapshot::{Metadata, Snapshot};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use vox_core::{ObjectId, UpdateId};

/// Explicit container coverage: container id -> that container's open update
pub type ContainerUpdates = HashMap<ObjectId, Arc<UpdateHandle>>;

/// Name of the error recorded when a running update is dropped
pub const UPDATE_ABORTED: &str = "vox.DataUpdateAborted";

/// Lifecycle of an update handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpdatePhase {
    /// Constructed, not yet initialized
    Created = 0,
    /// Registered on the object; writes are allowed
    Running = 1,
    /// Finished, explicitly or by the drop fallback
    Finished = 2,
    /// Initialization was rejected
    Aborted = 3,
}

impl UpdatePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Finished,
            _ => Self::Aborted,
        }
    }
}

/// Phase storage shared with jobs running on the coordinator
#[derive(Clone)]
pub(crate) struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(UpdatePhase::Created as u8)))
    }

    pub fn get(&self) -> UpdatePhase {
        UpdatePhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: UpdatePhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// A container update held by a member update until it finishes
pub(crate) struct HeldContainerUpdate {
    // Declared first so the guard is released before the update reference
    pub guard: FinishGuard,
    pub update: Arc<UpdateHandle>,
    pub container: ObjectId,
}

/// Status metadata describing a failed update: `{"Status": {"Error": {..}}}`
pub fn error_metadata(err: &DataError) -> Metadata {
    let message = match err {
        DataError::UpdateAborted(msg) => msg.clone(),
        other => other.to_string(),
    };
    let error = serde_json::json!({
        "Name": err.name(),
        "Message": message,
    });
    let mut status = Metadata::new();
    status.insert("Error".to_string(), error);

    let mut metadata = Metadata::new();
    metadata.insert("Status".to_string(), serde_json::Value::Object(status));
    metadata
}

/// Metadata recorded when a running update is dropped without `finish()`
pub fn aborted_metadata() -> Metadata {
    error_metadata(&DataError::UpdateAborted(
        "The update was not finished properly".into(),
    ))
}

/// Transactional permit to mutate a [`VersionedObject`]
pub struct UpdateHandle {
    id: UpdateId,
    object: Arc<VersionedObject>,
    weak_self: Weak<UpdateHandle>,
    phase: PhaseCell,
    // Supplied coverage, consumed by initialize()
    container_updates: Mutex<Option<ContainerUpdates>>,
}

impl UpdateHandle {
    pub(crate) fn new(object: Arc<VersionedObject>, container_updates: ContainerUpdates) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id: UpdateId::new(),
            object,
            weak_self: weak_self.clone(),
            phase: PhaseCell::new(),
            container_updates: Mutex::new(Some(container_updates)),
        })
    }

    pub fn id(&self) -> UpdateId {
        self.id
    }

    pub fn object(&self) -> &Arc<VersionedObject> {
        &self.object
    }

    pub fn object_id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase.get()
    }

    pub fn running(&self) -> bool {
        self.phase.get() == UpdatePhase::Running
    }

    /// Validate container coverage, take the container guards and start running
    ///
    /// Returns the `NewUpdate` snapshot.
    pub fn initialize(&self) -> Result<Arc<Snapshot>> {
        let supplied = self
            .container_updates
            .lock()
            .take()
            .ok_or_else(|| DataError::invalid(format!("{} was already initialized", self.id)))?;

        let result = self.acquire_container_guards(supplied).and_then(|held| {
            let object = self.object.clone();
            let id = self.id;
            let handle = self.weak_self.clone();
            let phase = self.phase.clone();
            self.object
                .context()
                .coordinator()
                .execute(move || object.begin_update(id, handle, phase, held))?
        });

        if result.is_err() {
            self.phase.set(UpdatePhase::Aborted);
        }
        result
    }

    fn acquire_container_guards(
        &self,
        mut supplied: ContainerUpdates,
    ) -> Result<Vec<HeldContainerUpdate>> {
        let containers = self.object.container_ids();
        let mut held = Vec::with_capacity(containers.len());

        for container in containers {
            let update = supplied.remove(&container).ok_or_else(|| {
                DataError::KeyNotFound(format!(
                    "{} is in container {} but no update for the container was supplied",
                    self.object.id(),
                    container
                ))
            })?;
            if update.object_id() != container {
                return Err(DataError::invalid(format!(
                    "update {} supplied for container {} belongs to {}",
                    update.id(),
                    container,
                    update.object_id()
                )));
            }
            // Fails if the container update is not running
            let guard = update.create_finish_guard()?;
            held.push(HeldContainerUpdate {
                guard,
                update,
                container,
            });
        }

        if !supplied.is_empty() {
            log::trace!(
                "{}: ignoring {} container updates for containers not linking {}",
                self.id,
                supplied.len(),
                self.object.id()
            );
        }
        Ok(held)
    }

    /// Obtain the guard blocking this update's `finish()`
    ///
    /// Repeated calls return the same instance while any clone of it lives.
    pub fn create_finish_guard(&self) -> Result<FinishGuard> {
        self.object.finish_guard_for(self.id)
    }

    /// Finish the update with `metadata`
    ///
    /// Returns `Ok(None)` if the update is not running (already finished,
    /// never initialized or aborted). Fails with `InvalidOperation` while a
    /// finish guard is alive.
    pub fn finish(&self, metadata: Metadata) -> Result<Option<Arc<Snapshot>>> {
        self.finish_inner(metadata, false)
    }

    fn finish_inner(&self, metadata: Metadata, force: bool) -> Result<Option<Arc<Snapshot>>> {
        if !self.running() {
            return Ok(None);
        }
        let object = self.object.clone();
        let id = self.id;
        let phase = self.phase.clone();
        self.object
            .context()
            .coordinator()
            .execute(move || object.finish_update(id, phase, metadata, force))?
    }

    /// Write a property of the object through this update
    pub fn set_property(
        &self,
        definition: &Arc<PropertyDefinition>,
        value: impl Into<Value>,
        mode: ReplaceMode,
    ) -> Result<()> {
        self.object.set_property(self, definition, Some(value.into()), mode)
    }

    /// Remove a property of the object through this update
    pub fn remove_property(&self, definition: &Arc<PropertyDefinition>, mode: ReplaceMode) -> Result<()> {
        self.object.set_property(self, definition, None, mode)
    }
}

impl fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("id", &self.id)
            .field("object", &self.object.id())
            .field("phase", &self.phase.get())
            .finish()
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        if !self.running() {
            return;
        }
        match self.finish_inner(aborted_metadata(), true) {
            Ok(Some(snapshot)) => {
                if self.object.context().config().warn_on_aborted_updates {
                    log::warn!(
                        "{} on {} was dropped without being finished; finished as aborted at version {}",
                        self.id,
                        self.object.id(),
                        snapshot.version_string()
                    );
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to finish dropped {}: {}", self.id, e),
        }
    }
}
