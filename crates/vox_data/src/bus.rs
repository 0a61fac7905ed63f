//! Object Bus - in-process stand-in for the remote-call boundary
//!
//! Worker processes (importers, exporters) never hold objects directly. They
//! talk to an [`ObjectBus`] through a [`BusClient`] using ids: objects and
//! updates are exported weakly, and the only strong references a client owns
//! are the updates it created. When a client goes away those references are
//! released, which auto-finishes anything it left running.

use crate::error::{DataError, Result};
use crate::event::{DataChanged, SubscriberId};
use crate::object::VersionedObject;
use crate::property::{PropertyDefinition, ReplaceMode};
use crate::snapshot::{Metadata, Snapshot};
use crate::update::{ContainerUpdates, UpdateHandle};
use crate::value::Value;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use vox_core::{ClientId, ObjectId, UpdateId};

/// Statistics about bus usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Clients connected so far
    pub clients_connected: u64,
    /// Updates created through the bus
    pub updates_created: u64,
    /// Updates finished explicitly through the bus
    pub updates_finished: u64,
    /// Update references released (explicitly or by client drop)
    pub updates_released: u64,
}

/// Registry of exported objects, updates and property definitions
pub struct ObjectBus {
    objects: RwLock<HashMap<ObjectId, Weak<VersionedObject>>>,
    updates: RwLock<HashMap<UpdateId, Weak<UpdateHandle>>>,
    properties: RwLock<HashMap<String, Arc<PropertyDefinition>>>,
    stats: RwLock<BusStats>,
}

impl ObjectBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(HashMap::new()),
            updates: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
            stats: RwLock::new(BusStats::default()),
        })
    }

    /// Make `object` reachable by id
    pub fn export(&self, object: &Arc<VersionedObject>) -> ObjectId {
        let id = object.id();
        self.objects.write().insert(id, Arc::downgrade(object));
        id
    }

    /// Stop exporting an object; returns whether it was exported
    pub fn withdraw(&self, id: ObjectId) -> bool {
        self.objects.write().remove(&id).is_some()
    }

    /// Make a property definition usable by name
    ///
    /// Registering the same definition twice is allowed; a different
    /// definition under an existing name is a `DuplicateKey`.
    pub fn register_property(&self, definition: Arc<PropertyDefinition>) -> Result<()> {
        let mut properties = self.properties.write();
        match properties.get(definition.name()) {
            Some(existing) if **existing != *definition => Err(DataError::DuplicateKey(format!(
                "property definition '{}'",
                definition.name()
            ))),
            Some(_) => Ok(()),
            None => {
                properties.insert(definition.name().to_string(), definition);
                Ok(())
            }
        }
    }

    pub fn property(&self, name: &str) -> Result<Arc<PropertyDefinition>> {
        self.properties
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::KeyNotFound(format!("property definition '{}'", name)))
    }

    pub fn object(&self, id: ObjectId) -> Result<Arc<VersionedObject>> {
        let found = self.objects.read().get(&id).and_then(Weak::upgrade);
        found.ok_or_else(|| {
            self.objects.write().remove(&id);
            DataError::ObjectNotFound(id.to_string())
        })
    }

    pub fn update(&self, id: UpdateId) -> Result<Arc<UpdateHandle>> {
        let found = self.updates.read().get(&id).and_then(Weak::upgrade);
        found.ok_or_else(|| {
            self.updates.write().remove(&id);
            DataError::ObjectNotFound(id.to_string())
        })
    }

    /// Number of update ids currently registered
    pub fn registered_updates(&self) -> usize {
        self.updates.read().len()
    }

    // Drop the registry entry for `id` once no handle is left alive
    fn forget_update(&self, id: UpdateId) {
        let mut updates = self.updates.write();
        if updates.get(&id).is_some_and(|u| u.strong_count() == 0) {
            updates.remove(&id);
        }
    }

    pub fn stats(&self) -> BusStats {
        self.stats.read().clone()
    }

    /// Open a client connection
    pub fn connect(self: &Arc<Self>, name: impl Into<String>) -> BusClient {
        let client = BusClient {
            id: ClientId::new(),
            name: name.into(),
            bus: self.clone(),
            refs: Mutex::new(HashMap::new()),
        };
        self.stats.write().clients_connected += 1;
        log::debug!("Client '{}' connected as {}", client.name, client.id);
        client
    }
}

/// A connection to the bus, standing in for one worker process
pub struct BusClient {
    id: ClientId,
    name: String,
    bus: Arc<ObjectBus>,
    // Strong references to the updates this client created
    refs: Mutex<HashMap<UpdateId, Arc<UpdateHandle>>>,
}

impl BusClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of update references the client currently holds
    pub fn held_updates(&self) -> usize {
        self.refs.lock().len()
    }

    /// Create and initialize an update on `object`
    ///
    /// `containers` maps each container of the object to the id of that
    /// container's running update.
    pub fn create_update(
        &self,
        object: ObjectId,
        containers: HashMap<ObjectId, UpdateId>,
    ) -> Result<UpdateId> {
        let object = self.bus.object(object)?;
        let coverage = containers
            .into_iter()
            .map(|(container, update)| -> Result<_> { Ok((container, self.bus.update(update)?)) })
            .collect::<Result<ContainerUpdates>>()?;

        let update = object.create_update(coverage)?;
        let id = update.id();

        {
            let mut updates = self.bus.updates.write();
            updates.retain(|_, u| u.strong_count() > 0);
            updates.insert(id, Arc::downgrade(&update));
        }
        self.refs.lock().insert(id, update);
        self.bus.stats.write().updates_created += 1;

        log::trace!("{} created {} on {}", self.id, id, object.id());
        Ok(id)
    }

    /// Current snapshot of `object`
    pub fn get_current_version(&self, object: ObjectId) -> Result<Arc<Snapshot>> {
        Ok(self.bus.object(object)?.current_snapshot())
    }

    /// Finish `update`; finishing twice is an `InvalidOperation`
    pub fn finish(&self, update: UpdateId, metadata: Metadata) -> Result<Arc<Snapshot>> {
        let handle = self.bus.update(update)?;
        let snapshot = handle
            .finish(metadata)
            .and_then(|s| s.ok_or_else(|| DataError::invalid("Finish() has already been called")))
            .map_err(|err| self.report("Finish", err))?;
        self.bus.stats.write().updates_finished += 1;
        Ok(snapshot)
    }

    /// Read a registered property; a value stored under another definition
    /// of the same name is a `DifferentDefinition`
    pub fn get_property(
        &self,
        object: ObjectId,
        key: &str,
        allow_missing: bool,
    ) -> Result<Option<Value>> {
        let object = self.bus.object(object)?;
        let definition = self.bus.property(key)?;
        object
            .get_defined_property(&definition, allow_missing)
            .map_err(|err| self.report("GetProperty", err))
    }

    /// Write (`Some`) or remove (`None`) a registered property through `update`
    pub fn set_property(
        &self,
        update: UpdateId,
        key: &str,
        value: Option<Value>,
        mode: ReplaceMode,
    ) -> Result<()> {
        let handle = self.bus.update(update)?;
        let definition = self.bus.property(key)?;
        handle
            .object()
            .set_property(&handle, &definition, value, mode)
            .map_err(|err| self.report("SetProperty", err))
    }

    /// Names of the properties stored on `object`
    pub fn list_properties(&self, object: ObjectId) -> Result<Vec<String>> {
        Ok(self
            .bus
            .object(object)?
            .list_properties()
            .iter()
            .map(|d| d.name().to_string())
            .collect())
    }

    /// Receive `DataChanged` events of `object` asynchronously
    pub fn subscribe(&self, object: ObjectId) -> Result<(SubscriberId, Receiver<DataChanged>)> {
        Ok(self.bus.object(object)?.subscribe_channel())
    }

    /// Drop the client's reference to `update`
    ///
    /// If it was the last reference and the update is still running, it is
    /// finished with the aborted status.
    pub fn release_update(&self, update: UpdateId) -> Result<()> {
        let released = self.refs.lock().remove(&update);
        let handle = released.ok_or_else(|| DataError::ObjectNotFound(update.to_string()))?;
        self.bus.stats.write().updates_released += 1;
        drop(handle);
        self.bus.forget_update(update);
        Ok(())
    }

    fn report(&self, call: &str, err: DataError) -> DataError {
        log::debug!("{} {}() failed with {}: {}", self.id, call, err.name(), err);
        err
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        let refs: Vec<_> = self.refs.lock().drain().collect();
        if refs.is_empty() {
            return;
        }
        log::debug!(
            "Client '{}' disconnected, releasing {} updates",
            self.name,
            refs.len()
        );
        self.bus.stats.write().updates_released += refs.len() as u64;
        let ids: Vec<_> = refs.iter().map(|(id, _)| *id).collect();
        drop(refs);
        for id in ids {
            self.bus.forget_update(id);
        }
    }
}
