//! Containment
//!
//! A [`DataContainer`] is the container role: it links children to itself
//! and tells them when it goes away. Each child keeps one
//! [`ContainmentLink`] per container (refcount plus teardown subscription).
//! [`ContainerData`] is a composite versioned object built on that role.

use crate::coordinator::DataContext;
use crate::error::{DataError, Result};
use crate::object::{DataKind, VersionedObject};
use crate::update::{ContainerUpdates, UpdateHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use vox_core::ObjectId;

/// Container-destroyed notification source
pub(crate) struct TeardownSignal {
    container: ObjectId,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Weak<VersionedObject>>>,
}

impl TeardownSignal {
    fn new(container: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            container,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn subscribe(self: &Arc<Self>, object: Weak<VersionedObject>) -> TeardownSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, object);
        TeardownSubscription {
            signal: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    fn fire(&self) {
        let subscribers: Vec<_> = self.subscribers.lock().drain().map(|(_, o)| o).collect();
        for object in subscribers.iter().filter_map(Weak::upgrade) {
            object.container_destroyed(self.container);
        }
    }
}

/// Keeps an object subscribed to its container's teardown until dropped
pub(crate) struct TeardownSubscription {
    signal: Weak<TeardownSignal>,
    id: u64,
}

impl Drop for TeardownSubscription {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.unsubscribe(self.id);
        }
    }
}

/// One object's membership in one container
pub(crate) struct ContainmentLink {
    refcount: u64,
    _subscription: TeardownSubscription,
}

impl ContainmentLink {
    pub fn new(subscription: TeardownSubscription) -> Self {
        Self {
            refcount: 1,
            _subscription: subscription,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_refcount(subscription: TeardownSubscription, refcount: u64) -> Self {
        Self {
            refcount,
            _subscription: subscription,
        }
    }

    pub fn refcount(&self) -> u64 {
        self.refcount
    }

    pub fn retain(&mut self) -> Result<()> {
        self.refcount = self
            .refcount
            .checked_add(1)
            .ok_or_else(|| DataError::Overflow("container link refcount".to_string()))?;
        Ok(())
    }

    /// Drop one reference; `true` when it was the last one
    pub fn release(&mut self) -> Result<bool> {
        if self.refcount == 0 {
            return Err(DataError::internal("container link refcount is already zero"));
        }
        self.refcount -= 1;
        Ok(self.refcount == 0)
    }
}

/// The container role
///
/// Dropping the role tells every linked child that the container is gone.
pub struct DataContainer {
    id: ObjectId,
    signal: Arc<TeardownSignal>,
}

impl DataContainer {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            signal: TeardownSignal::new(id),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Link `child` into this container
    pub fn add_child(&self, child: &VersionedObject) -> Result<()> {
        child.add_container(self)
    }

    /// Drop one link from `child` to this container
    pub fn remove_child(&self, child: &VersionedObject) -> Result<()> {
        child.remove_container(self.id)
    }

    pub(crate) fn subscribe_teardown(&self, object: Weak<VersionedObject>) -> TeardownSubscription {
        self.signal.subscribe(object)
    }
}

impl fmt::Debug for DataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataContainer({})", self.id)
    }
}

impl Drop for DataContainer {
    fn drop(&mut self) {
        self.signal.fire();
    }
}

/// A named composite object holding children by key
pub struct ContainerData {
    name: String,
    object: Arc<VersionedObject>,
    role: DataContainer,
    elements: RwLock<BTreeMap<String, Arc<VersionedObject>>>,
}

impl ContainerData {
    pub fn create(context: &Arc<DataContext>, name: impl Into<String>) -> Result<Arc<Self>> {
        let object = VersionedObject::create(context, DataKind::Container)?;
        let role = DataContainer::new(object.id());
        Ok(Arc::new(Self {
            name: name.into(),
            object,
            role,
            elements: RwLock::new(BTreeMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    /// The container's own versioned object
    pub fn object(&self) -> &Arc<VersionedObject> {
        &self.object
    }

    pub fn role(&self) -> &DataContainer {
        &self.role
    }

    fn check_update(&self, update: &UpdateHandle) -> Result<()> {
        if update.object_id() != self.object.id() {
            return Err(DataError::invalid(format!(
                "{} does not belong to container '{}'",
                update.id(),
                self.name
            )));
        }
        if !update.running() {
            return Err(DataError::invalid(format!("{} is not running", update.id())));
        }
        Ok(())
    }

    /// Store `child` under `key`, replacing any previous element
    pub fn insert_element(
        &self,
        key: impl Into<String>,
        child: Arc<VersionedObject>,
        update: &UpdateHandle,
    ) -> Result<()> {
        self.check_update(update)?;
        let key = key.into();

        let mut elements = self.elements.write();
        // Link the new child before unlinking the old one, the same object may be re-inserted
        self.role.add_child(&child)?;
        if let Some(previous) = elements.insert(key, child) {
            self.role.remove_child(&previous)?;
        }
        Ok(())
    }

    /// Remove and return the element stored under `key`
    pub fn remove_element(&self, key: &str, update: &UpdateHandle) -> Result<Arc<VersionedObject>> {
        self.check_update(update)?;

        let mut elements = self.elements.write();
        let child = elements
            .remove(key)
            .ok_or_else(|| DataError::KeyNotFound(format!("element '{}' in '{}'", key, self.name)))?;
        self.role.remove_child(&child)?;
        Ok(child)
    }

    pub fn get_element(&self, key: &str) -> Option<Arc<VersionedObject>> {
        self.elements.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.elements.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Arc<VersionedObject>> {
        self.elements.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }

    /// Open an update on `child` under this container's running update
    ///
    /// The child must not belong to any other container.
    pub fn child_update(
        &self,
        child: &VersionedObject,
        own_update: &Arc<UpdateHandle>,
    ) -> Result<Arc<UpdateHandle>> {
        self.check_update(own_update)?;
        let mut coverage = ContainerUpdates::new();
        coverage.insert(self.id(), own_update.clone());
        child.create_update(coverage)
    }
}

impl fmt::Debug for ContainerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerData")
            .field("name", &self.name)
            .field("id", &self.object.id())
            .field("len", &self.len())
            .finish()
    }
}
