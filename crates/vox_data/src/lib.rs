//! # vox_data - Versioned Data Objects
//!
//! Long-lived data objects (volumes, surfaces, raw projection streams) are
//! mutated through transactional updates while the rest of the application
//! observes immutable snapshots of them.
//!
//! ## Architecture
//!
//! ```text
//! Importer ──► BusClient ──┐
//!                          ├──► UpdateHandle ──► VersionedObject ──► Snapshot ──► Listeners
//! Panel ───────────────────┘         ▲                 │
//!                                    │                 └── containers (refcount + teardown)
//!                       FinishGuards of member updates
//! ```
//!
//! ## Key Concepts
//!
//! - **VersionedObject**: owns the current snapshot and a monotonic sequence
//! - **Snapshot**: immutable version record (`"n"` or `"n+"` while updating)
//! - **UpdateHandle**: single-writer permit; dropping it unfinished aborts it
//! - **FinishGuard**: blocks an update from finishing while it is alive
//! - **DataContainer**: container role; member updates guard container updates
//! - **Coordinator**: the one thread on which versions are bumped

pub mod bus;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod guard;
pub mod object;
pub mod property;
pub mod snapshot;
pub mod update;
pub mod value;

pub use bus::{BusClient, BusStats, ObjectBus};
pub use config::DataModelConfig;
pub use container::{ContainerData, DataContainer};
pub use coordinator::{Coordinator, DataContext};
pub use error::{ConfigError, DataError, Result};
pub use event::{ChangeListener, ChangeReason, DataChanged, SubscriberId};
pub use guard::FinishGuard;
pub use object::{DataKind, VersionedObject};
pub use property::{PropertyDefinition, PropertyStore, PropertyType, ReplaceMode};
pub use snapshot::{Metadata, Snapshot, VersionToken};
pub use update::{aborted_metadata, error_metadata, ContainerUpdates, UpdateHandle, UpdatePhase, UPDATE_ABORTED};
pub use value::{Value, ValueKind};

pub use vox_core::{ClientId, ObjectId, UpdateId};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{BusClient, ObjectBus};
    pub use crate::container::{ContainerData, DataContainer};
    pub use crate::coordinator::DataContext;
    pub use crate::error::{DataError, Result};
    pub use crate::object::{DataKind, VersionedObject};
    pub use crate::property::{PropertyDefinition, PropertyType, ReplaceMode};
    pub use crate::snapshot::{Metadata, Snapshot};
    pub use crate::update::{ContainerUpdates, UpdateHandle};
    pub use crate::value::Value;
    pub use vox_core::prelude::*;
}
