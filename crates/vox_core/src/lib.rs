//! # vox_core - Vox Data Model Primitives
//!
//! Zero-dependency identifiers shared by every layer of the data model.
//! Identifiers are process-unique, cheap to copy and usable as map keys
//! by containers, update tables and bus clients alike.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod id;

pub use id::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::id::{ClientId, IdCounter, ObjectId, UpdateId};
}
