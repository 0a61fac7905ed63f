//! Typed per-object property storage
//!
//! Each versioned object carries a [`PropertyStore`] mapping keys to a
//! definition and a value. The store only changes through a running update
//! of its owning object; the owner checks that before handing out write
//! access, and the store re-checks it here.

use crate::error::{DataError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use vox_core::ObjectId;

/// Type descriptor a property value is checked against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Bool,
    Int,
    Float,
    String,
    Vec3,
    /// RGBA color stored as a `Vec4`
    Color,
    /// Homogeneous list
    List(Box<PropertyType>),
    Map,
    Bytes,
    /// Accepts every value
    Any,
}

impl PropertyType {
    /// Whether `value` may be stored under this type
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Bool, Value::Bool(_))
            | (Self::Int, Value::Int(_))
            | (Self::Float, Value::Float(_))
            | (Self::String, Value::String(_))
            | (Self::Vec3, Value::Vec3(_))
            | (Self::Color, Value::Vec4(_))
            | (Self::Map, Value::Object(_))
            | (Self::Bytes, Value::Bytes(_)) => true,
            (Self::List(inner), Value::Array(items)) => items.iter().all(|v| inner.check(v)),
            _ => false,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(inner) => write!(f, "List<{}>", inner),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A named, typed property key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    name: String,
    ty: PropertyType,
    #[serde(default)]
    description: Option<String>,
}

impl PropertyDefinition {
    /// Create a shared definition
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ty,
            description: None,
        })
    }

    /// Create a shared definition with a human-readable description
    pub fn with_description(
        name: impl Into<String>,
        ty: PropertyType,
        description: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ty,
            description: Some(description.into()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &PropertyType {
        &self.ty
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Type-check a value against this definition
    pub fn verify(&self, value: &Value) -> Result<()> {
        if self.ty.check(value) {
            Ok(())
        } else {
            Err(DataError::TypeMismatch {
                key: self.name.clone(),
                expected: self.ty.to_string(),
                found: value.kind(),
            })
        }
    }
}

/// How a write treats an existing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplaceMode {
    /// Fail with `DuplicateKey` if the key exists
    #[default]
    Insert,
    /// Always write
    InsertOrReplace,
    /// Fail with `KeyNotFound` if the key is absent
    ReplaceExisting,
    /// Fail with `DuplicateKey` only if an existing entry differs
    InsertOrSame,
}

impl ReplaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "Insert",
            Self::InsertOrReplace => "InsertOrReplace",
            Self::ReplaceExisting => "ReplaceExisting",
            Self::InsertOrSame => "InsertOrSame",
        }
    }
}

impl FromStr for ReplaceMode {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Insert" => Ok(Self::Insert),
            "InsertOrReplace" => Ok(Self::InsertOrReplace),
            "ReplaceExisting" => Ok(Self::ReplaceExisting),
            "InsertOrSame" => Ok(Self::InsertOrSame),
            other => Err(DataError::KeyNotFound(format!("unknown replace mode '{}'", other))),
        }
    }
}

impl fmt::Display for ReplaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of the update state a write is attempted under
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteAccess {
    /// Object the update was opened on
    pub owner: ObjectId,
    /// Whether that update is still running
    pub running: bool,
}

#[derive(Debug, Clone)]
struct PropertyEntry {
    definition: Arc<PropertyDefinition>,
    value: Value,
}

/// Key/value property map owned by one versioned object
#[derive(Debug)]
pub struct PropertyStore {
    owner: ObjectId,
    entries: BTreeMap<String, PropertyEntry>,
}

impl PropertyStore {
    pub(crate) fn new(owner: ObjectId) -> Self {
        Self {
            owner,
            entries: BTreeMap::new(),
        }
    }

    /// Look up a value by key
    ///
    /// Missing keys yield `Ok(None)` when `allow_missing` is set and
    /// `KeyNotFound` otherwise.
    pub fn get(&self, key: &str, allow_missing: bool) -> Result<Option<Value>> {
        match self.entries.get(key) {
            Some(entry) => Ok(Some(entry.value.clone())),
            None if allow_missing => Ok(None),
            None => Err(DataError::KeyNotFound(format!("property '{}'", key))),
        }
    }

    /// Look up a value, requiring it to be stored under `definition`
    pub fn get_defined(
        &self,
        definition: &PropertyDefinition,
        allow_missing: bool,
    ) -> Result<Option<Value>> {
        match self.entries.get(definition.name()) {
            Some(entry) if *entry.definition != *definition => {
                Err(DataError::DifferentDefinition(definition.name().to_string()))
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None if allow_missing => Ok(None),
            None => Err(DataError::KeyNotFound(format!("property '{}'", definition.name()))),
        }
    }

    /// Definition stored for `key`, if any
    pub fn definition(&self, key: &str) -> Option<Arc<PropertyDefinition>> {
        self.entries.get(key).map(|e| e.definition.clone())
    }

    /// All stored definitions in key order
    pub fn definitions(&self) -> Vec<Arc<PropertyDefinition>> {
        self.entries.values().map(|e| e.definition.clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write or remove (`value == None`) a property
    ///
    /// Returns whether the store changed.
    pub(crate) fn set(
        &mut self,
        access: WriteAccess,
        definition: &Arc<PropertyDefinition>,
        value: Option<Value>,
        mode: ReplaceMode,
    ) -> Result<bool> {
        if access.owner != self.owner {
            return Err(DataError::invalid(format!(
                "update belongs to {}, not {}",
                access.owner, self.owner
            )));
        }
        if !access.running {
            return Err(DataError::invalid("update has already finished"));
        }
        if let Some(v) = &value {
            definition.verify(v)?;
        }

        let key = definition.name();
        let existing = self.entries.get(key);
        match mode {
            ReplaceMode::Insert => {
                if existing.is_some() {
                    return Err(DataError::DuplicateKey(format!("property '{}'", key)));
                }
            }
            ReplaceMode::InsertOrReplace => {}
            ReplaceMode::ReplaceExisting => {
                if existing.is_none() {
                    return Err(DataError::KeyNotFound(format!("property '{}' to replace", key)));
                }
            }
            ReplaceMode::InsertOrSame => {
                if let Some(old) = existing {
                    if *old.definition != **definition || Some(&old.value) != value.as_ref() {
                        return Err(DataError::DuplicateKey(format!(
                            "property '{}' exists with different definition or value",
                            key
                        )));
                    }
                    return Ok(false);
                }
            }
        }

        match value {
            Some(value) => {
                self.entries.insert(
                    key.to_string(),
                    PropertyEntry {
                        definition: definition.clone(),
                        value,
                    },
                );
                Ok(true)
            }
            None => Ok(self.entries.remove(key).is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (PropertyStore, WriteAccess) {
        let owner = ObjectId::new();
        (PropertyStore::new(owner), WriteAccess { owner, running: true })
    }

    #[test]
    fn test_insert_rejects_existing_key() {
        let (mut store, access) = store();
        let name = PropertyDefinition::new("name", PropertyType::String);

        store.set(access, &name, Some("a".into()), ReplaceMode::Insert).unwrap();
        let err = store.set(access, &name, Some("b".into()), ReplaceMode::Insert).unwrap_err();
        assert!(matches!(err, DataError::DuplicateKey(_)));
        assert_eq!(store.get("name", false).unwrap(), Some(Value::from("a")));
    }

    #[test]
    fn test_insert_or_same() {
        let (mut store, access) = store();
        let level = PropertyDefinition::new("level", PropertyType::Int);

        assert!(store.set(access, &level, Some(3.into()), ReplaceMode::InsertOrSame).unwrap());
        assert!(!store.set(access, &level, Some(3.into()), ReplaceMode::InsertOrSame).unwrap());
        let err = store.set(access, &level, Some(4.into()), ReplaceMode::InsertOrSame).unwrap_err();
        assert!(matches!(err, DataError::DuplicateKey(_)));
    }

    #[test]
    fn test_replace_existing_requires_key() {
        let (mut store, access) = store();
        let level = PropertyDefinition::new("level", PropertyType::Int);

        let err = store.set(access, &level, Some(1.into()), ReplaceMode::ReplaceExisting).unwrap_err();
        assert!(matches!(err, DataError::KeyNotFound(_)));

        store.set(access, &level, Some(1.into()), ReplaceMode::InsertOrReplace).unwrap();
        store.set(access, &level, Some(2.into()), ReplaceMode::ReplaceExisting).unwrap();
        assert_eq!(store.get("level", false).unwrap(), Some(Value::from(2)));
    }

    #[test]
    fn test_remove_with_none() {
        let (mut store, access) = store();
        let level = PropertyDefinition::new("level", PropertyType::Int);
        store.set(access, &level, Some(1.into()), ReplaceMode::Insert).unwrap();

        assert!(store.set(access, &level, None, ReplaceMode::ReplaceExisting).unwrap());
        assert!(store.is_empty());
        assert_eq!(store.get("level", true).unwrap(), None);
    }

    #[test]
    fn test_type_checked_before_storage() {
        let (mut store, access) = store();
        let color = PropertyDefinition::new("color", PropertyType::Color);

        let err = store.set(access, &color, Some("red".into()), ReplaceMode::Insert).unwrap_err();
        assert!(matches!(err, DataError::TypeMismatch { .. }));
        assert!(!store.contains("color"));
    }

    #[test]
    fn test_write_requires_running_update_of_owner() {
        let (mut store, access) = store();
        let level = PropertyDefinition::new("level", PropertyType::Int);

        let finished = WriteAccess { running: false, ..access };
        assert!(matches!(
            store.set(finished, &level, Some(1.into()), ReplaceMode::Insert),
            Err(DataError::InvalidOperation(_))
        ));

        let foreign = WriteAccess { owner: ObjectId::new(), running: true };
        assert!(matches!(
            store.set(foreign, &level, Some(1.into()), ReplaceMode::Insert),
            Err(DataError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_get_missing_and_different_definition() {
        let (mut store, access) = store();
        assert!(matches!(store.get("absent", false), Err(DataError::KeyNotFound(_))));

        let as_int = PropertyDefinition::new("value", PropertyType::Int);
        let as_any = PropertyDefinition::new("value", PropertyType::Any);
        store.set(access, &as_int, Some(1.into()), ReplaceMode::Insert).unwrap();
        assert!(matches!(
            store.get_defined(&as_any, false),
            Err(DataError::DifferentDefinition(_))
        ));
    }

    #[test]
    fn test_list_type_checks_items() {
        let ty = PropertyType::List(Box::new(PropertyType::Int));
        assert!(ty.check(&Value::Array(vec![1.into(), 2.into()])));
        assert!(!ty.check(&Value::Array(vec![1.into(), "x".into()])));
        assert_eq!(ty.to_string(), "List<Int>");
    }

    #[test]
    fn test_replace_mode_parse() {
        assert_eq!("InsertOrSame".parse::<ReplaceMode>().unwrap(), ReplaceMode::InsertOrSame);
        assert!("Upsert".parse::<ReplaceMode>().is_err());
    }
}
