//! Immutable per-version descriptions of a versioned object
//!
//! A [`Snapshot`] is produced by every version bump and is never edited
//! afterwards; it is only superseded. Snapshots refer back to their object
//! weakly, so holding on to an old snapshot does not keep the object alive.

use crate::error::{DataError, Result};
use crate::object::VersionedObject;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use vox_core::ObjectId;

/// Free-form metadata attached to a snapshot
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Version token: the sequence number, marked pending while an update runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken {
    sequence: u64,
    pending: bool,
}

impl VersionToken {
    pub fn new(sequence: u64, pending: bool) -> Self {
        Self { sequence, pending }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether other updates were outstanding when the token was issued
    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.sequence, if self.pending { "+" } else { "" })
    }
}

impl FromStr for VersionToken {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        let (digits, pending) = match s.strip_suffix('+') {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        let sequence = digits
            .parse()
            .map_err(|_| DataError::invalid(format!("malformed version token '{}'", s)))?;
        Ok(Self { sequence, pending })
    }
}

/// One point in an object's history
pub struct Snapshot {
    object: Weak<VersionedObject>,
    object_id: ObjectId,
    token: VersionToken,
    created_at: SystemTime,
    metadata: Metadata,
}

impl Snapshot {
    /// Only the object's bookkeeping builds snapshots
    pub(crate) fn new(
        object: Weak<VersionedObject>,
        object_id: ObjectId,
        token: VersionToken,
        metadata: Metadata,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            object_id,
            token,
            created_at: SystemTime::now(),
            metadata,
        })
    }

    /// The object this snapshot describes, if it is still alive
    pub fn object(&self) -> Option<Arc<VersionedObject>> {
        self.object.upgrade()
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn token(&self) -> VersionToken {
        self.token
    }

    pub fn sequence(&self) -> u64 {
        self.token.sequence
    }

    /// The textual version, e.g. `"3"` or `"4+"`
    pub fn version_string(&self) -> String {
        self.token.to_string()
    }

    pub fn update_is_running(&self) -> bool {
        self.token.pending
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Creation time as milliseconds since the Unix epoch
    pub fn unix_millis(&self) -> u128 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether `other` is a later version of the same object
    pub fn is_superseded_by(&self, other: &Snapshot) -> bool {
        self.object_id == other.object_id && other.token.sequence > self.token.sequence
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("object", &self.object_id)
            .field("version", &self.token.to_string())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        assert_eq!(VersionToken::new(3, false).to_string(), "3");
        assert_eq!(VersionToken::new(4, true).to_string(), "4+");
    }

    #[test]
    fn test_token_parse() {
        let token: VersionToken = "12+".parse().unwrap();
        assert_eq!(token.sequence(), 12);
        assert!(token.is_pending());
        assert!("x+".parse::<VersionToken>().is_err());
    }

    #[test]
    fn test_snapshot_does_not_keep_object_alive() {
        let id = ObjectId::new();
        let snapshot = Snapshot::new(Weak::new(), id, VersionToken::new(0, false), Metadata::new());
        assert!(snapshot.object().is_none());
        assert_eq!(snapshot.object_id(), id);
        assert!(snapshot.unix_millis() > 0);
    }

    #[test]
    fn test_superseded() {
        let id = ObjectId::new();
        let a = Snapshot::new(Weak::new(), id, VersionToken::new(1, true), Metadata::new());
        let b = Snapshot::new(Weak::new(), id, VersionToken::new(2, false), Metadata::new());
        assert!(a.is_superseded_by(&b));
        assert!(!b.is_superseded_by(&a));
    }
}
