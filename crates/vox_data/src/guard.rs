//! Finish guards
//!
//! A [`FinishGuard`] is a shared token whose mere existence prevents the
//! update that issued it from finishing. Member updates hold a guard on each
//! container update they were opened under, so a composite object cannot be
//! declared finished while one of its children is still being written.

use std::fmt;
use std::sync::{Arc, Weak};
use vox_core::UpdateId;

pub(crate) struct GuardToken {
    update: UpdateId,
}

/// Token blocking `finish()` of the update that issued it
#[derive(Clone)]
pub struct FinishGuard {
    token: Arc<GuardToken>,
}

impl FinishGuard {
    pub(crate) fn new(update: UpdateId) -> Self {
        Self {
            token: Arc::new(GuardToken { update }),
        }
    }

    /// Re-acquire a cached guard if any clone of it is still alive
    pub(crate) fn upgrade(weak: &Weak<GuardToken>) -> Option<Self> {
        weak.upgrade().map(|token| Self { token })
    }

    pub(crate) fn downgrade(&self) -> Weak<GuardToken> {
        Arc::downgrade(&self.token)
    }

    /// The update this guard blocks
    pub fn update_id(&self) -> UpdateId {
        self.token.update
    }

    /// Whether two guards are the same shared instance
    pub fn same_as(&self, other: &FinishGuard) -> bool {
        Arc::ptr_eq(&self.token, &other.token)
    }
}

impl fmt::Debug for FinishGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FinishGuard({})", self.token.update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_cache_returns_same_instance() {
        let guard = FinishGuard::new(UpdateId::new());
        let weak = guard.downgrade();

        let again = FinishGuard::upgrade(&weak).unwrap();
        assert!(guard.same_as(&again));

        drop(guard);
        drop(again);
        assert!(FinishGuard::upgrade(&weak).is_none());
    }
}
