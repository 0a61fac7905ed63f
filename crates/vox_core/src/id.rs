//! Process-unique identifiers
//!
//! Every versioned object, update handle and bus client gets an identifier
//! from a monotonically increasing counter. Identifiers are never reused
//! within a process, so a stale identifier simply fails to resolve.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe monotonic counter backing the identifier types
pub struct IdCounter {
    next: AtomicU64,
}

impl IdCounter {
    /// Create a counter whose first value is `start`
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Take the next value
    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the value the next call to [`IdCounter::next`] returns
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdCounter {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a fresh identifier
            pub fn new() -> Self {
                static COUNTER: IdCounter = IdCounter::starting_at(1);
                Self(COUNTER.next())
            }

            /// Rebuild an identifier from its raw value
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw value
            #[inline]
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a versioned object; also names the object when it acts as a container
    ObjectId,
    "object"
);

define_id!(
    /// Identity of an update handle
    UpdateId,
    "update"
);

define_id!(
    /// Identity of a client connected to the object bus
    ClientId,
    "client"
);
