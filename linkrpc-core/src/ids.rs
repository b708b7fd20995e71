use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one in-flight operation on a client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(u64);

impl OpId {
    pub fn new(value: u64) -> Self {
        OpId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        OpId::new(value)
    }
}

/// Monotonic id source. One allocator per client instance, so ids cannot
/// collide within that instance.
#[derive(Debug)]
pub struct OpIdAllocator {
    next: AtomicU64,
}

impl OpIdAllocator {
    pub fn new() -> Self {
        OpIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> OpId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        OpId::new(id)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for OpIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
