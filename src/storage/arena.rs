//! Capacity-accounted memory arena.
//!
//! Every byte a shard stores is charged against the arena of its physical
//! block. Allocation fails with [`AllocError::OutOfCapacity`] once the block
//! is full, which is distinct from the system allocator refusing memory.
//!
//! Allocations are returned as [`ArenaString`]s, which give their charge back
//! when dropped, so the arena's `used` counter always equals the bytes held
//! by live entries.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Allocation failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Serving the request would exceed the block's capacity.
    #[error("out of capacity: {requested} bytes requested, {used}/{capacity} in use")]
    OutOfCapacity {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    /// The system allocator could not provide the memory.
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),
}

/// Byte budget for one physical block.
#[derive(Debug)]
pub struct Arena {
    capacity: usize,
    used: AtomicUsize,
}

impl Arena {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    /// Reserve `n` bytes, failing if the block would exceed its capacity.
    pub fn allocate(&self, n: usize) -> Result<(), AllocError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|total| *total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| AllocError::OutOfCapacity {
                requested: n,
                used,
                capacity: self.capacity,
            })
    }

    /// Return `n` previously allocated bytes.
    pub fn free(&self, n: usize) {
        let prev = self.used.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "arena freed more than it allocated");
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `s` into arena-charged storage.
    pub fn alloc_str(self: &Arc<Self>, s: &str) -> Result<ArenaString, AllocError> {
        let len = s.len();
        self.allocate(len)?;

        let mut buf = String::new();
        if buf.try_reserve_exact(len).is_err() {
            self.free(len);
            return Err(AllocError::AllocationFailed(len));
        }
        buf.push_str(s);

        Ok(ArenaString {
            data: buf.into_boxed_str(),
            arena: Arc::clone(self),
        })
    }
}

/// An immutable string whose bytes are charged to an [`Arena`].
///
/// Hashes and compares like the `str` it holds, so maps keyed by it can be
/// queried with plain `&str`.
pub struct ArenaString {
    data: Box<str>,
    arena: Arc<Arena>,
}

impl ArenaString {
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Bytes charged to the arena.
    pub fn charged(&self) -> usize {
        self.data.len()
    }
}

impl Drop for ArenaString {
    fn drop(&mut self) {
        self.arena.free(self.data.len());
    }
}

impl Deref for ArenaString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.data
    }
}

impl Borrow<str> for ArenaString {
    fn borrow(&self) -> &str {
        &self.data
    }
}

impl PartialEq for ArenaString {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for ArenaString {}

impl Hash for ArenaString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl fmt::Debug for ArenaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.data, f)
    }
}

impl fmt::Display for ArenaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}
