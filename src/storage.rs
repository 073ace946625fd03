//! Storage backends (stevedores)
//!
//! The core only needs two things from a stevedore: admission of a new
//! object with an estimated size, and body chunks to write fetched bytes
//! into. Chunks are `BytesMut`, frozen into refcounted `Bytes` segments when
//! published, which is what the zero-copy delivery path leans on.
//!
//! One simple quota-tracking malloc stevedore covers both the configured
//! default and the transient store; file/persistent backends are out of
//! scope and would slot in behind the same trait.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

/// A storage backend.
pub trait Stevedore: Send + Sync {
    fn name(&self) -> &str;

    /// Is this the transient store?
    fn is_transient(&self) -> bool {
        false
    }

    /// Admit an object with an estimated total size (headers + vary +
    /// initial body guess). Returns false when the store is full.
    fn new_object(&self, estimate: usize) -> bool;

    /// Allocate a body chunk of up to `want` bytes; the returned buffer may
    /// be smaller. `None` when the store is full.
    fn alloc_chunk(&self, want: usize) -> Option<BytesMut>;

    /// Return `n` bytes to the store when an object dies.
    fn free(&self, n: u64);

    /// Bytes currently accounted to this store.
    fn used(&self) -> u64;
}

impl fmt::Debug for dyn Stevedore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stevedore {}", self.name())
    }
}

/// Heap-backed stevedore with an optional byte quota.
pub struct MallocStevedore {
    name: String,
    transient: bool,
    cap: Option<u64>,
    used: AtomicU64,
}

impl MallocStevedore {
    pub fn new(name: &str, cap: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            transient: false,
            cap,
            used: AtomicU64::new(0),
        })
    }

    pub fn transient() -> Arc<Self> {
        Arc::new(Self {
            name: "Transient".to_owned(),
            transient: true,
            cap: None,
            used: AtomicU64::new(0),
        })
    }

    fn charge(&self, n: u64) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            if self.cap.is_some_and(|cap| cur + n > cap) {
                return false;
            }
            match self.used.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }
}

impl Stevedore for MallocStevedore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_transient(&self) -> bool {
        self.transient
    }

    fn new_object(&self, estimate: usize) -> bool {
        self.charge(estimate as u64)
    }

    fn alloc_chunk(&self, want: usize) -> Option<BytesMut> {
        let want = want.max(1);
        if !self.charge(want as u64) {
            return None;
        }
        let mut b = BytesMut::with_capacity(want);
        b.resize(want, 0);
        Some(b)
    }

    fn free(&self, n: u64) {
        let prev = self.used.fetch_sub(n, Ordering::AcqRel);
        assert!(prev >= n);
    }

    fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_enforced_and_released() {
        let stv = MallocStevedore::new("s0", Some(100));
        assert!(stv.new_object(40));
        let c = stv.alloc_chunk(40).unwrap();
        assert_eq!(c.len(), 40);
        assert!(stv.alloc_chunk(40).is_none());
        stv.free(80);
        assert_eq!(stv.used(), 0);
        assert!(stv.alloc_chunk(100).is_some());
    }

    #[test]
    fn transient_is_unbounded() {
        let stv = MallocStevedore::transient();
        assert!(stv.is_transient());
        assert!(stv.new_object(usize::MAX / 4));
    }
}
