//! Task-scoped workspace
//!
//! A workspace is a bump allocator tied to one task (a client request, a
//! backend fetch, a session). Data allocated from it lives until the task
//! rolls the workspace back, so there is no per-allocation bookkeeping.
//!
//! Two things make it more than a plain arena:
//!
//! * overflow is sticky: once an allocation fails, the workspace stays marked
//!   until an explicit [`Workspace::rollback`], and [`Workspace::reset`] to a
//!   snapshot taken before the overflow is refused;
//! * a single contiguous *reservation* can be opened over the free tail and
//!   must be released on every exit path, which [`ReservedBuf`] guarantees by
//!   holding the workspace borrow and releasing on drop.

use crate::error::{VclError, VclResult};

const ALIGN: usize = align_of::<*const ()>();

fn pr_round_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Opaque cookie from [`Workspace::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot(usize);

impl Snapshot {
    const OVERFLOWED: Snapshot = Snapshot(usize::MAX);
}

/// A bump allocator for one task.
#[derive(Debug)]
pub struct Workspace {
    id: &'static str,
    buf: Box<[u8]>,
    f: usize,
    overflowed: bool,
}

impl Workspace {
    /// `id` must be short and lower-case, it only shows up in logs.
    pub fn new(id: &'static str, size: usize) -> Self {
        Self {
            id,
            buf: vec![0u8; pr_round_up(size)].into_boxed_slice(),
            f: 0,
            overflowed: false,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Free bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.f
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Allocate an aligned block of at least `sz` bytes, or mark the
    /// workspace overflowed.
    pub fn alloc(&mut self, sz: usize) -> VclResult<&mut [u8]> {
        assert!(sz > 0);
        let bytes = pr_round_up(sz);
        if self.f + bytes > self.buf.len() {
            self.overflowed = true;
            return Err(VclError::WsOutOfMemory(sz));
        }
        let start = self.f;
        self.f += bytes;
        log::trace!("ws {}: alloc({sz}) at +{start}", self.id);
        Ok(&mut self.buf[start..start + sz])
    }

    /// Copy `src` into the workspace.
    pub fn copy_bytes(&mut self, src: impl AsRef<[u8]>) -> VclResult<&[u8]> {
        let src = src.as_ref();
        let dest = self.alloc(src.len())?;
        dest.copy_from_slice(src);
        Ok(dest)
    }

    /// Current free position, to be restored later with [`Workspace::reset`].
    pub fn snapshot(&self) -> Snapshot {
        if self.overflowed {
            return Snapshot::OVERFLOWED;
        }
        Snapshot(self.f)
    }

    /// Roll the free pointer back to a snapshot.
    ///
    /// If the workspace overflowed since, this is a no-op: the overflow mark
    /// stays until [`Workspace::rollback`]. A snapshot taken on an already
    /// overflowed workspace only ever matches overflowed state.
    pub fn reset(&mut self, snap: Snapshot) {
        if snap == Snapshot::OVERFLOWED {
            assert!(self.overflowed);
            return;
        }
        if self.overflowed {
            return;
        }
        assert!(snap.0 <= self.f);
        self.f = snap.0;
    }

    /// Wipe the workspace at task end. This is the only operation that
    /// clears the overflow mark.
    pub fn rollback(&mut self) {
        self.f = 0;
        self.overflowed = false;
    }

    /// Reserve the whole free tail. Released when the returned guard drops.
    pub fn reserve_all(&mut self) -> ReservedBuf<'_> {
        let f = self.f;
        let e = self.buf.len();
        ReservedBuf {
            ws: self,
            start: f,
            end: e,
            used: 0,
            kept: 0,
        }
    }

    /// Reserve a contiguous block of exactly `sz` bytes.
    pub fn reserve(&mut self, sz: usize) -> VclResult<ReservedBuf<'_>> {
        assert!(sz > 0);
        if sz > self.remaining() {
            self.overflowed = true;
            return Err(VclError::WsOutOfMemory(sz));
        }
        let f = self.f;
        Ok(ReservedBuf {
            ws: self,
            start: f,
            end: f + sz,
            used: 0,
            kept: 0,
        })
    }
}

/// An open reservation over the free tail of a workspace.
///
/// Holding this guard *is* the reservation: the workspace cannot be used for
/// anything else until it drops, and dropping it releases the reservation on
/// every exit path. By default nothing is kept; call [`ReservedBuf::keep`]
/// to turn the written prefix into a regular allocation.
#[derive(Debug)]
pub struct ReservedBuf<'a> {
    ws: &'a mut Workspace,
    start: usize,
    end: usize,
    used: usize,
    kept: usize,
}

impl ReservedBuf<'_> {
    /// The part of the reservation not written yet.
    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.ws.buf[self.start + self.used..self.end]
    }

    /// Mark `n` more bytes as written.
    pub fn advance(&mut self, n: usize) {
        assert!(self.start + self.used + n <= self.end);
        self.used += n;
    }

    /// Append `src`, failing without partial writes if it does not fit.
    pub fn write(&mut self, src: &[u8]) -> VclResult<()> {
        if src.len() > self.end - self.start - self.used {
            return Err(VclError::WsOutOfMemory(src.len()));
        }
        let at = self.start + self.used;
        self.ws.buf[at..at + src.len()].copy_from_slice(src);
        self.used += src.len();
        Ok(())
    }

    /// Everything written so far.
    pub fn written(&self) -> &[u8] {
        &self.ws.buf[self.start..self.start + self.used]
    }

    pub fn len(&self) -> usize {
        self.used
    }

    /// Keep the written prefix allocated after release.
    pub fn keep(mut self) {
        self.kept = self.used;
    }
}

impl Drop for ReservedBuf<'_> {
    fn drop(&mut self) {
        self.ws.f = self.start + pr_round_up(self.kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_overflow() {
        let mut ws = Workspace::new("tst", 160);
        for _ in 0..10 {
            assert_eq!(ws.alloc(16).unwrap().len(), 16);
        }
        assert!(ws.alloc(1).is_err());
        assert!(ws.overflowed());
    }

    #[test]
    fn overflow_is_sticky_across_reset() {
        let mut ws = Workspace::new("tst", 64);
        let snap = ws.snapshot();
        ws.alloc(32).unwrap();
        assert!(ws.alloc(64).is_err());
        ws.reset(snap);
        // reset refused, the overflow stands
        assert!(ws.overflowed());
        assert_eq!(ws.remaining(), 32);
        ws.rollback();
        assert!(!ws.overflowed());
        assert_eq!(ws.remaining(), 64);
    }

    #[test]
    fn snapshot_of_overflowed_ws_resets_to_nothing() {
        let mut ws = Workspace::new("tst", 32);
        assert!(ws.alloc(64).is_err());
        let snap = ws.snapshot();
        ws.reset(snap);
        assert!(ws.overflowed());
    }

    #[test]
    fn reservation_discards_by_default() {
        let mut ws = Workspace::new("tst", 64);
        {
            let mut r = ws.reserve_all();
            r.write(b"0123456789").unwrap();
            assert_eq!(r.written(), b"0123456789");
        }
        assert_eq!(ws.remaining(), 64);
    }

    #[test]
    fn reservation_keep_allocates() {
        let mut ws = Workspace::new("tst", 64);
        {
            let mut r = ws.reserve(16).unwrap();
            r.write(b"abc").unwrap();
            r.keep();
        }
        assert_eq!(ws.remaining(), 64 - pr_round_up(3));
        // a fresh snapshot/reset pair still works
        let snap = ws.snapshot();
        ws.alloc(8).unwrap();
        ws.reset(snap);
        assert_eq!(ws.remaining(), 64 - pr_round_up(3));
    }

    #[test]
    fn reserve_too_large_marks_overflow() {
        let mut ws = Workspace::new("tst", 32);
        assert!(ws.reserve(64).is_err());
        assert!(ws.overflowed());
    }
}
