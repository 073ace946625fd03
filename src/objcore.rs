//! Object cores and busy-object control
//!
//! An [`ObjCore`] is the cache record for one response variant. While it is
//! being filled by a fetch task it carries a [`Boc`], the control block the
//! producer and any number of streaming consumers coordinate through: a
//! monotonic state, a monotonic byte count, and one condvar.
//!
//! The state protocol, in order:
//!
//! ```text
//! INVALID -> REQ_DONE -> PREP_STREAM -> STREAM -> FINISHED
//!                  \________________________________-> FAILED
//! ```
//!
//! `FINISHED` and `FAILED` are terminal. Object attributes committed before
//! the `PREP_STREAM -> STREAM` edge are readable by any consumer that
//! observed the transition, with no further synchronization.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Condvar;

use crate::lck::{Lck, LockClass};
use crate::rfc2616::Expiry;
use crate::storage::Stevedore;

/// Cache key digest (SHA-256).
pub type Digest = [u8; 32];

/// Set-once flag bits on an objcore. `BUSY` is the exception: it is cleared,
/// exactly once, when the object is published.
pub mod oc_flags {
    pub const BUSY: u32 = 1 << 0;
    /// Hit-for-miss marker
    pub const HFM: u32 = 1 << 1;
    /// Hit-for-pass marker
    pub const HFP: u32 = 1 << 2;
    /// Never enters the hash, reachable only by its creator
    pub const PRIVATE: u32 = 1 << 3;
    /// Lives in transient storage
    pub const TRANSIENT: u32 = 1 << 4;
    /// The fetch filling this object failed
    pub const FAILED: u32 = 1 << 5;
    /// Consumer abandoned delivery, producer should stop
    pub const CANCEL: u32 = 1 << 6;
    /// Removed from its objhead, do not serve
    pub const DYING: u32 = 1 << 7;
}

/// Stored object flag bits (the `FLAGS` attribute).
pub mod obj_flags {
    pub const GZIPED: u8 = 1 << 0;
    /// A fetch filter changed Content-Encoding relative to the wire
    pub const CHGCE: u8 = 1 << 1;
    pub const ESIPROC: u8 = 1 << 2;
    /// Usable as a conditional-fetch template
    pub const IMSCAND: u8 = 1 << 3;
    pub const FAILED: u8 = 1 << 4;
}

/// Flags passed to body iteration callbacks.
pub mod iter_flags {
    /// The buffer will be invalidated after the call
    pub const FLUSH: u32 = 1;
    /// Last call
    pub const END: u32 = 2;
}

/// Busy-object state, totally ordered except for the absorbing `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BocState {
    Invalid = 0,
    ReqDone = 1,
    PrepStream = 2,
    Stream = 3,
    Finished = 4,
    Failed = 5,
}

#[derive(Debug)]
struct BocInner {
    state: BocState,
    fetched: u64,
    delivered: u64,
}

/// Producer/consumer coordination for an object under construction.
#[derive(Debug)]
pub struct Boc {
    inner: Lck<BocInner>,
    cond: Condvar,
    /// Candidate vary key, published before the object is unbusied so
    /// waiting lookups can vary-match against it
    vary: Lck<Option<Bytes>>,
    /// Streaming high watermark, 0 = unlimited
    transit: AtomicU64,
}

impl Boc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Lck::new(LockClass::Boc, BocInner {
                state: BocState::Invalid,
                fetched: 0,
                delivered: 0,
            }),
            cond: Condvar::new(),
            vary: Lck::new(LockClass::Misc, None),
            transit: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> BocState {
        self.inner.lock().state
    }

    pub fn fetched(&self) -> u64 {
        self.inner.lock().fetched
    }

    pub fn set_transit_buffer(&self, bytes: u64) {
        self.transit.store(bytes, Ordering::Release);
    }

    pub fn set_vary(&self, v: Option<Bytes>) {
        *self.vary.lock() = v;
    }

    pub fn vary(&self) -> Option<Bytes> {
        self.vary.lock().clone()
    }

    /// Publish `next`. States only move forward; `Failed` is reachable from
    /// any non-terminal state and absorbing.
    pub fn set_state(&self, next: BocState) {
        let mut g = self.inner.lock();
        assert_ne!(g.state, BocState::Finished, "terminal state");
        assert_ne!(g.state, BocState::Failed, "terminal state");
        assert!(next > g.state);
        g.state = next;
        drop(g);
        self.cond.notify_all();
    }

    /// Park until `state >= want` or the object failed.
    pub fn wait_state(&self, want: BocState) -> BocState {
        let mut g = self.inner.lock();
        while g.state < want && g.state != BocState::Failed {
            g.wait(&self.cond);
        }
        g.state
    }

    /// Publish `n` more body bytes, then wake consumers. Blocks while the
    /// transit buffer is over its watermark and nobody canceled.
    pub(crate) fn extend(&self, n: u64, canceled: impl Fn() -> bool) {
        let transit = self.transit.load(Ordering::Acquire);
        let mut g = self.inner.lock();
        if transit > 0 {
            while g.state < BocState::Failed
                && g.fetched + n > g.delivered + transit
                && !canceled()
            {
                g.wait(&self.cond);
            }
        }
        g.fetched += n;
        drop(g);
        self.cond.notify_all();
    }

    /// Park a reader at `have` bytes until more are available or the object
    /// settles. Returns the published byte count and state.
    pub fn wait_extend(&self, have: u64) -> (u64, BocState) {
        let mut g = self.inner.lock();
        while g.fetched <= have && g.state < BocState::Finished {
            g.wait(&self.cond);
        }
        (g.fetched, g.state)
    }

    /// A reader consumed up to `pos`; frees transit-buffer budget.
    pub fn note_delivered(&self, pos: u64) {
        let mut g = self.inner.lock();
        if pos > g.delivered {
            g.delivered = pos;
            drop(g);
            self.cond.notify_all();
        }
    }

    /// Wake everybody to re-check flags (cancellation).
    pub fn poke(&self) {
        let _g = self.inner.lock();
        self.cond.notify_all();
    }

    /// Forget partially fetched bytes. Only legal before any consumer could
    /// have observed them.
    pub(crate) fn reset_fetched(&self) {
        let mut g = self.inner.lock();
        assert!(g.state < BocState::Stream);
        g.fetched = 0;
        g.delivered = 0;
    }
}

/// Gzip accounting persisted with a compressed object: bit offsets of the
/// stream phases plus the decoded length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GzipBits {
    pub start_bit: u64,
    pub last_bit: u64,
    pub stop_bit: u64,
    pub ulen: u64,
}

impl GzipBits {
    pub fn encode(&self) -> [u8; 32] {
        let mut b = [0u8; 32];
        b[0..8].copy_from_slice(&self.start_bit.to_be_bytes());
        b[8..16].copy_from_slice(&self.last_bit.to_be_bytes());
        b[16..24].copy_from_slice(&self.stop_bit.to_be_bytes());
        b[24..32].copy_from_slice(&self.ulen.to_be_bytes());
        b
    }

    pub fn decode(b: &[u8; 32]) -> Self {
        let g = |i: usize| u64::from_be_bytes(b[i..i + 8].try_into().unwrap());
        Self {
            start_bit: g(0),
            last_bit: g(8),
            stop_bit: g(16),
            ulen: g(24),
        }
    }
}

/// Attributes persisted on an object, committed before `STREAM`.
#[derive(Debug, Default)]
pub struct ObjAttrs {
    /// Packed response headers ([`crate::http::Http::encode`])
    pub headers: Option<Bytes>,
    /// Encoded vary key
    pub vary: Option<Bytes>,
    /// Pre-parsed ESI program
    pub esidata: Option<Bytes>,
    pub gzipbits: Option<GzipBits>,
    /// Parsed Last-Modified, or `floor(t_origin)`
    pub lastmodified: Option<f64>,
    /// Final body length, valid once `FINISHED`
    pub len: u64,
    /// [`obj_flags`] bits
    pub flags: u8,
}

/// The cache record for one response variant.
#[derive(Debug)]
pub struct ObjCore {
    pub digest: Digest,
    xid: AtomicU64,
    flags: AtomicU32,
    exp: Lck<Expiry>,
    boc: Lck<Option<Arc<Boc>>>,
    attrs: Lck<ObjAttrs>,
    body: Lck<Vec<Bytes>>,
    stv: Lck<Option<Arc<dyn Stevedore>>>,
    allocated: AtomicU64,
    objhead: Lck<Option<std::sync::Weak<crate::hash::ObjHead>>>,
}

impl ObjCore {
    fn make(digest: Digest, flags: u32, boc: Option<Arc<Boc>>) -> Arc<Self> {
        Arc::new(Self {
            digest,
            xid: AtomicU64::new(0),
            flags: AtomicU32::new(flags),
            exp: Lck::new(LockClass::Misc, Expiry::new()),
            boc: Lck::new(LockClass::BocSlot, boc),
            attrs: Lck::new(LockClass::Attrs, ObjAttrs::default()),
            body: Lck::new(LockClass::Body, Vec::new()),
            stv: Lck::new(LockClass::Misc, None),
            allocated: AtomicU64::new(0),
            objhead: Lck::new(LockClass::Misc, None),
        })
    }

    /// The objhead this core is published under, if any.
    pub fn objhead(&self) -> Option<Arc<crate::hash::ObjHead>> {
        self.objhead.lock().as_ref().and_then(std::sync::Weak::upgrade)
    }

    pub(crate) fn set_objhead(&self, oh: &Arc<crate::hash::ObjHead>) {
        *self.objhead.lock() = Some(Arc::downgrade(oh));
    }

    /// A busy placeholder, to be filled by exactly one fetch task.
    pub fn new_busy(digest: Digest) -> Arc<Self> {
        Self::make(digest, oc_flags::BUSY, Some(Boc::new()))
    }

    /// A private object (pass fetches, synthetic bodies); never hashed.
    pub fn new_private() -> Arc<Self> {
        Self::make(
            [0; 32],
            oc_flags::BUSY | oc_flags::PRIVATE,
            Some(Boc::new()),
        )
    }

    pub fn has_flag(&self, f: u32) -> bool {
        self.flags.load(Ordering::Acquire) & f != 0
    }

    pub fn set_flag(&self, f: u32) {
        self.flags.fetch_or(f, Ordering::AcqRel);
    }

    /// Clearing is only ever meaningful for `BUSY`.
    pub fn clear_busy(&self) {
        self.flags.fetch_and(!oc_flags::BUSY, Ordering::AcqRel);
    }

    pub fn xid(&self) -> u64 {
        self.xid.load(Ordering::Acquire)
    }

    pub fn set_xid(&self, xid: u64) {
        self.xid.store(xid, Ordering::Release);
    }

    pub fn exp(&self) -> Expiry {
        *self.exp.lock()
    }

    pub fn set_exp(&self, e: Expiry) {
        *self.exp.lock() = e;
    }

    /// Take a reference to the boc, if the object is still being filled.
    pub fn get_boc(&self) -> Option<Arc<Boc>> {
        self.boc.lock().clone()
    }

    /// The filler is done with the boc; readers holding a reference keep it.
    pub fn drop_boc(&self) {
        self.boc.lock().take();
    }

    pub fn with_attrs<R>(&self, f: impl FnOnce(&ObjAttrs) -> R) -> R {
        f(&self.attrs.lock())
    }

    pub fn with_attrs_mut<R>(&self, f: impl FnOnce(&mut ObjAttrs) -> R) -> R {
        f(&mut self.attrs.lock())
    }

    pub fn has_obj_flag(&self, f: u8) -> bool {
        self.attrs.lock().flags & f != 0
    }

    pub fn set_obj_flag(&self, f: u8, on: bool) {
        let mut g = self.attrs.lock();
        if on {
            g.flags |= f;
        } else {
            g.flags &= !f;
        }
    }

    /// Final object length ([`ObjAttrs::len`]).
    pub fn len(&self) -> u64 {
        self.attrs.lock().len
    }

    pub fn set_len(&self, len: u64) {
        self.attrs.lock().len = len;
    }

    /// Attach storage after admission.
    pub fn set_storage(&self, stv: Arc<dyn Stevedore>, admitted: u64) {
        if stv.is_transient() {
            self.set_flag(oc_flags::TRANSIENT);
        }
        *self.stv.lock() = Some(stv);
        self.allocated.fetch_add(admitted, Ordering::AcqRel);
    }

    pub fn storage(&self) -> Option<Arc<dyn Stevedore>> {
        self.stv.lock().clone()
    }

    /// Account a body chunk against this object's storage.
    pub fn charge(&self, n: u64) {
        self.allocated.fetch_add(n, Ordering::AcqRel);
    }

    /// Published body bytes (segment total).
    pub fn body_bytes(&self) -> u64 {
        self.body.lock().iter().map(|s| s.len() as u64).sum()
    }

    /// Publish one more body segment and wake consumers. The segment is
    /// appended before `fetched_so_far` moves, so readers never observe a
    /// count ahead of the data.
    pub fn body_extend(&self, seg: Bytes) {
        let n = seg.len() as u64;
        self.body.lock().push(seg);
        if let Some(boc) = self.get_boc() {
            boc.extend(n, || self.has_flag(oc_flags::CANCEL));
        }
    }

    /// Drop a partially written body (fetch error before streaming).
    pub fn body_reset(&self) {
        self.body.lock().clear();
        self.attrs.lock().len = 0;
    }

    /// Snapshot the segments from index `from_seg` on, stopping before any
    /// segment that would cross `limit` bytes from the start of the object.
    /// `pos` is the byte offset of `from_seg`.
    pub(crate) fn body_segments(&self, from_seg: usize, mut pos: u64, limit: u64) -> Vec<Bytes> {
        let g = self.body.lock();
        let mut out = Vec::new();
        for s in g.iter().skip(from_seg) {
            if pos + s.len() as u64 > limit {
                break;
            }
            pos += s.len() as u64;
            out.push(s.clone());
        }
        out
    }

    /// Abandon interest in this object; a producer observing `CANCEL` stops.
    pub fn cancel(&self) {
        self.set_flag(oc_flags::CANCEL);
        if let Some(boc) = self.get_boc() {
            boc.poke();
        }
    }

    /// Iterate the body, blocking for more bytes while the object streams.
    ///
    /// The callback sees `iter_flags`; a non-zero return aborts and is
    /// propagated. Returns -1 if the object failed mid-stream. `final_` hints
    /// that segments will not be read again and may be dropped as they go.
    pub fn iterate(&self, final_: bool, cb: &mut dyn FnMut(&[u8], u32) -> i32) -> i32 {
        let boc = self.get_boc();
        let mut pos: u64 = 0;
        let mut seg = 0usize;
        let mut end_sent = false;
        loop {
            let (avail, state) = match &boc {
                Some(b) => b.wait_extend(pos),
                None => (self.body_bytes(), BocState::Finished),
            };
            if state == BocState::Failed || self.has_flag(oc_flags::FAILED) {
                return -1;
            }
            let chunks = self.body_segments(seg, pos, avail);
            let settled = state >= BocState::Finished;
            let n = chunks.len();
            for (i, c) in chunks.into_iter().enumerate() {
                let last = settled && i + 1 == n && pos + c.len() as u64 == avail;
                let mut flags = if boc.is_some() { iter_flags::FLUSH } else { 0 };
                if last {
                    flags |= iter_flags::END;
                    end_sent = true;
                }
                let r = cb(&c, flags);
                pos += c.len() as u64;
                seg += 1;
                if let Some(b) = &boc {
                    b.note_delivered(pos);
                }
                if final_ {
                    let mut g = self.body.lock();
                    if seg <= g.len() {
                        g[seg - 1] = Bytes::new();
                    }
                }
                if r != 0 {
                    return r;
                }
            }
            if settled && pos >= avail {
                if !end_sent {
                    let r = cb(&[], iter_flags::END);
                    if r != 0 {
                        return r;
                    }
                }
                return 0;
            }
        }
    }
}

impl Drop for ObjCore {
    fn drop(&mut self) {
        let allocated = self.allocated.load(Ordering::Acquire);
        if allocated > 0 {
            if let Some(stv) = self.stv.lock().take() {
                stv.free(allocated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boc_state_is_monotonic() {
        let boc = Boc::new();
        boc.set_state(BocState::ReqDone);
        boc.set_state(BocState::Stream);
        assert_eq!(boc.state(), BocState::Stream);
        boc.set_state(BocState::Failed);
        assert_eq!(boc.state(), BocState::Failed);
    }

    #[test]
    #[should_panic]
    fn boc_state_cannot_go_backwards() {
        let boc = Boc::new();
        boc.set_state(BocState::Stream);
        boc.set_state(BocState::ReqDone);
    }

    #[test]
    #[should_panic(expected = "terminal state")]
    fn failed_is_absorbing() {
        let boc = Boc::new();
        boc.set_state(BocState::Failed);
        boc.set_state(BocState::Finished);
    }

    #[test]
    fn streaming_iterate_sees_bytes_in_order() {
        let oc = ObjCore::new_busy([1; 32]);
        let boc = oc.get_boc().unwrap();
        boc.set_state(BocState::ReqDone);
        boc.set_state(BocState::PrepStream);
        boc.set_state(BocState::Stream);

        let oc2 = oc.clone();
        let t = std::thread::spawn(move || {
            let mut got = Vec::new();
            let mut end = 0;
            let r = oc2.iterate(false, &mut |buf, fl| {
                got.extend_from_slice(buf);
                if fl & iter_flags::END != 0 {
                    end += 1;
                }
                0
            });
            (r, got, end)
        });

        oc.body_extend(Bytes::from_static(b"hel"));
        oc.body_extend(Bytes::from_static(b"lo"));
        oc.set_len(5);
        boc.set_state(BocState::Finished);

        let (r, got, end) = t.join().unwrap();
        assert_eq!(r, 0);
        assert_eq!(got, b"hello");
        assert_eq!(end, 1);
    }

    #[test]
    fn empty_body_still_emits_end_once() {
        let oc = ObjCore::new_busy([2; 32]);
        oc.get_boc().unwrap().set_state(BocState::Finished);
        oc.drop_boc();
        let mut ends = 0;
        let r = oc.iterate(false, &mut |buf, fl| {
            assert!(buf.is_empty());
            if fl & iter_flags::END != 0 {
                ends += 1;
            }
            0
        });
        assert_eq!(r, 0);
        assert_eq!(ends, 1);
    }

    #[test]
    fn failed_mid_stream_aborts_iteration() {
        let oc = ObjCore::new_busy([3; 32]);
        let boc = oc.get_boc().unwrap();
        boc.set_state(BocState::Stream);
        oc.body_extend(Bytes::from_static(b"par"));

        let oc2 = oc.clone();
        let t = std::thread::spawn(move || {
            oc2.iterate(false, &mut |_, _| 0)
        });
        oc.set_flag(oc_flags::FAILED);
        boc.set_state(BocState::Failed);
        assert_eq!(t.join().unwrap(), -1);
    }

    #[test]
    fn gzipbits_round_trip() {
        let g = GzipBits {
            start_bit: 80,
            last_bit: 160,
            stop_bit: 240,
            ulen: 12345,
        };
        assert_eq!(GzipBits::decode(&g.encode()), g);
    }

    #[test]
    fn storage_accounting_released_on_drop() {
        use crate::storage::{MallocStevedore, Stevedore};
        let stv = MallocStevedore::new("s0", Some(1000));
        {
            let oc = ObjCore::new_busy([4; 32]);
            assert!(stv.new_object(100));
            oc.set_storage(stv.clone(), 100);
            assert_eq!(stv.used(), 100);
        }
        assert_eq!(stv.used(), 0);
    }
}
