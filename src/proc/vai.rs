//! Vectored lease interface (VAI)
//!
//! The zero-copy alternative to the push-style delivery chain. Storage hands
//! out *leases*: refcounted slices of object segments, carried in a small
//! fixed-capacity vector (the scarab). Filters either forward leases
//! downstream or consume them and return them through the caret. Capacity is
//! negotiated at stacking time: each filter states the minimum vector size it
//! requires of the next filter downstream.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::objcore::{oc_flags, Boc, BocState, ObjCore};

/// Scarab flag: no more leases will be produced.
pub const SCARAB_END: u32 = 1;

/// One lease: an opaque token plus the bytes it covers.
#[derive(Debug, Clone)]
pub struct Viov {
    pub lease: u64,
    pub data: Bytes,
}

/// Fixed-capacity vector of leases.
#[derive(Debug)]
pub struct Scarab {
    capacity: usize,
    pub flags: u32,
    pub s: Vec<Viov>,
}

impl Scarab {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1);
        Self {
            capacity,
            flags: 0,
            s: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.s.len() == self.capacity
    }

    pub fn add(&mut self, v: Viov) {
        assert!(!self.is_full());
        self.s.push(v);
    }

    pub fn clear(&mut self) {
        self.s.clear();
        self.flags = 0;
    }
}

/// Return vector: leases on their way back to storage.
#[derive(Debug)]
pub struct Scaret {
    capacity: usize,
    pub leases: Vec<u64>,
}

impl Scaret {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            leases: Vec::with_capacity(capacity),
        }
    }

    pub fn is_full(&self) -> bool {
        self.leases.len() == self.capacity
    }
}

/// Storage-side handle producing leases over an object body. Blocks for more
/// bytes while the object is still streaming.
pub struct VaiHandle {
    oc: Arc<ObjCore>,
    boc: Option<Arc<Boc>>,
    next_seg: usize,
    pos: u64,
    outstanding: HashMap<u64, Bytes>,
    next_lease: u64,
    end_sent: bool,
}

impl VaiHandle {
    pub fn init(oc: Arc<ObjCore>) -> Self {
        let boc = oc.get_boc();
        Self {
            oc,
            boc,
            next_seg: 0,
            pos: 0,
            outstanding: HashMap::new(),
            next_lease: 1,
            end_sent: false,
        }
    }

    /// Fill `scarab` with as many leases as fit. Returns the number added,
    /// or a negative value when the object failed. Sets [`SCARAB_END`] once
    /// everything was produced.
    pub fn lease(&mut self, scarab: &mut Scarab) -> i32 {
        if self.end_sent {
            scarab.flags |= SCARAB_END;
            return 0;
        }
        let mut added = 0;
        loop {
            if scarab.is_full() {
                return added;
            }
            let (avail, state) = match &self.boc {
                Some(b) => b.wait_extend(self.pos),
                None => (self.oc.body_bytes(), BocState::Finished),
            };
            if state == BocState::Failed || self.oc.has_flag(oc_flags::FAILED) {
                return -1;
            }
            let segs = self.oc.body_segments(self.next_seg, self.pos, avail);
            for data in segs {
                if scarab.is_full() {
                    return added;
                }
                let lease = self.next_lease;
                self.next_lease += 1;
                self.pos += data.len() as u64;
                self.next_seg += 1;
                self.outstanding.insert(lease, data.clone());
                scarab.add(Viov { lease, data });
                added += 1;
                if let Some(b) = &self.boc {
                    b.note_delivered(self.pos);
                }
            }
            if state >= BocState::Finished && self.pos >= avail {
                scarab.flags |= SCARAB_END;
                self.end_sent = true;
                return added;
            }
            if added > 0 {
                return added;
            }
        }
    }

    /// Return the leases accumulated in `scaret`.
    pub fn ret(&mut self, scaret: &mut Scaret) {
        for lease in scaret.leases.drain(..) {
            self.outstanding.remove(&lease);
        }
    }

    /// Leases handed out but not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// Describes the lease-side behavior of a delivery filter.
pub trait LeaseProcessor: Send {
    /// Produce leases into `scarab`, usually by pulling from the previous
    /// layer through [`LeaseCtx::pull`]. Returns the count produced or a
    /// negative error; sets [`SCARAB_END`] on the last batch.
    fn lease(&mut self, ctx: &mut LeaseCtx<'_>, scarab: &mut Scarab) -> i32;

    fn fini(&mut self) {}
}

struct LeaseEntry {
    name: &'static str,
    proc: Option<Box<dyn LeaseProcessor>>,
    calls: u64,
    bytes_in: u64,
}

/// A lease-style delivery chain over a [`VaiHandle`].
pub struct VdpioChain {
    entries: Vec<LeaseEntry>,
    hdl: VaiHandle,
    scaret: Scaret,
    /// Negotiated scarab capacity for the consumer of the last filter
    pub capacity: usize,
}

/// Handle a lease processor uses to reach its upstream.
pub struct LeaseCtx<'a> {
    chain: &'a mut VdpioChain,
    layer: usize,
}

impl LeaseCtx<'_> {
    /// Pull leases from the previous layer (or storage, for the first
    /// filter).
    pub fn pull(&mut self, scarab: &mut Scarab) -> i32 {
        self.chain.pull_from(self.layer, scarab)
    }

    /// Return a single consumed lease.
    pub fn return_lease(&mut self, lease: u64) {
        self.chain.return_lease(lease);
    }
}

impl VdpioChain {
    /// Start a chain over `oc`. The first (storage-nearest) filter gets the
    /// minimum capacity requirement of 1.
    pub fn new(oc: Arc<ObjCore>) -> Self {
        Self {
            entries: Vec::new(),
            hdl: VaiHandle::init(oc),
            scaret: Scaret::new(16),
            capacity: 1,
        }
    }

    /// Stack a filter. `min_cap` is the capacity this filter requires of the
    /// next one downstream; the chain's final capacity is the last filter's
    /// requirement.
    pub fn push_io(&mut self, name: &'static str, proc: Box<dyn LeaseProcessor>, min_cap: usize) {
        assert!(min_cap >= 1);
        self.entries.push(LeaseEntry {
            name,
            proc: Some(proc),
            calls: 0,
            bytes_in: 0,
        });
        self.capacity = min_cap;
    }

    fn pull_from(&mut self, layer: usize, scarab: &mut Scarab) -> i32 {
        if layer == 0 {
            return self.hdl.lease(scarab);
        }
        let idx = layer - 1;
        self.entries[idx].calls += 1;
        let mut proc = self.entries[idx].proc.take().unwrap();
        let r = proc.lease(&mut LeaseCtx { chain: self, layer: idx }, scarab);
        let entry = &mut self.entries[idx];
        entry.proc = Some(proc);
        if r > 0 {
            entry.bytes_in += scarab.s.iter().map(|v| v.data.len() as u64).sum::<u64>();
        }
        r
    }

    /// Pull the next batch of leases out of the whole chain.
    pub fn pull(&mut self, scarab: &mut Scarab) -> i32 {
        self.pull_from(self.entries.len(), scarab)
    }

    /// Return one lease; flushed to storage in batches.
    pub fn return_lease(&mut self, lease: u64) {
        if self.scaret.is_full() {
            self.hdl.ret(&mut self.scaret);
        }
        self.scaret.leases.push(lease);
    }

    /// Return every lease in a scarab and clear it.
    pub fn return_scarab(&mut self, scarab: &mut Scarab) {
        for v in scarab.s.drain(..) {
            if self.scaret.is_full() {
                self.hdl.ret(&mut self.scaret);
            }
            self.scaret.leases.push(v.lease);
        }
    }

    /// Flush pending returns and tear the chain down.
    pub fn close(&mut self) {
        self.hdl.ret(&mut self.scaret);
        while let Some(mut e) = self.entries.pop() {
            log::debug!("vdpio: acct {} {} {}", e.name, e.calls, e.bytes_in);
            if let Some(mut p) = e.proc.take() {
                p.fini();
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.hdl.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(chunks: &[&'static [u8]]) -> Arc<ObjCore> {
        let oc = ObjCore::new_busy([7; 32]);
        let boc = oc.get_boc().unwrap();
        boc.set_state(BocState::Stream);
        for c in chunks {
            oc.body_extend(Bytes::from_static(c));
        }
        boc.set_state(BocState::Finished);
        oc.drop_boc();
        oc
    }

    #[test]
    fn leases_cover_the_body_and_end() {
        let oc = obj(&[b"he", b"llo"]);
        let mut hdl = VaiHandle::init(oc);
        let mut sc = Scarab::new(4);
        let n = hdl.lease(&mut sc);
        assert_eq!(n, 2);
        assert_eq!(sc.flags & SCARAB_END, SCARAB_END);
        let all: Vec<u8> = sc.s.iter().flat_map(|v| v.data.to_vec()).collect();
        assert_eq!(all, b"hello");
        assert_eq!(hdl.outstanding(), 2);

        let mut ret = Scaret::new(4);
        ret.leases.extend(sc.s.iter().map(|v| v.lease));
        hdl.ret(&mut ret);
        assert_eq!(hdl.outstanding(), 0);
    }

    #[test]
    fn capacity_bounds_each_batch() {
        let oc = obj(&[b"a", b"b", b"c"]);
        let mut hdl = VaiHandle::init(oc);
        let mut sc = Scarab::new(2);
        assert_eq!(hdl.lease(&mut sc), 2);
        assert_eq!(sc.flags & SCARAB_END, 0);
        sc.clear();
        assert_eq!(hdl.lease(&mut sc), 1);
        assert_eq!(sc.flags & SCARAB_END, SCARAB_END);
    }

    /// Forwards leases, uppercasing requires a copy, so it returns the
    /// upstream lease and issues its own data.
    struct UpperIo;
    impl LeaseProcessor for UpperIo {
        fn lease(&mut self, ctx: &mut LeaseCtx<'_>, scarab: &mut Scarab) -> i32 {
            let mut up = Scarab::new(scarab.capacity());
            let r = ctx.pull(&mut up);
            if r < 0 {
                return r;
            }
            scarab.flags |= up.flags;
            let mut n = 0;
            for v in up.s.drain(..) {
                let data: Vec<u8> = v.data.iter().map(u8::to_ascii_uppercase).collect();
                ctx.return_lease(v.lease);
                scarab.add(Viov {
                    lease: 0,
                    data: Bytes::from(data),
                });
                n += 1;
            }
            n
        }
    }

    #[test]
    fn chain_filters_and_returns_leases() {
        let oc = obj(&[b"hel", b"lo"]);
        let mut chain = VdpioChain::new(oc);
        chain.push_io("upper", Box::new(UpperIo), 2);
        let mut sc = Scarab::new(chain.capacity);

        let mut out = Vec::new();
        loop {
            sc.clear();
            let r = chain.pull(&mut sc);
            assert!(r >= 0);
            for v in &sc.s {
                out.extend_from_slice(&v.data);
            }
            let done = sc.flags & SCARAB_END != 0;
            let drained: Vec<u64> = sc.s.drain(..).map(|v| v.lease).collect();
            for l in drained {
                if l != 0 {
                    chain.return_lease(l);
                }
            }
            if done {
                break;
            }
        }
        assert_eq!(out, b"HELLO");
        chain.close();
        assert_eq!(chain.outstanding(), 0);
    }
}
