//! Fetch processors (VFP)
//!
//! The fetch chain sits between the backend connection and storage. It is
//! pull-driven: the fetch body loop asks the top processor for bytes, each
//! processor asks its upstream via [`FetchCtx::pull`], and the bottom
//! processor reads the wire. Storage hands the loop scratch chunks to pull
//! into; published chunks become refcounted object segments.

use bytes::BytesMut;

use crate::error::VclResult;
use crate::objcore::ObjCore;
use crate::proc::InitResult;
use crate::storage::Stevedore;
use std::sync::Arc;

/// The return type for [`FetchProcessor::pull`]
#[derive(Debug, Copy, Clone)]
pub enum PullResult {
    /// Failure, the pipeline will be stopped with an error
    Err,
    /// How many bytes were written into the buffer; ready for the next call
    Ok(usize),
    /// The processor is done, and how many final bytes it wrote
    End(usize),
}

/// Describes a fetch processor.
pub trait FetchProcessor: Send {
    /// Fill `buf`, generally drawing on [`FetchCtx::pull`] for upstream
    /// bytes.
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult;

    fn fini(&mut self) {}
}

struct VfpEntry {
    name: &'static str,
    proc: Option<Box<dyn FetchProcessor>>,
    closed: bool,
    calls: u64,
    bytes_out: u64,
}

/// A fetch chain. Entry 0 is what the body loop pulls from; the last entry
/// reads the backend connection.
pub struct Vfc {
    entries: Vec<VfpEntry>,
    pub failed: bool,
    pub err: Option<String>,
    oc: Option<Arc<ObjCore>>,
    stv: Option<Arc<dyn Stevedore>>,
    chunk: Option<BytesMut>,
    chunksize: usize,
    /// Object flag bits accumulated by filters (`obj_flags`)
    pub obj_flags: u8,
    xid: u64,
}

/// Handle a processor uses to reach its upstream.
pub struct FetchCtx<'a> {
    vfc: &'a mut Vfc,
    layer: usize,
}

impl FetchCtx<'_> {
    /// Pull bytes from the upstream processor.
    pub fn pull(&mut self, buf: &mut [u8]) -> PullResult {
        self.vfc.suck(self.layer + 1, buf)
    }

    /// Latch a pipeline failure.
    pub fn error(&mut self, msg: &str) {
        self.vfc.error(msg);
    }
}

impl Vfc {
    pub fn new(xid: u64, chunksize: usize) -> Self {
        Self {
            entries: Vec::new(),
            failed: false,
            err: None,
            oc: None,
            stv: None,
            chunk: None,
            chunksize,
            obj_flags: 0,
            xid,
        }
    }

    /// Point the chain at the object being filled and its storage.
    pub fn attach(&mut self, oc: Arc<ObjCore>, stv: Arc<dyn Stevedore>) {
        self.oc = Some(oc);
        self.stv = Some(stv);
    }

    pub fn oc(&self) -> Option<&Arc<ObjCore>> {
        self.oc.as_ref()
    }

    /// Append a processor. Entry order is pull order: push the outermost
    /// (storage-nearest) filter first, the wire reader last.
    pub fn push_processor(
        &mut self,
        name: &'static str,
        init: InitResult<Box<dyn FetchProcessor>>,
    ) -> bool {
        match init {
            InitResult::Ok(proc) => {
                log::trace!("vfp {}: push({name})", self.xid);
                self.entries.push(VfpEntry {
                    name,
                    proc: Some(proc),
                    closed: false,
                    calls: 0,
                    bytes_out: 0,
                });
                true
            }
            InitResult::Pass => true,
            InitResult::Err(e) => {
                self.error(&format!("fetch filter {name}: {e}"));
                false
            }
        }
    }

    /// Record a pipeline failure; first message wins.
    pub fn error(&mut self, msg: &str) {
        if !self.failed {
            log::debug!("vfp {}: error: {msg}", self.xid);
            self.err = Some(msg.to_owned());
        }
        self.failed = true;
    }

    fn suck(&mut self, layer: usize, buf: &mut [u8]) -> PullResult {
        if self.failed {
            return PullResult::Err;
        }
        let Some(entry) = self.entries.get_mut(layer) else {
            debug_assert!(false, "pull past the last fetch processor");
            self.error("pull past the last fetch processor");
            return PullResult::Err;
        };
        if entry.closed {
            return PullResult::End(0);
        }
        entry.calls += 1;
        let mut proc = entry.proc.take().unwrap();
        let r = proc.pull(&mut FetchCtx { vfc: self, layer }, buf);
        let entry = &mut self.entries[layer];
        entry.proc = Some(proc);
        match r {
            PullResult::Ok(l) => {
                assert!(l <= buf.len());
                entry.bytes_out += l as u64;
            }
            PullResult::End(l) => {
                assert!(l <= buf.len());
                entry.bytes_out += l as u64;
                entry.closed = true;
            }
            PullResult::Err => self.error("fetch processor failed"),
        }
        r
    }

    /// Pull from the top of the chain (the fetch body loop's view).
    pub fn suck_top(&mut self, buf: &mut [u8]) -> PullResult {
        self.suck(0, buf)
    }

    /// Take a storage chunk of up to `want` bytes to pull into. Returns the
    /// storage-allocation failure for the caller to turn into its fallback.
    pub fn take_chunk(&mut self, want: usize) -> VclResult<BytesMut> {
        if let Some(c) = self.chunk.take() {
            if !c.is_empty() {
                return Ok(c);
            }
        }
        let want = if want == 0 {
            self.chunksize
        } else {
            want.min(self.chunksize)
        };
        let stv = self.stv.as_ref().ok_or(crate::error::VclError::NoStorage)?;
        let chunk = stv.alloc_chunk(want).ok_or(crate::error::VclError::NoStorage)?;
        if let Some(oc) = &self.oc {
            oc.charge(chunk.len() as u64);
        }
        Ok(chunk)
    }

    /// Publish the first `l` bytes of `chunk` on the object and keep the
    /// rest for the next round.
    pub fn put_chunk(&mut self, mut chunk: BytesMut, l: usize) {
        assert!(l <= chunk.len());
        if l > 0 {
            let seg = chunk.split_to(l).freeze();
            if let Some(oc) = &self.oc {
                oc.body_extend(seg);
            }
        }
        self.chunk = Some(chunk);
    }

    /// Tear the chain down, logging per-filter accounting. Returns the byte
    /// count produced by the wire-side processor.
    pub fn close(&mut self) -> u64 {
        let mut rv = 0;
        while !self.entries.is_empty() {
            let mut e = self.entries.remove(0);
            rv = e.bytes_out;
            log::debug!("vfp {}: acct {} {} {}", self.xid, e.name, e.calls, e.bytes_out);
            if let Some(mut p) = e.proc.take() {
                p.fini();
            }
        }
        self.chunk = None;
        rv
    }

    pub fn has_processors(&self) -> bool {
        !self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MallocStevedore;

    /// Feeds a canned byte string, like a wire reader would.
    pub(crate) struct Feed(pub Vec<u8>, pub usize);

    impl FetchProcessor for Feed {
        fn pull(&mut self, _ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
            let left = self.0.len() - self.1;
            let l = left.min(buf.len());
            buf[..l].copy_from_slice(&self.0[self.1..self.1 + l]);
            self.1 += l;
            if self.1 == self.0.len() {
                PullResult::End(l)
            } else {
                PullResult::Ok(l)
            }
        }
    }

    struct Rot13;
    impl FetchProcessor for Rot13 {
        fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
            let r = ctx.pull(buf);
            let l = match r {
                PullResult::Ok(l) | PullResult::End(l) => l,
                PullResult::Err => return r,
            };
            for b in &mut buf[..l] {
                if b.is_ascii_lowercase() {
                    *b = b'a' + (*b - b'a' + 13) % 26;
                }
            }
            r
        }
    }

    fn drive(vfc: &mut Vfc) -> Vec<u8> {
        let oc = vfc.oc().unwrap().clone();
        loop {
            let mut chunk = vfc.take_chunk(8).unwrap();
            let r = vfc.suck_top(&mut chunk);
            match r {
                PullResult::Ok(l) => vfc.put_chunk(chunk, l),
                PullResult::End(l) => {
                    vfc.put_chunk(chunk, l);
                    break;
                }
                PullResult::Err => panic!("pipeline failed"),
            }
        }
        let mut out = Vec::new();
        oc.iterate(false, &mut |b, _| {
            out.extend_from_slice(b);
            0
        });
        out
    }

    fn harness(procs: Vec<(&'static str, Box<dyn FetchProcessor>)>) -> Vfc {
        let mut vfc = Vfc::new(1, 8);
        let oc = ObjCore::new_busy([9; 32]);
        oc.get_boc().unwrap().set_state(crate::objcore::BocState::Finished);
        oc.drop_boc();
        vfc.attach(oc, MallocStevedore::new("t", None));
        for (n, p) in procs {
            vfc.push_processor(n, InitResult::Ok(p));
        }
        vfc
    }

    #[test]
    fn plain_feed_lands_in_storage() {
        let mut vfc = harness(vec![("feed", Box::new(Feed(b"hello world".to_vec(), 0)))]);
        assert_eq!(drive(&mut vfc), b"hello world");
        assert_eq!(vfc.close(), 11);
    }

    #[test]
    fn stacked_processor_transforms() {
        let mut vfc = harness(vec![
            ("rot13", Box::new(Rot13)),
            ("feed", Box::new(Feed(b"uryyb".to_vec(), 0))),
        ]);
        assert_eq!(drive(&mut vfc), b"hello");
    }

    #[test]
    fn error_latches() {
        struct Bad;
        impl FetchProcessor for Bad {
            fn pull(&mut self, _: &mut FetchCtx<'_>, _: &mut [u8]) -> PullResult {
                PullResult::Err
            }
        }
        let mut vfc = harness(vec![("bad", Box::new(Bad))]);
        let mut buf = [0u8; 4];
        assert!(matches!(vfc.suck_top(&mut buf), PullResult::Err));
        assert!(vfc.failed);
        assert!(matches!(vfc.suck_top(&mut buf), PullResult::Err));
    }

    #[test]
    fn closed_entry_returns_end() {
        let mut vfc = harness(vec![("feed", Box::new(Feed(b"ab".to_vec(), 0)))]);
        let mut buf = [0u8; 8];
        assert!(matches!(vfc.suck_top(&mut buf), PullResult::End(2)));
        assert!(matches!(vfc.suck_top(&mut buf), PullResult::End(0)));
    }
}
