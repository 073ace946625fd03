//! Delivery processors (VDP)
//!
//! A delivery chain transforms the object body on its way to the client.
//! Each processor receives buffers through [`DeliveryProcessor::push`] and
//! forwards zero or more buffers to the next layer via
//! [`DeliverCtx::push`]. The chain latches its first non-zero verdict: the
//! lowest negative value (most severe error) wins over any positive
//! (successful early stop), and once latched nothing is forwarded anymore.
//!
//! `End` is delivered to each entry at most once; a processor that sends
//! `End` downstream itself must not forward a second one.

use crate::error::VclError;
use crate::objcore::{iter_flags, oc_flags, ObjCore};
use crate::proc::InitResult;
use crate::session::StreamClose;

/// Pipeline condition accompanying a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VdpAction {
    /// Nothing special, the buffer stays valid after the call
    Null,
    /// The buffer will be invalidated after the call
    Flush,
    /// Last call, implies `Flush`
    End,
}

/// The return type for [`DeliveryProcessor::push`]
#[derive(Debug, Copy, Clone)]
pub enum PushResult {
    /// Failure, the pipeline will be stopped with an error
    Err,
    /// Processing should continue
    Ok,
    /// Stop early, without error
    End,
}

/// Describes a delivery processor.
pub trait DeliveryProcessor: Send {
    /// Handle a buffer from the previous processor, generally forwarding
    /// something via [`DeliverCtx::push`].
    fn push(&mut self, ctx: &mut DeliverCtx<'_>, act: VdpAction, buf: &[u8]) -> PushResult;

    /// Last chance to act when the chain is being torn down.
    fn fini(&mut self, _vdc: &mut Vdc) {}
}

struct VdpEntry {
    name: &'static str,
    proc: Option<Box<dyn DeliveryProcessor>>,
    calls: u64,
    bytes_in: u64,
    end_seen: bool,
}

/// A delivery chain and its latched verdict.
pub struct Vdc {
    entries: Vec<VdpEntry>,
    /// Latched pipeline verdict: 0 running, >0 early stop, <0 error
    pub retval: i32,
    /// Content length estimate the chain may update, -1 unknown
    pub clen: i64,
    /// Close reason a processor wants enforced on the client connection
    pub doclose: Option<StreamClose>,
    xid: u64,
}

/// Handle a processor uses to reach the rest of the chain.
pub struct DeliverCtx<'a> {
    vdc: &'a mut Vdc,
    layer: usize,
}

impl DeliverCtx<'_> {
    /// Send a buffer down the pipeline.
    pub fn push(&mut self, act: VdpAction, buf: &[u8]) -> PushResult {
        match self.vdc.vdp_bytes(self.layer + 1, act, buf) {
            r if r < 0 => PushResult::Err,
            0 => PushResult::Ok,
            _ => PushResult::End,
        }
    }

    /// Request a connection close with a specific reason (delivery errors).
    pub fn set_doclose(&mut self, sc: StreamClose) {
        self.vdc.doclose.get_or_insert(sc);
    }
}

impl Vdc {
    pub fn new(xid: u64, clen: i64) -> Self {
        Self {
            entries: Vec::new(),
            retval: 0,
            clen,
            doclose: None,
            xid,
        }
    }

    /// Append a processor built by `init`. A negative verdict is latched; a
    /// declined (`Pass`) filter is simply not stacked.
    pub fn push_processor(
        &mut self,
        name: &'static str,
        init: InitResult<Box<dyn DeliveryProcessor>>,
    ) -> i32 {
        if self.retval != 0 {
            return self.retval;
        }
        match init {
            InitResult::Ok(proc) => {
                log::trace!("vdp {}: push({name})", self.xid);
                self.entries.push(VdpEntry {
                    name,
                    proc: Some(proc),
                    calls: 0,
                    bytes_in: 0,
                    end_seen: false,
                });
            }
            InitResult::Pass => {}
            InitResult::Err(e) => {
                log::debug!("vdp {}: push({name}) failed: {e}", self.xid);
                self.retval = -1;
            }
        }
        self.retval
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn vdp_bytes(&mut self, layer: usize, act: VdpAction, buf: &[u8]) -> i32 {
        if self.retval != 0 {
            return self.retval;
        }
        let Some(entry) = self.entries.get_mut(layer) else {
            // the chain must end in a sink that never forwards
            debug_assert!(false, "push past the last delivery processor");
            self.retval = -1;
            return self.retval;
        };

        // at most one End per entry
        assert!(!entry.end_seen, "duplicate VDP end");
        match act {
            VdpAction::Null => assert!(!buf.is_empty()),
            VdpAction::End => entry.end_seen = true,
            VdpAction::Flush => {}
        }

        entry.calls += 1;
        entry.bytes_in += buf.len() as u64;
        let mut proc = entry.proc.take().unwrap();
        let r = proc.push(&mut DeliverCtx { vdc: self, layer }, act, buf);
        self.entries[layer].proc = Some(proc);

        let r = match r {
            PushResult::Err => -1,
            PushResult::Ok => 0,
            PushResult::End => 1,
        };
        if r != 0 && (self.retval == 0 || r < self.retval) {
            self.retval = r;
        }
        self.retval
    }

    /// Push a buffer into the top of the chain.
    pub fn bytes(&mut self, act: VdpAction, buf: &[u8]) -> i32 {
        self.vdp_bytes(0, act, buf)
    }

    /// Drive a whole object through the chain, blocking for more bytes while
    /// it is still streaming.
    pub fn deliver_obj(&mut self, oc: &ObjCore) -> i32 {
        let final_ = oc.has_flag(oc_flags::TRANSIENT);
        let r = oc.iterate(final_, &mut |buf, fl| {
            let act = if fl & iter_flags::END != 0 {
                VdpAction::End
            } else if fl & iter_flags::FLUSH != 0 {
                VdpAction::Flush
            } else {
                VdpAction::Null
            };
            self.vdp_bytes(0, act, buf)
        });
        if r < 0 {
            r
        } else {
            0
        }
    }

    /// Tear the chain down front to back, logging per-filter accounting.
    /// Returns the byte count seen by the final (wire) processor.
    pub fn close(&mut self) -> u64 {
        let mut rv = 0;
        while !self.entries.is_empty() {
            let mut e = self.entries.remove(0);
            rv = e.bytes_in;
            log::debug!("vdp {}: acct {} {} {}", self.xid, e.name, e.calls, e.bytes_in);
            if let Some(mut p) = e.proc.take() {
                p.fini(self);
            }
            // every successful delivery that moved bytes must have shown
            // End to the final entry; bodyless responses never push
            if self.entries.is_empty() && self.retval >= 0 {
                debug_assert!(e.end_seen || e.calls == 0, "chain closed without VDP end");
            }
        }
        rv
    }
}

/// A sink capturing everything, for tests and for buffered synth bodies.
pub struct CollectSink {
    pub out: std::sync::Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl DeliveryProcessor for CollectSink {
    fn push(&mut self, _ctx: &mut DeliverCtx<'_>, _act: VdpAction, buf: &[u8]) -> PushResult {
        self.out.lock().extend_from_slice(buf);
        PushResult::Ok
    }
}

impl CollectSink {
    pub fn build() -> (std::sync::Arc<parking_lot::Mutex<Vec<u8>>>, InitResult<Box<dyn DeliveryProcessor>>) {
        let out = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = CollectSink { out: out.clone() };
        (out, InitResult::Ok(Box::new(sink)))
    }
}

pub fn init_err<T>(msg: impl Into<String>) -> InitResult<T> {
    InitResult::Err(VclError::Msg(msg.into()))
}
