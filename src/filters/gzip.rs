//! gzip, gunzip and testgunzip filters
//!
//! Fetch side: `gzip` compresses a plain body into storage, `gunzip`
//! decompresses a gzip body, `testgunzip` stores the body as-is but runs it
//! through a decoder to validate it and to record the gzip accounting blob.
//! Delivery side: `gunzip` decompresses a stored gzip body for clients that
//! do not accept gzip, and can announce the exact decoded length from the
//! stored accounting once the object is complete.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::http::Http;
use crate::objcore::{obj_flags, GzipBits, ObjCore};
use crate::proc::deliver::{DeliverCtx, DeliveryProcessor, PushResult, VdpAction};
use crate::proc::fetch::{FetchCtx, FetchProcessor, PullResult};
use crate::proc::vai::{LeaseCtx, LeaseProcessor, Scarab, Viov, SCARAB_END};
use crate::proc::InitResult;
use crate::rfc2616;

/// gzip stream framing constants: 10 byte header, 8 byte trailer.
const GZ_HDR_BITS: u64 = 80;
const GZ_TRL_BITS: u64 = 64;

fn bits_for(compressed_len: u64, ulen: u64) -> GzipBits {
    let stop = (compressed_len * 8).saturating_sub(GZ_TRL_BITS);
    GzipBits {
        start_bit: GZ_HDR_BITS,
        last_bit: stop,
        stop_bit: stop,
        ulen,
    }
}

/// Fetch-side compressor.
pub struct GzipVfp {
    enc: Option<GzEncoder<Vec<u8>>>,
    scratch: Vec<u8>,
    oc: Arc<ObjCore>,
    total_in: u64,
    total_out: u64,
    upstream_done: bool,
}

impl GzipVfp {
    pub fn init(
        beresp: &mut Http,
        oc: &Arc<ObjCore>,
        level: u32,
        bufsize: usize,
    ) -> InitResult<Box<dyn FetchProcessor>> {
        if beresp.header("content-encoding").is_some() {
            return InitResult::Pass;
        }
        beresp.unset_header("content-length");
        beresp.force_header("Content-Encoding", "gzip");
        rfc2616::weaken_etag(beresp);
        let _ = beresp.append_header("Vary", "Accept-Encoding");
        // the stored body will be gzip regardless of what the wire carried
        oc.set_obj_flag(obj_flags::GZIPED | obj_flags::CHGCE, true);
        InitResult::Ok(Box::new(Self {
            enc: Some(GzEncoder::new(
                Vec::with_capacity(bufsize),
                Compression::new(level),
            )),
            scratch: vec![0; bufsize],
            oc: oc.clone(),
            total_in: 0,
            total_out: 0,
            upstream_done: false,
        }))
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let pending = self.enc.as_mut().unwrap().get_mut();
        let l = pending.len().min(buf.len());
        buf[..l].copy_from_slice(&pending[..l]);
        pending.drain(..l);
        self.total_out += l as u64;
        l
    }

    fn finished(&self) -> bool {
        self.upstream_done && self.enc.as_ref().unwrap().get_ref().is_empty()
    }
}

impl FetchProcessor for GzipVfp {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        loop {
            let l = self.drain(buf);
            if self.finished() {
                self.oc.with_attrs_mut(|a| {
                    a.gzipbits = Some(bits_for(self.total_out, self.total_in));
                });
                return PullResult::End(l);
            }
            if l > 0 {
                return PullResult::Ok(l);
            }
            let scratch_len = self.scratch.len();
            let r = {
                let s = &mut self.scratch[..scratch_len];
                ctx.pull(s)
            };
            let n = match r {
                PullResult::Err => return PullResult::Err,
                PullResult::Ok(n) => n,
                PullResult::End(n) => {
                    self.upstream_done = true;
                    n
                }
            };
            self.total_in += n as u64;
            let enc = self.enc.as_mut().unwrap();
            if enc.write_all(&self.scratch[..n]).is_err() {
                ctx.error("gzip: compression failed");
                return PullResult::Err;
            }
            if self.upstream_done && enc.try_finish().is_err() {
                ctx.error("gzip: finish failed");
                return PullResult::Err;
            }
        }
    }
}

/// Fetch-side decompressor.
pub struct GunzipVfp {
    dec: GzDecoder<Vec<u8>>,
    scratch: Vec<u8>,
    upstream_done: bool,
}

impl GunzipVfp {
    pub fn init(
        beresp: &mut Http,
        oc: &Arc<ObjCore>,
        bufsize: usize,
    ) -> InitResult<Box<dyn FetchProcessor>> {
        if !beresp.has_field("content-encoding", "gzip") {
            return InitResult::Pass;
        }
        beresp.unset_header("content-encoding");
        beresp.unset_header("content-length");
        rfc2616::weaken_etag(beresp);
        // stored plain while the wire carried gzip
        oc.set_obj_flag(obj_flags::CHGCE, true);
        InitResult::Ok(Box::new(Self {
            dec: GzDecoder::new(Vec::with_capacity(bufsize)),
            scratch: vec![0; bufsize],
            upstream_done: false,
        }))
    }
}

impl FetchProcessor for GunzipVfp {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        loop {
            let pending = self.dec.get_mut();
            let l = pending.len().min(buf.len());
            if l > 0 {
                buf[..l].copy_from_slice(&pending[..l]);
                pending.drain(..l);
                return if self.upstream_done && self.dec.get_ref().is_empty() {
                    PullResult::End(l)
                } else {
                    PullResult::Ok(l)
                };
            }
            if self.upstream_done {
                return PullResult::End(0);
            }
            let scratch_len = self.scratch.len();
            let r = {
                let s = &mut self.scratch[..scratch_len];
                ctx.pull(s)
            };
            let n = match r {
                PullResult::Err => return PullResult::Err,
                PullResult::Ok(n) => n,
                PullResult::End(n) => {
                    self.upstream_done = true;
                    n
                }
            };
            if self.dec.write_all(&self.scratch[..n]).is_err() {
                ctx.error("gunzip: invalid gzip stream");
                return PullResult::Err;
            }
            if self.upstream_done && self.dec.try_finish().is_err() {
                ctx.error("gunzip: truncated gzip stream");
                return PullResult::Err;
            }
        }
    }
}

/// Fetch-side validator: stores the gzip body untouched while checking it
/// decodes, and records the accounting blob.
pub struct TestGunzipVfp {
    dec: GzDecoder<DecodedCounter>,
    oc: Arc<ObjCore>,
    total_in: u64,
}

/// Sink counting decoded bytes without keeping them.
#[derive(Default)]
struct DecodedCounter(u64);

impl Write for DecodedCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TestGunzipVfp {
    pub fn init(beresp: &Http, oc: &Arc<ObjCore>) -> InitResult<Box<dyn FetchProcessor>> {
        if !beresp.has_field("content-encoding", "gzip") {
            return InitResult::Pass;
        }
        oc.set_obj_flag(obj_flags::GZIPED, true);
        InitResult::Ok(Box::new(Self {
            dec: GzDecoder::new(DecodedCounter::default()),
            oc: oc.clone(),
            total_in: 0,
        }))
    }
}

impl FetchProcessor for TestGunzipVfp {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        let r = ctx.pull(buf);
        let (n, done) = match r {
            PullResult::Err => return PullResult::Err,
            PullResult::Ok(n) => (n, false),
            PullResult::End(n) => (n, true),
        };
        if self.dec.write_all(&buf[..n]).is_err() {
            ctx.error("testgunzip: invalid gzip stream");
            return PullResult::Err;
        }
        self.total_in += n as u64;
        if done {
            if self.dec.try_finish().is_err() {
                ctx.error("testgunzip: truncated gzip stream");
                return PullResult::Err;
            }
            let ulen = self.dec.get_ref().0;
            let total_in = self.total_in;
            self.oc
                .with_attrs_mut(|a| a.gzipbits = Some(bits_for(total_in, ulen)));
        }
        r
    }
}

/// Response rewrite shared by the two delivery-side gunzip variants:
/// false means the filter should not stack (object not gzipped, or the
/// client takes gzip as-is).
fn gunzip_resp_setup(
    req_http: &Http,
    resp: &mut Http,
    resp_len: &mut i64,
    oc: &Arc<ObjCore>,
) -> bool {
    if !oc.has_obj_flag(obj_flags::GZIPED) || rfc2616::req_gzip(req_http) {
        return false;
    }
    resp.unset_header("content-encoding");
    // with a settled object the stored accounting gives the exact decoded
    // length
    if oc.get_boc().is_none() {
        if let Some(bits) = oc.with_attrs(|a| a.gzipbits) {
            *resp_len = bits.ulen as i64;
        }
    } else {
        *resp_len = -1;
    }
    true
}

/// Delivery-side decompressor for clients without gzip support.
pub struct GunzipVdp {
    dec: GzDecoder<Vec<u8>>,
}

impl GunzipVdp {
    pub fn init(
        req_http: &Http,
        resp: &mut Http,
        resp_len: &mut i64,
        oc: &Arc<ObjCore>,
        bufsize: usize,
    ) -> InitResult<Box<dyn DeliveryProcessor>> {
        if !gunzip_resp_setup(req_http, resp, resp_len, oc) {
            return InitResult::Pass;
        }
        InitResult::Ok(Box::new(Self {
            dec: GzDecoder::new(Vec::with_capacity(bufsize)),
        }))
    }

    fn flush_down(&mut self, ctx: &mut DeliverCtx<'_>, act: VdpAction) -> PushResult {
        let out = std::mem::take(self.dec.get_mut());
        if out.is_empty() && act == VdpAction::Null {
            return PushResult::Ok;
        }
        ctx.push(act, &out)
    }
}

impl DeliveryProcessor for GunzipVdp {
    fn push(&mut self, ctx: &mut DeliverCtx<'_>, act: VdpAction, buf: &[u8]) -> PushResult {
        if self.dec.write_all(buf).is_err() {
            return PushResult::Err;
        }
        if act == VdpAction::End && self.dec.try_finish().is_err() {
            return PushResult::Err;
        }
        self.flush_down(ctx, act)
    }
}

/// Lease-side delivery gunzip: consumes upstream leases, produces its own
/// buffers.
pub struct GunzipIo {
    dec: GzDecoder<Vec<u8>>,
    done: bool,
}

impl GunzipIo {
    pub fn new() -> Self {
        Self {
            dec: GzDecoder::new(Vec::new()),
            done: false,
        }
    }

    /// Same stacking decision and response rewrite as [`GunzipVdp::init`],
    /// for the lease-style chain.
    pub fn init(
        req_http: &Http,
        resp: &mut Http,
        resp_len: &mut i64,
        oc: &Arc<ObjCore>,
    ) -> Option<Box<Self>> {
        if !gunzip_resp_setup(req_http, resp, resp_len, oc) {
            return None;
        }
        Some(Box::new(Self::new()))
    }
}

impl LeaseProcessor for GunzipIo {
    fn lease(&mut self, ctx: &mut LeaseCtx<'_>, scarab: &mut Scarab) -> i32 {
        if self.done {
            scarab.flags |= SCARAB_END;
            return 0;
        }
        let mut up = Scarab::new(scarab.capacity().max(1));
        let r = ctx.pull(&mut up);
        if r < 0 {
            return r;
        }
        for v in up.s.drain(..) {
            if self.dec.write_all(&v.data).is_err() {
                return -1;
            }
            ctx.return_lease(v.lease);
        }
        if up.flags & SCARAB_END != 0 {
            if self.dec.try_finish().is_err() {
                return -1;
            }
            self.done = true;
            scarab.flags |= SCARAB_END;
        }
        let out = std::mem::take(self.dec.get_mut());
        if out.is_empty() {
            return 0;
        }
        scarab.add(Viov {
            lease: 0,
            data: Bytes::from(out),
        });
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::deliver::{CollectSink, Vdc};
    use crate::proc::fetch::{PullResult, Vfc};
    use crate::proc::InitResult as IR;
    use crate::storage::MallocStevedore;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut e = GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    struct Feed(Vec<u8>, usize);
    impl FetchProcessor for Feed {
        fn pull(&mut self, _: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
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

    fn fetch_through(
        filter: IR<Box<dyn FetchProcessor>>,
        wire: Vec<u8>,
        oc: &Arc<ObjCore>,
    ) -> Result<Vec<u8>, ()> {
        let mut vfc = Vfc::new(1, 64);
        vfc.attach(oc.clone(), MallocStevedore::new("t", None));
        assert!(vfc.push_processor("gz", filter));
        vfc.push_processor("feed", IR::Ok(Box::new(Feed(wire, 0))));
        loop {
            let mut chunk = vfc.take_chunk(64).unwrap();
            match vfc.suck_top(&mut chunk) {
                PullResult::Ok(l) => vfc.put_chunk(chunk, l),
                PullResult::End(l) => {
                    vfc.put_chunk(chunk, l);
                    break;
                }
                PullResult::Err => return Err(()),
            }
        }
        let boc = oc.get_boc().unwrap();
        boc.set_state(crate::objcore::BocState::Finished);
        oc.drop_boc();
        let mut out = Vec::new();
        oc.iterate(false, &mut |b, _| {
            out.extend_from_slice(b);
            0
        });
        Ok(out)
    }

    #[test]
    fn gzip_then_gunzip_is_identity() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(20);

        // fetch-side gzip
        let oc = ObjCore::new_busy([1; 32]);
        let mut beresp = Http::new(16);
        beresp.put_response("HTTP/1.1", 200, None);
        let init = GzipVfp::init(&mut beresp, &oc, 6, 4096);
        let stored = fetch_through(init, payload.clone(), &oc).unwrap();
        assert_eq!(beresp.header("content-encoding"), Some("gzip"));
        assert!(oc.has_obj_flag(obj_flags::GZIPED));
        let bits = oc.with_attrs(|a| a.gzipbits).unwrap();
        assert_eq!(bits.ulen, payload.len() as u64);

        // fetch-side gunzip of that stream round-trips
        let oc2 = ObjCore::new_busy([2; 32]);
        let mut beresp2 = Http::new(16);
        beresp2.put_response("HTTP/1.1", 200, None);
        beresp2.set_header("Content-Encoding", "gzip").unwrap();
        let init2 = GunzipVfp::init(&mut beresp2, &oc2, 4096);
        let plain = fetch_through(init2, stored, &oc2).unwrap();
        assert_eq!(plain, payload);
        assert_eq!(beresp2.header("content-encoding"), None);
    }

    #[test]
    fn testgunzip_validates_and_accounts_without_touching_bytes() {
        let payload = b"hello hello hello".to_vec();
        let wire = gz(&payload);
        let oc = ObjCore::new_busy([3; 32]);
        let beresp = {
            let mut h = Http::new(16);
            h.put_response("HTTP/1.1", 200, None);
            h.set_header("Content-Encoding", "gzip").unwrap();
            h
        };
        let init = TestGunzipVfp::init(&beresp, &oc);
        let stored = fetch_through(init, wire.clone(), &oc).unwrap();
        assert_eq!(stored, wire);
        assert!(oc.has_obj_flag(obj_flags::GZIPED));
        assert_eq!(oc.with_attrs(|a| a.gzipbits).unwrap().ulen, payload.len() as u64);
    }

    #[test]
    fn testgunzip_rejects_junk() {
        let oc = ObjCore::new_busy([4; 32]);
        let beresp = {
            let mut h = Http::new(16);
            h.put_response("HTTP/1.1", 200, None);
            h.set_header("Content-Encoding", "gzip").unwrap();
            h
        };
        let init = TestGunzipVfp::init(&beresp, &oc);
        assert!(fetch_through(init, b"not gzip at all".to_vec(), &oc).is_err());
    }

    #[test]
    fn delivery_gunzip_decodes_and_sets_length() {
        let payload = b"decompress me please".to_vec();
        let oc = ObjCore::new_private();
        oc.set_obj_flag(obj_flags::GZIPED, true);
        oc.with_attrs_mut(|a| {
            a.gzipbits = Some(GzipBits {
                ulen: payload.len() as u64,
                ..GzipBits::default()
            });
        });
        oc.drop_boc();

        let req = Http::new(8); // no Accept-Encoding
        let mut resp = Http::new(8);
        resp.put_response("HTTP/1.1", 200, None);
        resp.set_header("Content-Encoding", "gzip").unwrap();
        let mut resp_len = -1i64;

        let mut vdc = Vdc::new(1, -1);
        vdc.push_processor("gunzip", GunzipVdp::init(&req, &mut resp, &mut resp_len, &oc, 4096));
        let (out, sink) = CollectSink::build();
        vdc.push_processor("sink", sink);

        assert_eq!(resp_len, payload.len() as i64);
        assert_eq!(resp.header("content-encoding"), None);

        vdc.bytes(VdpAction::End, &gz(&payload));
        vdc.close();
        assert_eq!(&*out.lock(), &payload);
    }

    #[test]
    fn delivery_gunzip_declines_for_gzip_clients() {
        let oc = ObjCore::new_private();
        oc.set_obj_flag(obj_flags::GZIPED, true);
        let mut req = Http::new(8);
        req.set_header("Accept-Encoding", "gzip").unwrap();
        let mut resp = Http::new(8);
        let mut l = -1i64;
        assert!(matches!(
            GunzipVdp::init(&req, &mut resp, &mut l, &oc, 4096),
            InitResult::Pass
        ));
        // same decision on the lease side
        assert!(GunzipIo::init(&req, &mut resp, &mut l, &oc).is_none());
    }

    #[test]
    fn lease_side_gunzip_decodes_a_stored_object() {
        use crate::proc::vai::VdpioChain;

        let payload = b"lease by lease, please".repeat(8);
        let oc = ObjCore::new_busy([5; 32]);
        let boc = oc.get_boc().unwrap();
        boc.set_state(crate::objcore::BocState::Stream);
        // two segments to exercise multi-lease pulls
        let wire = gz(&payload);
        let mid = wire.len() / 2;
        oc.body_extend(Bytes::copy_from_slice(&wire[..mid]));
        oc.body_extend(Bytes::copy_from_slice(&wire[mid..]));
        boc.set_state(crate::objcore::BocState::Finished);
        oc.drop_boc();
        oc.set_obj_flag(obj_flags::GZIPED, true);
        oc.with_attrs_mut(|a| {
            a.gzipbits = Some(bits_for(wire.len() as u64, payload.len() as u64));
        });

        let req = Http::new(8); // no Accept-Encoding
        let mut resp = Http::new(8);
        resp.set_header("Content-Encoding", "gzip").unwrap();
        let mut resp_len = -1i64;

        let mut chain = VdpioChain::new(oc.clone());
        let io = GunzipIo::init(&req, &mut resp, &mut resp_len, &oc).unwrap();
        chain.push_io("gunzip", io, 2);
        assert_eq!(resp_len, payload.len() as i64);
        assert_eq!(resp.header("content-encoding"), None);

        let mut out = Vec::new();
        let mut sc = Scarab::new(chain.capacity);
        loop {
            sc.clear();
            assert!(chain.pull(&mut sc) >= 0);
            for v in &sc.s {
                out.extend_from_slice(&v.data);
            }
            let done = sc.flags & SCARAB_END != 0;
            chain.return_scarab(&mut sc);
            if done {
                break;
            }
        }
        assert_eq!(out, payload);
        chain.close();
        assert_eq!(chain.outstanding(), 0);
    }
}
