//! The backend fetch state machine
//!
//! A fetch runs on its own worker, concurrently with the client request that
//! scheduled it. The two meet only through the objcore's boc: the fetch task
//! publishes `REQ_DONE` when it no longer needs anything from the request,
//! `STREAM` when consumers may start iterating bytes, and `FINISHED` or
//! `FAILED` when it is done. Every state publication broadcasts to all
//! waiters.
//!
//! States are small functions returning the next state; the task loops until
//! `Done`.

use std::sync::Arc;

use crate::backend::{self, BereqBody, Director, FetchTimeouts, Htc};
use crate::error::VclResult;
use crate::filters;
use crate::hash::{self, Hsh};
use crate::http::Http;
use crate::objcore::{obj_flags, oc_flags, BocState, Digest, ObjCore};
use crate::param::Params;
use crate::proc::fetch::{PullResult, Vfc};
use crate::proto::BodyStatus;
use crate::req::Req;
use crate::rfc2616;
use crate::session::StreamClose;
use crate::storage::Stevedore;
use crate::tim;
use crate::vcl::{Handling, Vcl};
use crate::worker::{TaskPrio, Worker};
use crate::ws::{Snapshot, Workspace};

/// How a fetch was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Normal,
    Pass,
    Background,
}

/// What the fetch still holds of the client request. Dropped when
/// `REQ_DONE` is published.
pub struct ReqSnapshot {
    pub http: Http,
    pub body_status: BodyStatus,
    pub body_oc: Option<Arc<ObjCore>>,
    pub client_identity: Option<String>,
    pub esi_level: u32,
}

/// The fetch task's context.
pub struct BusyObj {
    pub xid: u64,
    pub ws: Workspace,
    pub bereq0: Http,
    pub bereq: Http,
    pub beresp: Http,
    pub mode: FetchMode,
    pub is_bgfetch: bool,
    pub uncacheable: bool,
    pub do_stream: bool,
    pub do_esi: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub was_304: bool,

    pub err_code: u16,
    pub err_reason: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    /// Reason a retry is impossible (for example a consumed request body)
    pub no_retry: Option<String>,

    pub connect_timeout: f64,
    pub first_byte_timeout: f64,
    pub between_bytes_timeout: f64,

    pub storage: Option<Arc<dyn Stevedore>>,
    pub stv_default: Arc<dyn Stevedore>,
    pub stv_transient: Arc<dyn Stevedore>,

    pub director: Arc<dyn Director>,
    pub fetch_oc: Arc<ObjCore>,
    pub stale_oc: Option<Arc<ObjCore>>,
    pub bereq_body: Option<Arc<ObjCore>>,
    pub htc: Option<Htc>,
    pub vfc: Vfc,
    pub req: Option<ReqSnapshot>,
    pub digest: Digest,
    pub vfp_filter_list: Option<String>,

    pub t_first: f64,
    pub t_prev: f64,
    pub t_resp: f64,
    pub(crate) ws_bo: Option<Snapshot>,

    pub hsh: Arc<Hsh>,
    pub params: Arc<Params>,
    pub vcl: Arc<dyn Vcl>,
}

impl BusyObj {
    fn boc(&self) -> Arc<crate::objcore::Boc> {
        self.fetch_oc.get_boc().expect("boc on busy objcore")
    }

    /// Publish a boc state with the busyobj-side bookkeeping: `REQ_DONE`
    /// releases the request snapshot, `STREAM` requires it already gone.
    pub fn set_state(&mut self, next: BocState) {
        match next {
            BocState::ReqDone => {
                assert!(self.req.is_some());
                self.req = None;
            }
            BocState::Stream => {
                assert!(self.do_stream);
                assert!(self.req.is_none());
            }
            BocState::Finished | BocState::Failed => {
                self.req = None;
            }
            _ => unreachable!("unexpected boc state"),
        }
        self.boc().set_state(next);
    }

    pub fn ts(&mut self, event: &str) {
        let now = tim::real();
        log::debug!(
            "bereq {}: Timestamp {event}: {now:.6} {:.6} {:.6}",
            self.xid,
            if self.t_first.is_nan() { 0.0 } else { now - self.t_first },
            if self.t_prev.is_nan() { 0.0 } else { now - self.t_prev }
        );
        if self.t_first.is_nan() {
            self.t_first = now;
        }
        self.t_prev = now;
    }

    fn timeouts(&self) -> FetchTimeouts {
        let pick = |own: f64, fallback: f64| if own.is_nan() { fallback } else { own };
        FetchTimeouts {
            connect: pick(self.connect_timeout, self.params.connect_timeout),
            first_byte: pick(self.first_byte_timeout, self.params.first_byte_timeout),
            between_bytes: pick(self.between_bytes_timeout, self.params.between_bytes_timeout),
        }
    }

    fn set_doclose(&self, sc: StreamClose) {
        if let Some(htc) = &self.htc {
            let mut g = htc.lock();
            if g.doclose == StreamClose::None {
                g.doclose = sc;
            }
        }
    }

    /// Close the filter chain and finish the director exchange.
    fn cleanup(&mut self) {
        self.vfc.close();
        self.vfp_filter_list = None;
        self.htc = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStep {
    MkBereq,
    Retry,
    StartFetch,
    CondFetch,
    Fetch,
    FetchBody,
    FetchEnd,
    Error,
    Fail,
    Done,
}

impl FetchStep {
    fn name(self) -> &'static str {
        match self {
            Self::MkBereq => "mkbereq",
            Self::Retry => "retry",
            Self::StartFetch => "startfetch",
            Self::CondFetch => "condfetch",
            Self::Fetch => "fetch",
            Self::FetchBody => "fetchbody",
            Self::FetchEnd => "fetchend",
            Self::Error => "error",
            Self::Fail => "fail",
            Self::Done => "done",
        }
    }
}

/// Copy req into bereq and release the request when it has no body to give.
fn vbf_stp_mkbereq(_wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    assert_eq!(oc.get_boc().unwrap().state(), BocState::Invalid);
    assert!(bo.storage.is_none());

    let snapshot = bo.req.as_ref().expect("req in mkbereq");
    let src = snapshot.http.clone();
    bo.bereq0.filter_req(&src, bo.uncacheable);

    if bo.uncacheable {
        assert!(bo.stale_oc.is_none());
    } else {
        bo.bereq0.set_method("GET");
        if bo.params.http_gzip_support {
            bo.bereq0.force_header("Accept-Encoding", "gzip");
        }
    }
    bo.bereq0.set_proto("HTTP/1.1");

    if let Some(stale) = &bo.stale_oc {
        if stale.has_obj_flag(obj_flags::IMSCAND)
            && (stale.get_boc().is_some() || stale.len() != 0)
        {
            assert!(!stale.has_flag(oc_flags::HFM | oc_flags::PRIVATE));
            let (lm, etag) = stale.with_attrs(|a| {
                let mut hdrs = Http::new(bo.params.http_max_hdr);
                let mut etag = None;
                if let Some(p) = a.headers.as_ref() {
                    if hdrs.decode(p, bo.params.http_max_hdr).is_ok() {
                        etag = hdrs.header("etag").map(str::to_owned);
                    }
                }
                (a.lastmodified, etag)
            });
            if let Some(lm) = lm {
                let _ = bo
                    .bereq0
                    .set_header("If-Modified-Since", &tim::format_http_date(lm));
            }
            if let Some(etag) = etag {
                let _ = bo.bereq0.set_header("If-None-Match", &etag);
            }
        }
    }

    let (body_cached, body_len, body_avail) = {
        let s = bo.req.as_ref().unwrap();
        (
            matches!(s.body_status, BodyStatus::Cached),
            s.body_oc.as_ref().map_or(0, |o| o.len()),
            s.body_status.avail(),
        )
    };
    if body_cached {
        // a spooled body has a known length regardless of how the client
        // framed it
        bo.bereq0
            .force_header("Content-Length", &body_len.to_string());
    }

    bo.ws_bo = Some(bo.ws.snapshot());
    bo.bereq = bo.bereq0.clone();

    if body_cached {
        bo.bereq_body = bo.req.as_ref().unwrap().body_oc.clone();
        bo.set_state(BocState::ReqDone);
    } else if !body_avail {
        bo.set_state(BocState::ReqDone);
    }
    FetchStep::StartFetch
}

/// Reset per-attempt state and go again under a fresh transaction id.
fn vbf_stp_retry(_wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    assert!(bo.boc().state() <= BocState::ReqDone);

    if let Some(why) = &bo.no_retry {
        log::debug!("bereq {}: Retry not possible, {why}", bo.xid);
        return FetchStep::Fail;
    }
    bo.ts("Retry");

    bo.storage = None;
    bo.do_esi = false;
    bo.do_stream = true;
    bo.was_304 = false;
    bo.err_code = 0;
    bo.err_reason = None;
    bo.connect_timeout = f64::NAN;
    bo.first_byte_timeout = f64::NAN;
    bo.between_bytes_timeout = f64::NAN;
    if let Some(htc) = &bo.htc {
        htc.lock().doclose = StreamClose::None;
    }

    bo.xid = crate::cache::next_xid();
    if let Some(snap) = bo.ws_bo {
        bo.ws.reset(snap);
    }
    bo.bereq = bo.bereq0.clone();
    FetchStep::StartFetch
}

/// The 304 merge: valid only against a conditional-candidate stale object.
fn vbf_304_logic(bo: &mut BusyObj) -> i32 {
    let stale_ok = bo
        .stale_oc
        .as_ref()
        .is_some_and(|s| s.has_obj_flag(obj_flags::IMSCAND));
    if stale_ok {
        let stale = bo.stale_oc.clone().unwrap();
        assert!(!stale.has_flag(oc_flags::HFM | oc_flags::PRIVATE));
        if stale.has_obj_flag(obj_flags::CHGCE) {
            // a fetch filter changed C-E in the stored object; do not let
            // the 304 overwrite it, and weaken any new ETag
            rfc2616::weaken_etag(&mut bo.beresp);
        }
        bo.beresp.unset_header("content-encoding");
        bo.beresp.unset_header("content-length");
        // merge: stored headers fill in whatever the 304 did not update
        let mut stored = Http::new(bo.params.http_max_hdr);
        if let Some(p) = stale.with_attrs(|a| a.headers.clone()) {
            if stored.decode(&p, bo.params.http_max_hdr).is_ok() {
                for (n, v) in stored.iter() {
                    if bo.beresp.header(n).is_none() {
                        let _ = bo.beresp.set_header(n, v);
                    }
                }
            }
        }
        bo.beresp.put_response("HTTP/1.1", 200, None);
        bo.was_304 = true;
        1
    } else if !bo.uncacheable {
        log::debug!("bereq {}: 304 response but not conditional fetch", bo.xid);
        bo.set_doclose(StreamClose::RxBad);
        bo.cleanup();
        -1
    } else {
        1
    }
}

/// Run the backend exchange up to the response headers and the policy hook.
fn vbf_stp_startfetch(wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();

    assert!(bo.storage.is_none());
    bo.storage = Some(if bo.uncacheable {
        bo.stv_transient.clone()
    } else {
        bo.stv_default.clone()
    });

    if bo.retries > 0 {
        bo.bereq.unset_header("x-varnish");
    }
    bo.bereq.force_header("X-Varnish", &bo.xid.to_string());

    match bo.vcl.clone().backend_fetch(bo) {
        Handling::Abandon | Handling::Fail => return FetchStep::Fail,
        Handling::Error => return FetchStep::Error,
        Handling::Fetch => {}
        h => {
            log::debug!("bereq {}: illegal return from vcl_backend_fetch: {h:?}", bo.xid);
            return FetchStep::Fail;
        }
    }

    bo.beresp.setup();
    assert!(bo.boc().state() <= BocState::ReqDone);
    assert!(bo.htc.is_none());

    bo.ts("Fetch");
    let t = bo.timeouts();
    let body = bo.bereq_body.clone().map(|oc| BereqBody { oc });
    let conn = bo
        .director
        .clone()
        .gethdrs(&bo.bereq, body.as_ref(), &mut bo.beresp, &t);
    let now = tim::real();
    bo.t_resp = now;
    bo.ts("Beresp");

    let conn = match conn {
        Ok(c) => c,
        Err(e) => {
            log::debug!("bereq {}: FetchError {e}", bo.xid);
            return FetchStep::Error;
        }
    };
    if matches!(conn.body_status, BodyStatus::Error) {
        log::debug!("bereq {}: body cannot be fetched", bo.xid);
        bo.htc = Some(backend::htc(conn));
        bo.set_doclose(StreamClose::RxBody);
        bo.cleanup();
        return FetchStep::Error;
    }
    bo.htc = Some(backend::htc(conn));

    if bo.beresp.header("date").is_none() {
        // rfc2616 14.18: a cached message without Date gets one assigned
        bo.beresp
            .force_header("Date", &tim::format_http_date(now));
    }

    // these are relied upon as single headers downstream of policy
    bo.beresp.collect_header("cache-control");
    bo.beresp.collect_header("vary");

    let status = bo.beresp.status().unwrap_or(0);
    oc.set_exp(rfc2616::ttl(status, &bo.beresp, now, &bo.params));

    assert!(!bo.do_esi);
    assert!(!bo.was_304);

    if status == 304 && vbf_304_logic(bo) < 0 {
        return FetchStep::Error;
    }

    if bo.bereq.has_field("connection", "close") {
        bo.set_doclose(StreamClose::ReqClose);
    }

    let handling = bo.vcl.clone().backend_response(bo);

    if bo.beresp.has_field("connection", "close") {
        bo.set_doclose(StreamClose::RespClose);
    }

    match handling {
        Handling::Abandon | Handling::Fail | Handling::Error => {
            // deliberately ending the exchange is not a fetch failure
            bo.set_doclose(StreamClose::RespClose);
            bo.cleanup();
            return if handling == Handling::Error {
                FetchStep::Error
            } else {
                FetchStep::Fail
            };
        }
        Handling::Retry => {
            bo.set_doclose(StreamClose::RespClose);
            bo.cleanup();
            bo.retries += 1;
            if bo.retries <= bo.max_retries {
                return FetchStep::Retry;
            }
            log::debug!("bereq {}: too many retries, delivering 503", bo.xid);
            return FetchStep::Error;
        }
        Handling::Pass => {
            oc.set_flag(oc_flags::HFP);
            bo.uncacheable = true;
        }
        Handling::Deliver => {}
        h => {
            log::debug!("bereq {}: illegal return from vcl_backend_response: {h:?}", bo.xid);
            bo.cleanup();
            return FetchStep::Fail;
        }
    }

    bo.ts("Process");
    assert!(bo.boc().state() <= BocState::ReqDone);
    if bo.boc().state() != BocState::ReqDone {
        bo.set_state(BocState::ReqDone);
    }

    if bo.do_esi {
        bo.do_stream = false;
    }
    if bo.uncacheable && bo.do_stream {
        bo.boc().set_transit_buffer(bo.params.transit_buffer);
    }
    if bo.uncacheable {
        oc.set_flag(oc_flags::HFM);
        wrk.stats.beresp_uncacheable += 1;
    }

    if bo.was_304 {
        FetchStep::CondFetch
    } else {
        FetchStep::Fetch
    }
}

/// Pick storage with the transient fallback and persist the response head
/// on the object.
fn vbf_beresp2obj(bo: &mut BusyObj) -> VclResult<()> {
    let oc = bo.fetch_oc.clone();
    let mut vary = None;

    if !oc.has_flag(oc_flags::PRIVATE) {
        match hash::vary_create(&bo.bereq0, &bo.beresp) {
            Ok(v) => vary = v,
            Err(_) => {
                log::debug!(
                    "bereq {}: illegal 'Vary' header from backend, making this a pass",
                    bo.xid
                );
                bo.uncacheable = true;
            }
        }
    }

    let estimate =
        bo.beresp.estimate() + vary.as_ref().map_or(0, bytes::Bytes::len);

    // storage admission: transient for the uncacheable and the short-lived,
    // then salvage onto transient when the configured store is full
    let exp = oc.exp();
    let lifetime = exp.ttl + exp.grace + exp.keep;
    let mut stv = if bo.uncacheable {
        bo.stv_transient.clone()
    } else if lifetime < bo.params.shortlived {
        bo.stv_transient.clone()
    } else {
        bo.storage.clone().unwrap_or_else(|| bo.stv_default.clone())
    };
    bo.storage = None;

    if !stv.new_object(estimate) {
        if stv.is_transient() {
            return Err(crate::error::VclError::NoStorage);
        }
        let mut exp = oc.exp();
        exp.ttl = exp.ttl.min(bo.params.shortlived);
        exp.grace = 0.0;
        exp.keep = 0.0;
        oc.set_exp(exp);
        stv = bo.stv_transient.clone();
        if !stv.new_object(estimate) {
            return Err(crate::error::VclError::NoStorage);
        }
    }
    oc.set_storage(stv.clone(), estimate as u64);
    bo.vfc.attach(oc.clone(), stv);

    if bo.uncacheable {
        oc.set_flag(oc_flags::HFM);
    }

    oc.set_xid(bo.xid);
    let lastmod = bo
        .beresp
        .header("last-modified")
        .and_then(tim::parse_http_date)
        .unwrap_or_else(|| oc.exp().t_origin.floor());
    let headers = bo.beresp.encode();
    if let Some(v) = &vary {
        bo.boc().set_vary(Some(v.clone()));
    }
    oc.with_attrs_mut(|a| {
        a.vary = vary;
        a.headers = Some(headers);
        a.lastmodified = Some(lastmod);
    });
    Ok(())
}

/// Stack the fetch filters, persist the head, start streaming.
fn vbf_stp_fetch(_wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();

    if bo.htc.is_none() {
        bo.vfc.error("no backend connection (rollback?)");
        bo.cleanup();
        return FetchStep::Error;
    }

    let (body_status, content_length) = {
        let htc = bo.htc.as_ref().unwrap();
        let g = htc.lock();
        (g.body_status, g.content_length)
    };

    if matches!(body_status, BodyStatus::None) || content_length == 0 {
        bo.beresp.unset_header("content-encoding");
        bo.do_gzip = false;
        bo.do_gunzip = false;
        bo.do_stream = false;
        bo.vfp_filter_list = Some(String::new());
    } else if bo.vfp_filter_list.is_none() {
        bo.vfp_filter_list = Some(filters::default_vfp_list(
            bo.do_esi,
            bo.do_gzip,
            bo.do_gunzip,
            &bo.beresp,
            &bo.params,
        ));
    }

    let list = bo.vfp_filter_list.clone().unwrap();
    let params = bo.params.clone();
    let stacked = {
        let mut b = filters::VfpBuild {
            beresp: &mut bo.beresp,
            oc: &oc,
            params: &params,
        };
        filters::stack_vfp(&mut bo.vfc, &list, &mut b)
    };
    if !stacked {
        bo.set_doclose(StreamClose::Overload);
        bo.cleanup();
        return FetchStep::Error;
    }
    if body_status.avail() {
        let htc = bo.htc.clone().unwrap();
        if !backend::push_body_reader(&mut bo.vfc, &htc) {
            bo.set_doclose(StreamClose::Overload);
            bo.cleanup();
            return FetchStep::Error;
        }
    }

    if oc.has_flag(oc_flags::PRIVATE) {
        assert!(bo.uncacheable);
    }

    if vbf_beresp2obj(bo).is_err() {
        bo.vfc.error("could not get storage");
        bo.set_doclose(StreamClose::RxBody);
        bo.cleanup();
        return FetchStep::Error;
    }

    if !oc.has_flag(oc_flags::HFM)
        && bo.beresp.status() == Some(200)
        && (rfc2616::strong_lm(&bo.beresp).is_some() || bo.beresp.header("etag").is_some())
    {
        oc.set_obj_flag(obj_flags::IMSCAND, true);
    }

    assert_eq!(bo.boc().state(), BocState::ReqDone);

    if bo.do_stream {
        bo.set_state(BocState::PrepStream);
        bo.hsh.clone().unbusy(&oc);
        bo.set_state(BocState::Stream);
    }

    log::debug!(
        "bereq {}: fetch body {body_status:?} {}",
        bo.xid,
        if bo.do_stream { "stream" } else { "-" }
    );

    if body_status.avail() {
        FetchStep::FetchBody
    } else {
        assert!(!bo.vfc.failed);
        FetchStep::FetchEnd
    }
}

/// The body loop: storage chunk, pull, extend, repeat.
fn vbf_stp_fetchbody(wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    let mut est = {
        let htc = bo.htc.as_ref().unwrap();
        let cl = htc.lock().content_length;
        if cl < 0 {
            0
        } else {
            cl as usize
        }
    };

    let mut vfps;
    loop {
        if oc.has_flag(oc_flags::CANCEL) {
            // a pass delivery was abandoned; stop without failing so
            // hit-for-miss objects still get created
            assert!(oc.has_flag(oc_flags::HFM));
            log::debug!("bereq {}: pass delivery abandoned", bo.xid);
            bo.set_doclose(StreamClose::RxBody);
            vfps = PullResult::End(0);
            break;
        }
        assert!(!bo.vfc.failed);
        let mut chunk = match bo.vfc.take_chunk(est) {
            Ok(c) => c,
            Err(_) => {
                bo.set_doclose(StreamClose::RxBody);
                vfps = PullResult::Err;
                bo.vfc.error("could not get storage");
                break;
            }
        };
        vfps = bo.vfc.suck_top(&mut chunk);
        match vfps {
            PullResult::Ok(l) | PullResult::End(l) => {
                bo.vfc.put_chunk(chunk, l);
                est = est.saturating_sub(l);
            }
            PullResult::Err => {}
        }
        if !matches!(vfps, PullResult::Ok(_)) {
            break;
        }
    }

    if bo.vfc.failed || matches!(vfps, PullResult::Err) {
        bo.vfc.error("fetch pipeline failed to process");
        bo.set_doclose(StreamClose::RxBody);
        bo.cleanup();
        if !bo.do_stream {
            assert!(bo.boc().state() < BocState::Stream);
            return FetchStep::Error;
        }
        wrk.stats.fetch_failed += 1;
        return FetchStep::Fail;
    }
    FetchStep::FetchEnd
}

/// Seal the object: final length, unbusy when not streamed, `FINISHED`.
fn vbf_stp_fetchend(_wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    assert!(!bo.vfc.failed);

    // recycle the backend connection before FINISHED for predictable reuse
    bo.cleanup();

    oc.set_len(bo.boc().fetched());

    if bo.do_stream {
        assert_eq!(bo.boc().state(), BocState::Stream);
    } else {
        assert_eq!(bo.boc().state(), BocState::ReqDone);
        bo.set_state(BocState::PrepStream);
        bo.hsh.clone().unbusy(&oc);
    }
    bo.set_state(BocState::Finished);
    bo.ts("BerespBody");

    if let Some(stale) = bo.stale_oc.clone() {
        log::debug!(
            "bereq {}: superseded x={} n={}",
            bo.xid,
            stale.xid(),
            oc.xid()
        );
        bo.hsh.replace(&stale, &oc);
    }
    FetchStep::Done
}

/// Refresh from a 304: copy body and derived attributes from the stale
/// object into the new one.
fn vbf_stp_condfetch(wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    let stale = bo.stale_oc.clone().expect("stale objcore in condfetch");

    if let Some(stale_boc) = stale.get_boc() {
        // Wait for the stale object to become fully fetched before we
        // unbusy the new one: it stops chains of IMS-updated short-TTL
        // objects all streaming from one slow body fetch, and it means the
        // attributes we copy (gzip accounting included) are complete.
        log::debug!(
            "bereq {}: conditional fetch wait for streaming object",
            bo.xid
        );
        let state = stale_boc.wait_state(BocState::Finished);
        if state != BocState::Finished {
            assert_eq!(state, BocState::Failed);
            assert!(stale.has_flag(oc_flags::FAILED));
        }
    }

    if stale.has_flag(oc_flags::FAILED) {
        bo.vfc.error("template object failed");
        bo.cleanup();
        wrk.stats.fetch_failed += 1;
        return FetchStep::Fail;
    }

    if vbf_beresp2obj(bo).is_err() {
        bo.cleanup();
        wrk.stats.fetch_failed += 1;
        return FetchStep::Fail;
    }

    let (esidata, flags, gzipbits) =
        stale.with_attrs(|sa| (sa.esidata.clone(), sa.flags, sa.gzipbits));
    oc.with_attrs_mut(|a| {
        a.esidata = esidata;
        a.flags = flags;
        a.gzipbits = gzipbits;
    });
    if oc.has_flag(oc_flags::HFM) {
        oc.set_obj_flag(obj_flags::IMSCAND, false);
    }

    if bo.do_stream {
        bo.set_state(BocState::PrepStream);
        bo.hsh.clone().unbusy(&oc);
        bo.set_state(BocState::Stream);
    }

    // copy the template body through the pipeline's storage allocation
    let mut copy_err = false;
    stale.iterate(false, &mut |buf, _| {
        let mut p = buf;
        while !p.is_empty() {
            let mut chunk = match bo.vfc.take_chunk(p.len()) {
                Ok(c) => c,
                Err(_) => return 1,
            };
            let l = chunk.len().min(p.len());
            chunk[..l].copy_from_slice(&p[..l]);
            bo.vfc.put_chunk(chunk, l);
            p = &p[l..];
        }
        0
    });
    if bo.boc().fetched() != stale.len() {
        copy_err = true;
    }
    if copy_err || bo.vfc.failed {
        bo.vfc.error("template object failed");
        bo.cleanup();
        wrk.stats.fetch_failed += 1;
        return FetchStep::Fail;
    }
    FetchStep::FetchEnd
}

/// Synthesize a backend error object.
fn vbf_stp_error(wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    assert!(oc.has_flag(oc_flags::BUSY));

    wrk.stats.fetch_failed += 1;
    let now = tim::real();
    bo.ts("Error");

    // drop whatever part of a body made it into storage
    oc.body_reset();
    if let Some(boc) = oc.get_boc() {
        boc.reset_fetched();
    }

    if bo.storage.is_none() {
        bo.storage = Some(bo.stv_default.clone());
    }

    bo.beresp.setup();
    if bo.err_code > 0 {
        bo.beresp
            .put_response("HTTP/1.1", bo.err_code, bo.err_reason.as_deref());
    } else {
        bo.beresp
            .put_response("HTTP/1.1", 503, Some("Backend fetch failed"));
    }
    bo.beresp
        .force_header("Date", &tim::format_http_date(now));
    bo.beresp.force_header("Server", "Varnish");

    let mut stale = bo.stale_oc.clone();
    let mut exp = oc.exp();
    exp.t_origin = now;
    let waiting = oc.objhead().map_or(0, |oh| oh.waiting());
    if waiting > 0 {
        // cache the error briefly so the waiting list drains instead of
        // serially attacking the backend
        exp.ttl = 1.0;
        exp.grace = 5.0;
        exp.keep = 5.0;
        stale = None;
    } else {
        exp.ttl = 0.0;
        exp.grace = 0.0;
        exp.keep = 0.0;
    }
    oc.set_exp(exp);

    let mut synth_body = Vec::new();
    match bo.vcl.clone().backend_error(bo, &mut synth_body) {
        Handling::Abandon | Handling::Fail => return FetchStep::Fail,
        Handling::Retry => {
            bo.retries += 1;
            if bo.retries <= bo.max_retries {
                return FetchStep::Retry;
            }
            log::debug!("bereq {}: too many retries, failing", bo.xid);
            return FetchStep::Fail;
        }
        Handling::Deliver => {}
        h => {
            log::debug!("bereq {}: illegal return from vcl_backend_error: {h:?}", bo.xid);
            return FetchStep::Fail;
        }
    }

    if bo.boc().state() < BocState::ReqDone {
        bo.set_state(BocState::ReqDone);
    }

    if vbf_beresp2obj(bo).is_err() {
        return FetchStep::Fail;
    }
    bo.boc().set_transit_buffer(0);

    let mut src = &synth_body[..];
    while !src.is_empty() {
        let Ok(mut chunk) = bo.vfc.take_chunk(src.len()) else {
            return FetchStep::Fail;
        };
        let l = chunk.len().min(src.len());
        chunk[..l].copy_from_slice(&src[..l]);
        bo.vfc.put_chunk(chunk, l);
        src = &src[l..];
    }
    oc.set_len(synth_body.len() as u64);

    bo.set_state(BocState::PrepStream);
    bo.hsh.clone().unbusy(&oc);
    if let Some(stale) = stale {
        if oc.exp().ttl > 0.0 {
            bo.hsh.kill(&stale);
        }
    }
    bo.set_state(BocState::Finished);
    FetchStep::Done
}

/// Terminal failure: the objcore is marked failed and every waiter learns.
fn vbf_stp_fail(_wrk: &mut Worker, bo: &mut BusyObj) -> FetchStep {
    let oc = bo.fetch_oc.clone();
    assert!(bo.boc().state() < BocState::Finished);
    bo.hsh.fail(&oc);
    // the boc broadcast reaches fetch waiters, the kill rushes the
    // waiting list
    bo.set_state(BocState::Failed);
    if oc.has_flag(oc_flags::BUSY) {
        oc.clear_busy();
    }
    bo.hsh.kill(&oc);
    FetchStep::Done
}

/// The fetch task body.
pub fn fetch_task(wrk: &mut Worker, mut bo: BusyObj) {
    let oc = bo.fetch_oc.clone();
    bo.ts("Start");

    let mut step = FetchStep::MkBereq;
    while step != FetchStep::Done {
        log::trace!("bereq {}: fetch step {}", bo.xid, step.name());
        if bo.boc().state() < BocState::ReqDone {
            assert!(bo.req.is_some());
        } else {
            assert!(bo.req.is_none());
        }
        step = match step {
            FetchStep::MkBereq => vbf_stp_mkbereq(wrk, &mut bo),
            FetchStep::Retry => vbf_stp_retry(wrk, &mut bo),
            FetchStep::StartFetch => vbf_stp_startfetch(wrk, &mut bo),
            FetchStep::CondFetch => vbf_stp_condfetch(wrk, &mut bo),
            FetchStep::Fetch => vbf_stp_fetch(wrk, &mut bo),
            FetchStep::FetchBody => vbf_stp_fetchbody(wrk, &mut bo),
            FetchStep::FetchEnd => vbf_stp_fetchend(wrk, &mut bo),
            FetchStep::Error => vbf_stp_error(wrk, &mut bo),
            FetchStep::Fail => vbf_stp_fail(wrk, &mut bo),
            FetchStep::Done => unreachable!(),
        };
    }

    bo.bereq_body = None;
    if bo.boc().state() == BocState::Finished {
        assert!(!oc.has_flag(oc_flags::FAILED));
        log::debug!("bereq {}: Length {}", bo.xid, oc.len());
    }
    if bo.stale_oc.take().is_some() {
        // reference dropped
    }
    oc.drop_boc();
    release_busyobj(bo);
}

/// Log accounting and drop the busyobj.
fn release_busyobj(mut bo: BusyObj) {
    assert!(bo.htc.is_none());
    assert!(bo.stale_oc.is_none());
    log::debug!(
        "bereq {}: BereqAcct body {}",
        bo.xid,
        bo.fetch_oc.body_bytes()
    );
    bo.ws.rollback();
}

/// Inputs assembled by the client side when scheduling a fetch.
pub struct FetchHandoff {
    pub hsh: Arc<Hsh>,
    pub pool: Arc<crate::worker::Pool>,
    pub stv_default: Arc<dyn Stevedore>,
    pub stv_transient: Arc<dyn Stevedore>,
    pub director: Arc<dyn Director>,
    pub vcl: Arc<dyn Vcl>,
    pub xid: u64,
}

/// Schedule a fetch for `oc` and coordinate with it per mode: a foreground
/// fetch parks the request until `STREAM` (or failure), a background fetch
/// until `REQ_DONE`.
pub fn vbf_fetch(
    wrk: &mut Worker,
    h: FetchHandoff,
    req: &mut Req,
    oc: Arc<ObjCore>,
    oldoc: Option<Arc<ObjCore>>,
    mode: FetchMode,
) {
    assert!(oc.has_flag(oc_flags::BUSY));
    let params = req.params.clone();
    let max_hdr = params.http_max_hdr;

    let (prio, how, uncacheable, is_bgfetch) = match mode {
        FetchMode::Pass => (TaskPrio::Bo, "pass", true, false),
        FetchMode::Normal => (TaskPrio::Bo, "fetch", false, false),
        FetchMode::Background => (TaskPrio::Bg, "bgfetch", false, true),
    };
    log::debug!("req {}: Link bereq {} {how}", req.xid, h.xid);

    let boc = oc.get_boc().expect("boc on fetch objcore");

    let snapshot = ReqSnapshot {
        http: req.http.clone(),
        body_status: req.body_status,
        body_oc: req.body_oc.clone(),
        client_identity: req.client_identity.clone(),
        esi_level: req.esi_level,
    };

    let bo = BusyObj {
        xid: h.xid,
        ws: Workspace::new("bo", params.workspace_backend),
        bereq0: Http::new(max_hdr),
        bereq: Http::new(max_hdr),
        beresp: Http::new(max_hdr),
        mode,
        is_bgfetch,
        uncacheable,
        do_stream: true,
        do_esi: false,
        do_gzip: false,
        do_gunzip: false,
        was_304: false,
        err_code: 0,
        err_reason: None,
        retries: 0,
        max_retries: params.max_retries,
        no_retry: None,
        connect_timeout: f64::NAN,
        first_byte_timeout: f64::NAN,
        between_bytes_timeout: f64::NAN,
        storage: None,
        stv_default: h.stv_default,
        stv_transient: h.stv_transient,
        director: req.director_hint.clone().unwrap_or(h.director),
        fetch_oc: oc.clone(),
        stale_oc: oldoc,
        bereq_body: None,
        htc: None,
        vfc: Vfc::new(h.xid, params.fetch_chunksize),
        req: Some(snapshot),
        digest: req.digest,
        vfp_filter_list: req.vfp_filter_list.clone(),
        t_first: f64::NAN,
        t_prev: f64::NAN,
        t_resp: f64::NAN,
        ws_bo: None,
        hsh: h.hsh.clone(),
        params: params.clone(),
        vcl: h.vcl,
    };

    let scheduled = h.pool.task(prio, move |twrk| fetch_task(twrk, bo));
    if scheduled.is_err() {
        wrk.stats.bgfetch_no_thread += 1;
        log::debug!("bereq {}: no thread available for {how}", h.xid);
        h.hsh.fail(&oc);
        boc.set_state(BocState::Failed);
        oc.clear_busy();
        h.hsh.kill(&oc);
    } else if mode == FetchMode::Background {
        boc.wait_state(BocState::ReqDone);
        req.vrb_ignore();
    } else {
        let state = boc.wait_state(BocState::Stream);
        if state == BocState::Failed {
            assert!(oc.has_flag(oc_flags::FAILED));
        } else {
            assert!(!oc.has_flag(oc_flags::BUSY));
        }
    }
    req.ts("Fetch");
}
