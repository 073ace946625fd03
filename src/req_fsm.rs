//! The client request state machine
//!
//! Carries a request from arrival through lookup, a possible fetch, and
//! transmission. A request may suspend twice: in `Lookup` when it loses to a
//! busy objhead (the worker is released and the request resumes on a rush),
//! and inside `Fetch`/`Transmit` waiting for the fetch task to publish
//! `STREAM`.

use std::sync::Arc;

use sha2::{Digest as _, Sha256};

use crate::cache::Cache;
use crate::deliver;
use crate::fetch::FetchMode;
use crate::filters;
use crate::hash::{Lookup, LookupArgs};
use crate::http;
use crate::objcore::{oc_flags, BocState, ObjCore};
use crate::proto::BodyStatus;
use crate::req::Req;
use crate::rfc2616;
use crate::session::StreamClose;
use crate::vcl::Handling;
use crate::worker::Worker;

/// FSM continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqFsmNxt {
    More,
    Done,
    /// Parked on a waiting list; the worker is released
    Disembark,
}

/// Client request states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStep {
    Transport,
    Restart,
    Recv,
    Pipe,
    Pass,
    Lookup,
    Purge,
    Miss,
    Fetch,
    Deliver,
    VclFail,
    Synth,
    Transmit,
}

impl ReqStep {
    fn name(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Restart => "restart",
            Self::Recv => "recv",
            Self::Pipe => "pipe",
            Self::Pass => "pass",
            Self::Lookup => "lookup",
            Self::Purge => "purge",
            Self::Miss => "miss",
            Self::Fetch => "fetch",
            Self::Deliver => "deliver",
            Self::VclFail => "vclfail",
            Self::Synth => "synth",
            Self::Transmit => "transmit",
        }
    }
}

/// Handle `Expect` and `Connection` on the incoming request.
fn cnt_transport(wrk: &mut Worker, req: &mut Req, _cache: &Cache) -> ReqFsmNxt {
    if let Some(expect) = req.http.header("expect") {
        if !expect.trim().eq_ignore_ascii_case("100-continue") {
            req.doclose = StreamClose::RxJunk;
            let _ = req.transport.minimal_response(417);
            wrk.stats.client_req_417 += 1;
            return ReqFsmNxt::Done;
        }
        if req.http.protover() >= 11 {
            req.want100cont = true;
        }
        req.http.unset_header("expect");
    }

    assert_eq!(req.err_code, 0);

    if req.http.has_field("connection", "close") {
        req.doclose = StreamClose::ReqClose;
    }

    req.ws_req = Some(req.ws.snapshot());
    req.http0 = req.http.clone(); // for ESI & restart
    req.step = ReqStep::Recv;
    ReqFsmNxt::More
}

fn cnt_recv_prep(req: &mut Req, cache: &Cache) {
    if req.restarts == 0 {
        if let Some(addr) = req.sess.client_addr {
            let _ = req
                .http
                .append_header("X-Forwarded-For", &addr.ip().to_string());
        }
        let _ = req.http.append_header("Via", http::via_value());
        req.http.collect_header("cache-control");

        // by default we use the first backend
        req.director_hint = Some(cache.director.clone());
        req.d_ttl = f64::NAN;
        req.d_grace = f64::NAN;
        req.hash_always_miss = false;
        req.hash_ignore_busy = false;
        req.hash_ignore_vary = false;
        req.client_identity = None;
    }
    req.is_hit = false;
    req.is_hitmiss = false;
    req.is_hitpass = false;
    req.err_code = 0;
    req.err_reason = None;
}

/// A complete request: sanity checks, `vcl_recv`, the hash.
fn cnt_recv(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());
    assert_eq!(req.err_code, 0);

    log::debug!(
        "req {}: ReqStart {} {}",
        req.xid,
        req.http.method().unwrap_or("-"),
        req.http.url().unwrap_or("-")
    );

    if req.http0.count("host") > 1 {
        log::debug!("req {}: BogoHeader Multiple Host: headers", req.xid);
        wrk.stats.client_req_400 += 1;
        req.doclose = StreamClose::RxBad;
        let _ = req.transport.minimal_response(400);
        return ReqFsmNxt::Done;
    }
    if req.http0.count("content-length") > 1 {
        log::debug!("req {}: BogoHeader Multiple Content-Length: headers", req.xid);
        wrk.stats.client_req_400 += 1;
        req.doclose = StreamClose::RxBad;
        let _ = req.transport.minimal_response(400);
        return ReqFsmNxt::Done;
    }

    cnt_recv_prep(req, cache);

    if matches!(req.body_status, BodyStatus::Error) {
        // ambiguous framing (Content-Length and chunked, junk lengths)
        wrk.stats.client_req_400 += 1;
        req.doclose = StreamClose::RxBad;
        let _ = req.transport.minimal_response(400);
        return ReqFsmNxt::Done;
    }

    let mut recv_handling = req.vcl.clone().recv(req);

    if recv_handling == Handling::Fail {
        req.step = ReqStep::VclFail;
        return ReqFsmNxt::More;
    }

    if recv_handling == Handling::Vcl && req.restarts == 0 {
        // the hook switched bundles; run the new one's recv once
        cnt_recv_prep(req, cache);
        recv_handling = req.vcl.clone().recv(req);
    }

    if req.want100cont && !req.late100cont {
        req.want100cont = false;
        if req.transport.minimal_response(100).is_err() {
            req.doclose = StreamClose::RemClose;
            return ReqFsmNxt::Done;
        }
    }

    if matches!(req.body_status, BodyStatus::Error) {
        req.doclose = StreamClose::RxBody;
        return ReqFsmNxt::Done;
    }

    // wash Accept-Encoding for the sake of vary keys
    if req.params.http_gzip_support
        && recv_handling != Handling::Pipe
        && recv_handling != Handling::Pass
    {
        if rfc2616::req_gzip(&req.http) {
            req.http.force_header("Accept-Encoding", "gzip");
        } else {
            req.http.unset_header("accept-encoding");
        }
    }

    let mut sha = Sha256::new();
    let hash_handling = req.vcl.clone().hash(req, &mut sha);
    if hash_handling == Handling::Fail {
        recv_handling = Handling::Fail;
    } else {
        assert_eq!(hash_handling, Handling::Lookup);
    }
    req.digest = sha.finalize().into();

    match recv_handling {
        Handling::Vcl => {
            log::debug!(
                "req {}: illegal return(vcl): {}",
                req.xid,
                if req.restarts > 0 {
                    "not after restarts"
                } else {
                    "only from active VCL"
                }
            );
            req.err_code = 503;
            req.step = ReqStep::Synth;
        }
        Handling::Purge => req.step = ReqStep::Purge,
        Handling::Hash => req.step = ReqStep::Lookup,
        Handling::Pipe => {
            if req.esi_level > 0 {
                log::debug!(
                    "req {}: vcl_recv returned pipe for ESI included object, doing pass",
                    req.xid
                );
                req.step = ReqStep::Pass;
            } else if req.http0.protover() > 11 {
                log::debug!(
                    "req {}: vcl_recv returned pipe for HTTP/2 request, doing pass",
                    req.xid
                );
                req.step = ReqStep::Pass;
            } else {
                req.step = ReqStep::Pipe;
            }
        }
        Handling::Pass => req.step = ReqStep::Pass,
        Handling::Synth => req.step = ReqStep::Synth,
        Handling::Restart => req.step = ReqStep::Restart,
        Handling::Fail => req.step = ReqStep::VclFail,
        h => {
            log::debug!("req {}: illegal return from vcl_recv: {h:?}", req.xid);
            req.err_code = 503;
            req.step = ReqStep::Synth;
        }
    }
    ReqFsmNxt::More
}

/// Consult the hash. May disembark on a busy objhead.
fn cnt_lookup(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());

    let had_wait = req.resume.take().is_some();

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    let la = LookupArgs {
        digest: req.digest,
        req_http: &req.http,
        now: crate::tim::real(),
        always_miss: req.hash_always_miss,
        ignore_busy: req.hash_ignore_busy,
        ignore_vary: req.hash_ignore_vary,
        d_grace: req.d_grace,
    };
    let (outcome, variants) = cache.hsh.lookup(&la, move || {
        Box::new(move || {
            let _ = tx.send(());
        })
    });

    if variants >= req.params.vary_notice {
        log::debug!("req {}: high number of variants ({variants})", req.xid);
    }
    if had_wait {
        req.ts("Waitinglist");
    }

    match outcome {
        Lookup::Busy => {
            // we lost to a busy object; resume at lookup when it settles
            req.resume = Some(rx);
            req.step = ReqStep::Lookup;
            ReqFsmNxt::Disembark
        }
        Lookup::Miss { busy, stale } => {
            req.objcore = Some(busy);
            req.stale_oc = stale;
            req.step = ReqStep::Miss;
            ReqFsmNxt::More
        }
        Lookup::HitMiss { busy, stale } => {
            req.objcore = Some(busy);
            req.stale_oc = stale;
            req.is_hitmiss = true;
            req.step = ReqStep::Miss;
            ReqFsmNxt::More
        }
        Lookup::HitPass => {
            req.is_hitpass = true;
            req.step = ReqStep::Pass;
            ReqFsmNxt::More
        }
        Lookup::Hit { oc } => lookup_hit(wrk, req, cache, oc, None),
        Lookup::Grace { oc, busy } => lookup_hit(wrk, req, cache, oc, Some(busy)),
    }
}

/// The hit/grace tail of `cnt_lookup`.
fn lookup_hit(
    wrk: &mut Worker,
    req: &mut Req,
    cache: &Cache,
    oc: Arc<ObjCore>,
    grace_busy: Option<Arc<ObjCore>>,
) -> ReqFsmNxt {
    assert!(!oc.has_flag(oc_flags::BUSY));
    assert!(!oc.has_flag(oc_flags::HFM));
    req.objcore = Some(oc.clone());

    match req.vcl.clone().hit(req) {
        Handling::Deliver => {
            if let Some(busy) = grace_busy {
                // expired into grace: refresh in the background with the
                // hit object as revalidation template
                cache.schedule_fetch(wrk, req, busy.clone(), Some(oc), FetchMode::Background);
                wrk.stats.s_fetch += 1;
                wrk.stats.s_bgfetch += 1;
                wrk.stats.cache_hit_grace += 1;
                cache.hsh.deref(busy, true);
            } else {
                req.vrb_ignore();
            }
            wrk.stats.cache_hit += 1;
            req.is_hit = true;
            req.step = ReqStep::Deliver;
            return ReqFsmNxt::More;
        }
        Handling::Restart => req.step = ReqStep::Restart,
        Handling::Fail => req.step = ReqStep::VclFail,
        Handling::Synth => req.step = ReqStep::Synth,
        Handling::Pass => {
            wrk.stats.cache_hit += 1;
            req.is_hit = true;
            req.step = ReqStep::Pass;
        }
        h => {
            log::debug!("req {}: illegal return from vcl_hit: {h:?}", req.xid);
            req.step = ReqStep::VclFail;
        }
    }

    // drop our object, we won't need it
    let oc = req.objcore.take().unwrap();
    cache.hsh.deref(oc, true);
    if let Some(busy) = grace_busy {
        cache.hsh.withdraw(&busy);
    }
    ReqFsmNxt::More
}

/// Cache miss: run policy, then fetch into the busy placeholder.
fn cnt_miss(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_some());

    match req.vcl.clone().miss(req) {
        Handling::Fetch => {
            wrk.stats.cache_miss += 1;
            let busy = req.objcore.clone().unwrap();
            let stale = req.stale_oc.take();
            cache.schedule_fetch(wrk, req, busy, stale, FetchMode::Normal);
            req.step = ReqStep::Fetch;
            return ReqFsmNxt::More;
        }
        Handling::Fail => req.step = ReqStep::VclFail,
        Handling::Synth => req.step = ReqStep::Synth,
        Handling::Restart => req.step = ReqStep::Restart,
        Handling::Pass => req.step = ReqStep::Pass,
        h => {
            log::debug!("req {}: illegal return from vcl_miss: {h:?}", req.xid);
            req.step = ReqStep::VclFail;
        }
    }
    req.stale_oc = None;
    let busy = req.objcore.take().unwrap();
    cache.hsh.withdraw(&busy);
    ReqFsmNxt::More
}

/// Pass: fetch into a private object.
fn cnt_pass(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());

    match req.vcl.clone().pass(req) {
        Handling::Fail => req.step = ReqStep::VclFail,
        Handling::Synth => req.step = ReqStep::Synth,
        Handling::Restart => req.step = ReqStep::Restart,
        Handling::Fetch => {
            wrk.stats.s_pass += 1;
            let oc = cache.hsh.private();
            req.objcore = Some(oc.clone());
            cache.schedule_fetch(wrk, req, oc, None, FetchMode::Pass);
            req.step = ReqStep::Fetch;
        }
        h => {
            log::debug!("req {}: illegal return from vcl_pass: {h:?}", req.xid);
            req.step = ReqStep::VclFail;
        }
    }
    ReqFsmNxt::More
}

/// Pipe: hand the connection to the backend, wire to wire.
fn cnt_pipe(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    wrk.stats.s_pipe += 1;

    let mut bo = cache.pipe_busyobj(req);
    bo.bereq.filter_req(&req.http, true);
    bo.bereq
        .force_header("X-Varnish", &req.xid.to_string());
    bo.bereq.force_header("Connection", "close");
    if req.want100cont {
        bo.bereq.force_header("Expect", "100-continue");
        req.want100cont = false;
    }

    let handling = if req.ws.overflowed() {
        Handling::Fail
    } else {
        req.vcl.clone().pipe(req, &mut bo)
    };

    let nxt = match handling {
        Handling::Synth => {
            req.step = ReqStep::Synth;
            ReqFsmNxt::More
        }
        Handling::Pipe => {
            req.ts("Process");
            let out = req.transport.out();
            let r = match req.body_src.as_mut() {
                Some(src) => bo.director.pipe(&bo.bereq, src.as_mut(), &mut *out.lock()),
                None => bo
                    .director
                    .pipe(&bo.bereq, &mut std::io::empty(), &mut *out.lock()),
            };
            if r.is_err() {
                log::debug!("req {}: pipe failed", req.xid);
            }
            req.sess.close(StreamClose::TxPipe);
            req.doclose = StreamClose::TxPipe;
            ReqFsmNxt::Done
        }
        _ => {
            req.step = ReqStep::VclFail;
            ReqFsmNxt::More
        }
    };
    nxt
}

/// Purge every variant under the hash key, then ask policy what to answer.
fn cnt_purge(_wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());

    let la = LookupArgs {
        digest: req.digest,
        req_http: &req.http,
        now: crate::tim::real(),
        always_miss: true,
        ignore_busy: req.hash_ignore_busy,
        ignore_vary: req.hash_ignore_vary,
        d_grace: f64::NAN,
    };
    let (outcome, _) = cache.hsh.lookup(&la, || Box::new(|| {}));
    let Lookup::Miss { busy, .. } = outcome else {
        unreachable!("always-miss lookup must miss");
    };
    let oh = busy.objhead().expect("objhead on placeholder");
    let killed = cache.hsh.purge(&oh);
    log::debug!("req {}: purged {killed} objects", req.xid);
    cache.hsh.withdraw(&busy);

    match req.vcl.clone().purge(req) {
        Handling::Restart => req.step = ReqStep::Restart,
        Handling::Fail => req.step = ReqStep::VclFail,
        Handling::Synth => req.step = ReqStep::Synth,
        h => {
            log::debug!("req {}: illegal return from vcl_purge: {h:?}", req.xid);
            req.step = ReqStep::VclFail;
        }
    }
    ReqFsmNxt::More
}

/// A fetch was scheduled on our behalf; decide what it got us.
fn cnt_fetch(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.stale_oc.is_none());
    wrk.stats.s_fetch += 1;
    req.vrb_ignore();

    let oc = req.objcore.clone().expect("objcore in fetch");
    if oc.has_flag(oc_flags::FAILED) {
        req.err_code = 503;
        req.step = ReqStep::Synth;
        let oc = req.objcore.take().unwrap();
        cache.hsh.deref(oc, true);
        return ReqFsmNxt::More;
    }
    req.step = ReqStep::Deliver;
    ReqFsmNxt::More
}

/// Seed the response and run `vcl_deliver`.
fn cnt_deliver(_wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.stale_oc.is_none());
    let oc = req.objcore.clone().expect("objcore in deliver");

    if deliver::resp_setup_deliver(req).is_err() {
        let oc = req.objcore.take().unwrap();
        cache.hsh.deref(oc, true);
        req.err_code = 500;
        req.step = ReqStep::Synth;
        return ReqFsmNxt::More;
    }

    let status = req.resp.status().unwrap_or(0);
    if req.params.http_range_support && status == 200 && !oc.has_flag(oc_flags::PRIVATE) {
        filters::range::announce(&mut req.resp);
    }

    match req.vcl.clone().deliver(req) {
        Handling::Deliver => {}
        h => {
            let oc = req.objcore.take().unwrap();
            if oc.has_flag(oc_flags::HFM) && oc.get_boc().is_some() {
                oc.cancel();
            }
            cache.hsh.deref(oc, true);
            req.resp.setup();
            match h {
                Handling::Restart => req.step = ReqStep::Restart,
                Handling::Fail => req.step = ReqStep::VclFail,
                Handling::Synth => req.step = ReqStep::Synth,
                other => {
                    log::debug!("req {}: illegal return from vcl_deliver: {other:?}", req.xid);
                    req.step = ReqStep::VclFail;
                }
            }
            return ReqFsmNxt::More;
        }
    }

    req.ts("Process");

    if req.esi_level == 0 {
        let lastmod = oc.with_attrs(|a| a.lastmodified);
        if rfc2616::do_cond(&req.http, &req.resp, lastmod) {
            req.resp.put_response("HTTP/1.1", 304, None);
        }
    }

    req.step = ReqStep::Transmit;
    ReqFsmNxt::More
}

/// VCL failed; roll back and synthesize.
fn cnt_vclfail(_wrk: &mut Worker, req: &mut Req, _cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());

    req.rollback();

    if req.req_reset {
        req.err_code = 408;
        req.err_reason = Some("Client disconnected".into());
    } else {
        req.err_code = 503;
        req.err_reason = Some("VCL failed".into());
    }
    req.step = ReqStep::Synth;
    req.doclose = StreamClose::VclFailure;
    req.vdp_filter_list = None;
    ReqFsmNxt::More
}

/// Emit a synthetic response from a private transient object.
fn cnt_synth(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());

    wrk.stats.s_synth += 1;

    if req.err_code < 100 {
        req.err_code = 501;
    }
    deliver::resp_setup_synth(req);
    req.vdp_filter_list = None;

    let mut synth_body = Vec::new();
    let handling = req.vcl.clone().synth(req, &mut synth_body);
    req.ts("Process");

    if handling == Handling::Fail {
        if req.esi_level > 0 {
            // included objects cannot fail the parent; fall through
        } else {
            req.vrb_ignore();
            let status = if req.req_reset { 408 } else { 500 };
            let _ = req.transport.minimal_response(status);
            req.doclose = StreamClose::VclFailure;
            req.ts("Resp");
            req.resp.setup();
            return ReqFsmNxt::Done;
        }
    }

    if handling == Handling::Restart && req.restarts >= req.params.max_restarts {
        // out of budget, deliver what we have
    } else if handling == Handling::Restart {
        req.resp.setup();
        req.step = ReqStep::Restart;
        return ReqFsmNxt::More;
    }

    req.resp
        .force_header("Content-Length", &synth_body.len().to_string());
    if req.doclose == StreamClose::None && req.resp.has_field("connection", "close") {
        req.doclose = StreamClose::RespClose;
    }

    // discard any lingering request body before delivery
    req.vrb_ignore();

    let oc = cache.hsh.private();
    if !cache.stv_transient.new_object(synth_body.len()) {
        log::debug!("req {}: could not get storage", req.xid);
        req.doclose = StreamClose::Overload;
        req.ts("Resp");
        req.resp.setup();
        return ReqFsmNxt::Done;
    }
    oc.set_storage(cache.stv_transient.clone(), synth_body.len() as u64);
    if !synth_body.is_empty() {
        oc.body_extend(bytes::Bytes::from(synth_body.clone()));
    }
    oc.set_len(synth_body.len() as u64);
    if let Some(boc) = oc.get_boc() {
        boc.set_state(BocState::Finished);
    }
    oc.drop_boc();
    oc.clear_busy();
    req.objcore = Some(oc);

    req.step = ReqStep::Transmit;
    ReqFsmNxt::More
}

/// The mechanics of sending a response.
fn cnt_transmit(_wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(req.stale_oc.is_none());
    let oc = req.objcore.clone().expect("objcore in transmit");

    // grab a ref to the boc if there is one (streaming)
    let boc = oc.get_boc();
    if let Some(b) = &boc {
        if b.state() < BocState::Stream {
            b.wait_state(BocState::Stream);
        }
    }

    let clval = req.resp.content_length().unwrap_or(-1);
    let status = req.resp.status().unwrap_or(200);
    let head_req = req.http0.method() == Some("HEAD");

    req.resp_len = if boc.is_some() || oc.has_flag(oc_flags::FAILED) {
        clval
    } else {
        oc.len() as i64
    };

    // rfc7230 section 3.3.3
    let mut sendbody = !(head_req || status < 200 || status == 204 || status == 304);

    let mut vdc = crate::proc::deliver::Vdc::new(req.xid, req.resp_len);
    let list = req
        .vdp_filter_list
        .clone()
        .unwrap_or_else(|| filters::default_vdp_list(&req.http, &oc, status, &req.params));

    // the lease path applies when every filter in the chain can hand out
    // leases; today that is the identity chain and gunzip
    let use_vai = sendbody
        && req.params.vai_deliver
        && list.split_whitespace().all(|n| n == "gunzip");

    let mut io_chain = None;
    let stack_ret = if use_vai {
        let mut chain = crate::proc::vai::VdpioChain::new(oc.clone());
        let mut resp_len = req.resp_len;
        if list.split_whitespace().any(|n| n == "gunzip") {
            if let Some(io) =
                filters::gzip::GunzipIo::init(&req.http, &mut req.resp, &mut resp_len, &oc)
            {
                chain.push_io("gunzip", io, 2);
            }
        }
        req.resp_len = resp_len;
        io_chain = Some(chain);
        0
    } else {
        let esi_include = cache.esi_include_fn(req, &oc);
        let params = req.params.clone();
        let mut resp_len = req.resp_len;
        let mut b = filters::VdpBuild {
            req_http: &req.http,
            resp: &mut req.resp,
            resp_len: &mut resp_len,
            oc: &oc,
            params: &params,
            esi_include,
        };
        let r = filters::stack_vdp(&mut vdc, &list, &mut b);
        req.resp_len = resp_len;
        r
    };

    if stack_ret != 0 {
        log::debug!("req {}: failure to push processors", req.xid);
        req.doclose = StreamClose::Overload;
        req.acct.resp_bodybytes += vdc.close();
    } else {
        let status = req.resp.status().unwrap_or(200); // filters may rewrite
        if status < 200 || status == 204 || status == 304 {
            req.resp.unset_header("content-length");
            sendbody = false;
        } else if clval >= 0 && clval == req.resp_len {
            // reuse the C-L header
        } else if head_req && oc.has_flag(oc_flags::HFM) {
            // don't touch C-L: the length of a pass object is the
            // backend's business
        } else {
            req.resp.unset_header("content-length");
            if req.resp_len >= 0 {
                req.resp
                    .force_header("Content-Length", &req.resp_len.to_string());
            }
        }
        if req.resp_len == 0 {
            sendbody = false;
        }
        match io_chain.as_mut() {
            Some(chain) => {
                deliver::v1d_deliver_io(req, chain, sendbody);
            }
            None => {
                deliver::v1d_deliver(req, &mut vdc, sendbody);
            }
        }
    }

    req.ts("Resp");

    if req.doclose == StreamClose::None && oc.has_flag(oc_flags::FAILED) {
        // the delivered object failed mid-stream; fail the connection
        req.doclose = StreamClose::TxError;
    }

    if oc.has_flag(oc_flags::HFM) && boc.is_some() {
        // lose interest so an abandoned pass fetch can stop
        oc.cancel();
    }
    drop(boc);
    let oc = req.objcore.take().unwrap();
    cache.hsh.deref(oc, true);
    req.resp.setup();
    req.vdp_filter_list = None;
    ReqFsmNxt::Done
}

/// Start over from `vcl_recv`, within budget.
fn cnt_restart(_wrk: &mut Worker, req: &mut Req, _cache: &Cache) -> ReqFsmNxt {
    assert!(req.objcore.is_none());
    assert!(req.stale_oc.is_none());

    req.restarts += 1;
    if req.restarts > req.params.max_restarts {
        log::debug!("req {}: too many restarts", req.xid);
        req.err_code = 503;
        req.step = ReqStep::Synth;
    } else {
        req.ts("Restart");
        req.xid = crate::cache::next_xid();
        req.err_code = 0;
        req.rollback();
        req.step = ReqStep::Recv;
    }
    ReqFsmNxt::More
}

/// Kick the request around until it has had enough.
pub fn cnt_request(wrk: &mut Worker, req: &mut Req, cache: &Cache) -> ReqFsmNxt {
    assert!(matches!(req.step, ReqStep::Transport | ReqStep::Lookup));

    let mut nxt = ReqFsmNxt::More;
    while nxt == ReqFsmNxt::More {
        log::trace!("req {}: step {}", req.xid, req.step.name());
        nxt = match req.step {
            ReqStep::Transport => cnt_transport(wrk, req, cache),
            ReqStep::Restart => cnt_restart(wrk, req, cache),
            ReqStep::Recv => cnt_recv(wrk, req, cache),
            ReqStep::Pipe => cnt_pipe(wrk, req, cache),
            ReqStep::Pass => cnt_pass(wrk, req, cache),
            ReqStep::Lookup => cnt_lookup(wrk, req, cache),
            ReqStep::Purge => cnt_purge(wrk, req, cache),
            ReqStep::Miss => cnt_miss(wrk, req, cache),
            ReqStep::Fetch => cnt_fetch(wrk, req, cache),
            ReqStep::Deliver => cnt_deliver(wrk, req, cache),
            ReqStep::VclFail => cnt_vclfail(wrk, req, cache),
            ReqStep::Synth => cnt_synth(wrk, req, cache),
            ReqStep::Transmit => cnt_transmit(wrk, req, cache),
        };
    }
    if nxt == ReqFsmNxt::Done {
        req.release();
    }
    nxt
}
