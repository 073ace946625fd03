//! Top-level wiring
//!
//! A [`Cache`] owns the hash, the storage backends, the worker pool and the
//! active policy, and knows how to drive a request through the client FSM,
//! including the two suspension points (waiting list, fetch coordination)
//! and ESI sub-deliveries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Director;
use crate::deliver::{MemTransport, Transport};
use crate::error::{VclError, VclResult};
use crate::fetch::{vbf_fetch, BusyObj, FetchHandoff, FetchMode};
use crate::filters::esi::{EsiProgram, IncludeFn};
use crate::hash::{Hsh, Lookup, LookupArgs};
use crate::http::Http;
use crate::objcore::{obj_flags, oc_flags, ObjCore};
use crate::proc::fetch::Vfc;
use crate::proto;
use crate::req::Req;
use crate::req_fsm::{cnt_request, ReqFsmNxt};
use crate::session::Session;
use crate::storage::{MallocStevedore, Stevedore};
use crate::vcl::{BuiltinVcl, Vcl};
use crate::worker::{Pool, Worker, WrkStats};
use crate::ws::Workspace;

static XID: AtomicU64 = AtomicU64::new(1000);

/// Allocate a transaction id (shared by requests and backend requests).
pub fn next_xid() -> u64 {
    XID.fetch_add(1, Ordering::Relaxed)
}

pub struct Cache {
    /// Self handle for closures that must own a reference
    me: std::sync::Weak<Cache>,
    pub hsh: Arc<Hsh>,
    pub stv: Arc<dyn Stevedore>,
    pub stv_transient: Arc<dyn Stevedore>,
    pub pool: Arc<Pool>,
    pub director: Arc<dyn Director>,
    vcl: RwLock<Arc<dyn Vcl>>,
    session_ids: AtomicU64,
}

impl Cache {
    pub fn new(director: Arc<dyn Director>) -> Arc<Self> {
        Self::with_vcl(director, Arc::new(BuiltinVcl))
    }

    pub fn with_vcl(director: Arc<dyn Director>, vcl: Arc<dyn Vcl>) -> Arc<Self> {
        Self::with_config(director, vcl, MallocStevedore::new("s0", None), 8)
    }

    pub fn with_config(
        director: Arc<dyn Director>,
        vcl: Arc<dyn Vcl>,
        stv: Arc<dyn Stevedore>,
        threads: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            hsh: Arc::new(Hsh::new()),
            stv,
            stv_transient: MallocStevedore::transient(),
            pool: Pool::new(threads, 1024),
            director,
            vcl: RwLock::new(vcl),
            session_ids: AtomicU64::new(1),
        })
    }

    /// Install a new policy bundle; running requests keep the one they
    /// started with.
    pub fn use_vcl(&self, vcl: Arc<dyn Vcl>) {
        *self.vcl.write() = vcl;
    }

    pub fn active_vcl(&self) -> Arc<dyn Vcl> {
        self.vcl.read().clone()
    }

    pub fn new_session(&self, addr: Option<std::net::SocketAddr>) -> Arc<Session> {
        Session::new(self.session_ids.fetch_add(1, Ordering::Relaxed), addr)
    }

    pub fn stats(&self) -> WrkStats {
        self.pool.stats()
    }

    /// Parse a request head and set up a [`Req`] ready for
    /// [`Cache::serve`]. A framing error is returned as the status to send.
    pub fn http1_req(
        &self,
        sess: Arc<Session>,
        transport: Box<dyn Transport>,
        head: &[u8],
        body_src: Option<Box<dyn std::io::Read + Send>>,
    ) -> Result<Req, u16> {
        let mut req = Req::new(sess, transport, self.active_vcl(), next_xid());
        req.acct.req_hdrbytes = head.len() as u64;
        if proto::parse_req_head(&mut req.http, head).is_err() {
            return Err(400);
        }
        req.body_status = proto::req_body_status(&req.http);
        req.body_src = body_src;
        Ok(req)
    }

    /// Drive a request to completion, resuming it over waiting-list parks.
    pub fn serve(&self, req: &mut Req) {
        let mut wrk = self.pool.worker();
        loop {
            match cnt_request(&mut wrk, req, self) {
                ReqFsmNxt::Done => break,
                ReqFsmNxt::Disembark => {
                    let rx = req.resume.clone().expect("resume channel when parked");
                    // the rush callback may already have fired
                    let _ = rx.recv();
                }
                ReqFsmNxt::More => unreachable!(),
            }
        }
        wrk.flush_stats();
    }

    /// Schedule a backend fetch for `oc` on behalf of `req`.
    pub fn schedule_fetch(
        &self,
        wrk: &mut Worker,
        req: &mut Req,
        oc: Arc<ObjCore>,
        stale: Option<Arc<ObjCore>>,
        mode: FetchMode,
    ) {
        let h = FetchHandoff {
            hsh: self.hsh.clone(),
            pool: self.pool.clone(),
            stv_default: self.stv.clone(),
            stv_transient: self.stv_transient.clone(),
            director: self.director.clone(),
            vcl: req.vcl.clone(),
            xid: next_xid(),
        };
        vbf_fetch(wrk, h, req, oc, stale, mode);
    }

    /// A minimal busyobj for pipe mode: policy gets to see and modify the
    /// bereq before the bytes start flowing.
    pub fn pipe_busyobj(&self, req: &Req) -> BusyObj {
        let params = req.params.clone();
        let max_hdr = params.http_max_hdr;
        let oc = self.hsh.private();
        BusyObj {
            xid: next_xid(),
            ws: Workspace::new("bo", params.workspace_backend),
            bereq0: Http::new(max_hdr),
            bereq: Http::new(max_hdr),
            beresp: Http::new(max_hdr),
            mode: FetchMode::Pass,
            is_bgfetch: false,
            uncacheable: true,
            do_stream: false,
            do_esi: false,
            do_gzip: false,
            do_gunzip: false,
            was_304: false,
            err_code: 0,
            err_reason: None,
            retries: 0,
            max_retries: params.max_retries,
            no_retry: Some("pipe".into()),
            connect_timeout: f64::NAN,
            first_byte_timeout: f64::NAN,
            between_bytes_timeout: f64::NAN,
            storage: None,
            stv_default: self.stv.clone(),
            stv_transient: self.stv_transient.clone(),
            director: req.director_hint.clone().unwrap_or_else(|| self.director.clone()),
            fetch_oc: oc,
            stale_oc: None,
            bereq_body: None,
            htc: None,
            vfc: Vfc::new(0, params.fetch_chunksize),
            req: None,
            digest: req.digest,
            vfp_filter_list: None,
            t_first: f64::NAN,
            t_prev: f64::NAN,
            t_resp: f64::NAN,
            ws_bo: None,
            hsh: self.hsh.clone(),
            params,
            vcl: req.vcl.clone(),
        }
    }

    /// Resolve one object for an ESI include (or a plain internal
    /// subrequest): lookup, coalesce, fetch on miss.
    fn lookup_or_fetch(
        &self,
        wrk: &mut Worker,
        parent: &Req,
        url: &str,
        esi_level: u32,
    ) -> VclResult<Arc<ObjCore>> {
        // a child request carrying just what lookup and fetch need
        let mut child = Req::new(
            parent.sess.clone(),
            Box::new(MemTransport::new()),
            parent.vcl.clone(),
            next_xid(),
        );
        child.esi_level = esi_level;
        child.http.set_method("GET");
        child.http.set_url(url);
        child.http.set_proto("HTTP/1.1");
        if let Some(host) = parent.http.header("host") {
            let _ = child.http.set_header("Host", host);
        }
        if crate::rfc2616::req_gzip(&parent.http) {
            let _ = child.http.set_header("Accept-Encoding", "gzip");
        }
        child.http0 = child.http.clone();
        child.director_hint = parent.director_hint.clone();

        let mut sha = sha2::Sha256::new();
        let _ = child.vcl.clone().hash(&child, &mut sha);
        use sha2::Digest as _;
        child.digest = sha.finalize().into();

        loop {
            let (tx, rx) = crossbeam_channel::bounded::<()>(1);
            let la = LookupArgs {
                digest: child.digest,
                req_http: &child.http,
                now: crate::tim::real(),
                always_miss: false,
                ignore_busy: false,
                ignore_vary: false,
                d_grace: f64::NAN,
            };
            let (outcome, _) = self.hsh.lookup(&la, move || {
                Box::new(move || {
                    let _ = tx.send(());
                })
            });
            let oc = match outcome {
                Lookup::Busy => {
                    let _ = rx.recv();
                    continue;
                }
                Lookup::Hit { oc } => oc,
                Lookup::Grace { oc, busy } => {
                    // includes do not refresh; leave that to a top request
                    self.hsh.withdraw(&busy);
                    oc
                }
                Lookup::Miss { busy, stale } | Lookup::HitMiss { busy, stale } => {
                    self.schedule_fetch(wrk, &mut child, busy.clone(), stale, FetchMode::Normal);
                    busy
                }
                Lookup::HitPass => {
                    let oc = self.hsh.private();
                    self.schedule_fetch(wrk, &mut child, oc.clone(), None, FetchMode::Pass);
                    oc
                }
            };
            if oc.has_flag(oc_flags::FAILED) {
                return Err(VclError::Msg(format!("include fetch of {url} failed")));
            }
            return Ok(oc);
        }
    }

    /// Deliver an object's (possibly ESI-processed) plain body through
    /// `push`, expanding nested includes depth-first.
    fn esi_splice(
        &self,
        wrk: &mut Worker,
        parent: &Req,
        url: &str,
        esi_level: u32,
        push: &mut dyn FnMut(&[u8]) -> VclResult<()>,
    ) -> VclResult<()> {
        if esi_level > parent.params.max_esi_depth {
            return Err(VclError::Msg("ESI depth limit exceeded".into()));
        }
        let oc = self.lookup_or_fetch(wrk, parent, url, esi_level)?;

        let program = if oc.has_obj_flag(obj_flags::ESIPROC) {
            oc.with_attrs(|a| a.esidata.clone())
                .map(|d| EsiProgram::decode(&d))
                .transpose()?
        } else {
            None
        };

        match program {
            None => {
                let mut err = None;
                oc.iterate(false, &mut |buf, _| match push(buf) {
                    Ok(()) => 0,
                    Err(e) => {
                        err = Some(e);
                        -1
                    }
                });
                err.map_or(Ok(()), Err)
            }
            Some(program) => {
                // walk the program: literals from storage, includes recurse
                let mut off: u64 = 0;
                let mut next = 0usize;
                let mut err: Option<VclError> = None;
                oc.iterate(false, &mut |buf, _| {
                    let mut p = buf;
                    while !p.is_empty() {
                        while program.includes.get(next).is_some_and(|i| i.off == off) {
                            let src = program.includes[next].src.clone();
                            next += 1;
                            if let Err(e) =
                                self.esi_splice(wrk, parent, &src, esi_level + 1, push)
                            {
                                err = Some(e);
                                return -1;
                            }
                        }
                        let until = program
                            .includes
                            .get(next)
                            .map_or(u64::MAX, |i| i.off);
                        let l = ((until - off) as usize).min(p.len());
                        if let Err(e) = push(&p[..l]) {
                            err = Some(e);
                            return -1;
                        }
                        off += l as u64;
                        p = &p[l..];
                    }
                    0
                });
                if err.is_none() {
                    while program.includes.get(next).is_some_and(|i| i.off == off) {
                        let src = program.includes[next].src.clone();
                        next += 1;
                        if let Err(e) = self.esi_splice(wrk, parent, &src, esi_level + 1, push) {
                            err = Some(e);
                            break;
                        }
                    }
                }
                err.map_or(Ok(()), Err)
            }
        }
    }

    /// The include callback handed to the delivery-side ESI expander.
    pub fn esi_include_fn(&self, req: &Req, oc: &Arc<ObjCore>) -> Option<IncludeFn> {
        if !oc.has_obj_flag(obj_flags::ESIPROC) {
            return None;
        }
        let cache = self.me.upgrade().expect("cache still referenced");
        let level = req.esi_level;
        // the child carries what the splice path needs from the parent
        let mut parent = Req::new(
            req.sess.clone(),
            Box::new(MemTransport::new()),
            req.vcl.clone(),
            req.xid,
        );
        parent.http = req.http.clone();
        parent.director_hint = req.director_hint.clone();
        parent.esi_level = level;

        Some(Box::new(move |src, ctx| {
            let mut wrk = cache.pool.worker();
            let mut push = |buf: &[u8]| -> VclResult<()> {
                if buf.is_empty() {
                    return Ok(());
                }
                match ctx.push(crate::proc::deliver::VdpAction::Flush, buf) {
                    crate::proc::deliver::PushResult::Err => {
                        Err(VclError::Msg("include delivery failed".into()))
                    }
                    _ => Ok(()),
                }
            };
            cache.esi_splice(&mut wrk, &parent, src, level + 1, &mut push)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xids_are_unique_and_increasing() {
        let a = next_xid();
        let b = next_xid();
        assert!(b > a);
    }
}
