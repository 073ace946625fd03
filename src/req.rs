//! The client request record
//!
//! One [`Req`] per request on a session. It is owned by one worker at a
//! time, may be parked on a waiting list between workers, and survives
//! restarts. The request body helpers live here too: discarding, spooling
//! into a body objcore for reuse, and the ingress framing they share.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::backend::Director;
use crate::deliver::Transport;
use crate::error::{VclError, VclResult};
use crate::http::Http;
use crate::objcore::{BocState, Digest, ObjCore};
use crate::param::Params;
use crate::proto::BodyStatus;
use crate::req_fsm::ReqStep;
use crate::session::{Session, StreamClose};
use crate::storage::Stevedore;
use crate::tim;
use crate::vcl::Vcl;
use crate::ws::{Snapshot, Workspace};

/// Byte accounting reported when the request ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqAcct {
    pub req_hdrbytes: u64,
    pub req_bodybytes: u64,
    pub resp_hdrbytes: u64,
    pub resp_bodybytes: u64,
}

pub struct Req {
    pub sess: Arc<Session>,
    pub xid: u64,
    pub esi_level: u32,
    pub restarts: u32,

    pub t_first: f64,
    pub t_prev: f64,
    pub t_req: f64,

    pub ws: Workspace,
    /// Snapshot taken after transport setup, restored on restart
    pub ws_req: Option<Snapshot>,

    /// Pristine request head, for restarts and ESI
    pub http0: Http,
    /// Working request head
    pub http: Http,
    pub resp: Http,

    pub body_status: BodyStatus,
    /// Ingress byte source positioned after the request head
    pub body_src: Option<Box<dyn Read + Send>>,
    /// Spooled request body
    pub body_oc: Option<Arc<ObjCore>>,

    pub objcore: Option<Arc<ObjCore>>,
    pub stale_oc: Option<Arc<ObjCore>>,

    pub digest: Digest,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,
    pub hash_ignore_vary: bool,
    pub want100cont: bool,
    pub late100cont: bool,
    pub is_hit: bool,
    pub is_hitmiss: bool,
    pub is_hitpass: bool,
    /// The client connection is already known dead
    pub req_reset: bool,

    pub err_code: u16,
    pub err_reason: Option<String>,
    pub doclose: StreamClose,

    pub director_hint: Option<Arc<dyn Director>>,
    pub vdp_filter_list: Option<String>,
    pub vfp_filter_list: Option<String>,
    pub client_identity: Option<String>,
    pub d_ttl: f64,
    pub d_grace: f64,

    pub resp_len: i64,
    pub transport: Box<dyn Transport>,
    pub acct: ReqAcct,

    pub step: ReqStep,
    /// Armed when the request parks on a waiting list
    pub resume: Option<Receiver<()>>,

    pub params: Arc<Params>,
    pub vcl: Arc<dyn Vcl>,
}

impl Req {
    pub fn new(
        sess: Arc<Session>,
        transport: Box<dyn Transport>,
        vcl: Arc<dyn Vcl>,
        xid: u64,
    ) -> Self {
        let params = crate::param::get();
        let now = tim::real();
        let max_hdr = params.http_max_hdr;
        Self {
            sess,
            xid,
            esi_level: 0,
            restarts: 0,
            t_first: now,
            t_prev: now,
            t_req: now,
            ws: Workspace::new("req", params.workspace_client),
            ws_req: None,
            http0: Http::new(max_hdr),
            http: Http::new(max_hdr),
            resp: Http::new(max_hdr),
            body_status: BodyStatus::None,
            body_src: None,
            body_oc: None,
            objcore: None,
            stale_oc: None,
            digest: [0; 32],
            hash_always_miss: false,
            hash_ignore_busy: false,
            hash_ignore_vary: false,
            want100cont: false,
            late100cont: false,
            is_hit: false,
            is_hitmiss: false,
            is_hitpass: false,
            req_reset: false,
            err_code: 0,
            err_reason: None,
            doclose: StreamClose::None,
            director_hint: None,
            vdp_filter_list: None,
            vfp_filter_list: None,
            client_identity: None,
            d_ttl: f64::NAN,
            d_grace: f64::NAN,
            resp_len: -1,
            transport,
            acct: ReqAcct::default(),
            step: ReqStep::Transport,
            resume: None,
            params,
            vcl,
        }
    }

    /// Log a processing timestamp.
    pub fn ts(&mut self, event: &str) {
        let now = tim::real();
        log::debug!(
            "req {}: Timestamp {event}: {now:.6} {:.6} {:.6}",
            self.xid,
            now - self.t_first,
            now - self.t_prev
        );
        self.t_prev = now;
    }

    /// Roll the task back for a policy failure or a restart: workspace to
    /// its post-transport state, derived settings gone.
    pub fn rollback(&mut self) {
        if let Some(snap) = self.ws_req {
            self.ws.reset(snap);
        }
        self.http = self.http0.clone();
        self.vdp_filter_list = None;
        self.vfp_filter_list = None;
        self.resp_len = -1;
        self.resp.setup();
    }

    /// Discard any request body still on the wire so the connection can be
    /// reused. Safe to call repeatedly.
    pub fn vrb_ignore(&mut self) {
        if matches!(self.body_status, BodyStatus::Cached) {
            return;
        }
        if !self.body_status.avail() {
            return;
        }
        let r = self.vrb_iterate(&mut |_| Ok(()));
        self.body_status = match r {
            Ok(_) => BodyStatus::Taken,
            Err(_) => {
                self.doclose = StreamClose::RxBody;
                BodyStatus::Error
            }
        };
    }

    /// Spool the request body into a private objcore so it can be replayed
    /// on retries and restarts. Returns the spooled length.
    pub fn vrb_cache(&mut self, stv: &Arc<dyn Stevedore>, maxsize: u64) -> VclResult<u64> {
        if matches!(self.body_status, BodyStatus::Cached) {
            return Ok(self.body_oc.as_ref().map_or(0, |oc| oc.len()));
        }
        if !self.body_status.avail() {
            self.body_status = BodyStatus::Cached;
            return Ok(0);
        }
        let oc = ObjCore::new_private();
        if !stv.new_object(0) {
            return Err(VclError::NoStorage);
        }
        oc.set_storage(stv.clone(), 0);
        let mut total: u64 = 0;
        let r = self.vrb_iterate(&mut |chunk| {
            total += chunk.len() as u64;
            if total > maxsize {
                return Err(VclError::Msg("Request body too big to cache".into()));
            }
            oc.charge(chunk.len() as u64);
            oc.body_extend(Bytes::copy_from_slice(chunk));
            Ok(())
        });
        match r {
            Ok(()) => {
                oc.set_len(total);
                if let Some(boc) = oc.get_boc() {
                    boc.set_state(BocState::Finished);
                }
                oc.drop_boc();
                oc.clear_busy();
                self.acct.req_bodybytes += total;
                self.body_oc = Some(oc);
                self.body_status = BodyStatus::Cached;
                Ok(total)
            }
            Err(e) => {
                self.body_status = BodyStatus::Error;
                self.doclose = StreamClose::RxBody;
                Err(e)
            }
        }
    }

    /// Pull the ingress body through `cb` according to its framing.
    fn vrb_iterate(
        &mut self,
        cb: &mut dyn FnMut(&[u8]) -> VclResult<()>,
    ) -> VclResult<()> {
        let Some(src) = self.body_src.as_mut() else {
            return Err(VclError::Msg("no request body source".into()));
        };
        match self.body_status {
            BodyStatus::Length(mut left) => {
                let mut buf = [0u8; 8192];
                while left > 0 {
                    let want = (left as usize).min(buf.len());
                    let n = src.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(VclError::Proto("client body short".into()));
                    }
                    left -= n as u64;
                    cb(&buf[..n])?;
                }
                Ok(())
            }
            BodyStatus::Chunked => {
                loop {
                    let line = read_chunk_line(src.as_mut())?;
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let sz = u64::from_str_radix(size_part, 16)
                        .map_err(|_| VclError::Proto("chunked header non-hex".into()))?;
                    if sz == 0 {
                        loop {
                            if read_chunk_line(src.as_mut())?.is_empty() {
                                break;
                            }
                        }
                        return Ok(());
                    }
                    let mut left = sz;
                    let mut buf = [0u8; 8192];
                    while left > 0 {
                        let want = (left as usize).min(buf.len());
                        let n = src.read(&mut buf[..want])?;
                        if n == 0 {
                            return Err(VclError::Proto("client body short".into()));
                        }
                        left -= n as u64;
                        cb(&buf[..n])?;
                    }
                    // chunk-data CRLF
                    read_chunk_line(src.as_mut())?;
                }
            }
            _ => Ok(()),
        }
    }

    /// Release per-transaction references at request end.
    pub fn release(&mut self) {
        self.body_oc = None;
        self.director_hint = None;
        self.ws.rollback();
    }
}

fn read_chunk_line(src: &mut dyn Read) -> VclResult<String> {
    let mut line = Vec::new();
    loop {
        let mut b = [0u8; 1];
        if src.read(&mut b)? == 0 {
            return Err(VclError::Proto("chunked: premature close".into()));
        }
        if b[0] == b'\n' {
            break;
        }
        if b[0] != b'\r' {
            line.push(b[0]);
        }
        if line.len() > 128 {
            return Err(VclError::Proto("chunked: bogus header".into()));
        }
    }
    String::from_utf8(line).map_err(|_| VclError::Proto("chunked: bogus header".into()))
}

impl std::fmt::Debug for Req {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req {} step {:?}", self.xid, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliver::MemTransport;
    use crate::storage::MallocStevedore;
    use crate::vcl::BuiltinVcl;

    fn req_with_body(bs: BodyStatus, wire: &[u8]) -> Req {
        let mut req = Req::new(
            Session::new(1, None),
            Box::new(MemTransport::new()),
            Arc::new(BuiltinVcl),
            42,
        );
        req.body_status = bs;
        req.body_src = Some(Box::new(std::io::Cursor::new(wire.to_vec())));
        req
    }

    #[test]
    fn cache_body_then_replay() {
        let mut req = req_with_body(BodyStatus::Length(5), b"hello");
        let stv: Arc<dyn Stevedore> = MallocStevedore::new("t", None);
        assert_eq!(req.vrb_cache(&stv, 1024).unwrap(), 5);
        assert!(matches!(req.body_status, BodyStatus::Cached));

        let oc = req.body_oc.clone().unwrap();
        let mut out = Vec::new();
        oc.iterate(false, &mut |b, _| {
            out.extend_from_slice(b);
            0
        });
        assert_eq!(out, b"hello");
        // caching again is idempotent
        assert_eq!(req.vrb_cache(&stv, 1024).unwrap(), 5);
    }

    #[test]
    fn chunked_ingress_body() {
        let mut req = req_with_body(BodyStatus::Chunked, b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
        let stv: Arc<dyn Stevedore> = MallocStevedore::new("t", None);
        assert_eq!(req.vrb_cache(&stv, 1024).unwrap(), 5);
    }

    #[test]
    fn oversized_body_is_refused() {
        let mut req = req_with_body(BodyStatus::Length(5), b"hello");
        let stv: Arc<dyn Stevedore> = MallocStevedore::new("t", None);
        assert!(req.vrb_cache(&stv, 3).is_err());
        assert!(matches!(req.body_status, BodyStatus::Error));
        assert_eq!(req.doclose, StreamClose::RxBody);
    }

    #[test]
    fn ignore_drains_the_wire() {
        let mut req = req_with_body(BodyStatus::Length(5), b"hello");
        req.vrb_ignore();
        assert!(matches!(req.body_status, BodyStatus::Taken));
        // the source is drained
        let mut rest = Vec::new();
        req.body_src.as_mut().unwrap().read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn short_body_is_an_error() {
        let mut req = req_with_body(BodyStatus::Length(10), b"hello");
        req.vrb_ignore();
        assert!(matches!(req.body_status, BodyStatus::Error));
    }
}
