//! Directors and backend connections
//!
//! A [`Director`] resolves a backend at fetch time: it sends the backend
//! request and produces a [`BackendConn`] carrying the parsed response head
//! metadata and the raw body byte source. The HTTP/1 body framing readers
//! ([`V1fStraight`], [`V1fChunked`], [`V1fEof`]) are ordinary fetch
//! processors stacked at the wire end of the fetch chain.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{VclError, VclResult};
use crate::http::Http;
use crate::lck::{Lck, LockClass};
use crate::objcore::ObjCore;
use crate::proc::fetch::{FetchCtx, FetchProcessor, PullResult, Vfc};
use crate::proc::InitResult;
use crate::proto::{self, BodyStatus};
use crate::session::StreamClose;

/// Resolved per-fetch timeouts (NaN already replaced by parameter values).
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    pub connect: f64,
    pub first_byte: f64,
    pub between_bytes: f64,
}

/// One open backend exchange.
pub struct BackendConn {
    pub body_status: BodyStatus,
    pub content_length: i64,
    pub doclose: StreamClose,
    src: Box<dyn Read + Send>,
}

impl BackendConn {
    pub fn new(body_status: BodyStatus, content_length: i64, src: Box<dyn Read + Send>) -> Self {
        Self {
            body_status,
            content_length,
            doclose: StreamClose::None,
            src,
        }
    }
}

impl std::fmt::Debug for BackendConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "htc {:?} cl={}", self.body_status, self.content_length)
    }
}

/// Shared handle on the connection: the busyobj keeps it for doclose
/// bookkeeping while the body reader pulls from it.
pub type Htc = Arc<Lck<BackendConn>>;

pub fn htc(conn: BackendConn) -> Htc {
    Arc::new(Lck::new(LockClass::Misc, conn))
}

/// A request body carried to the backend: always a previously cached body
/// objcore.
#[derive(Debug, Clone)]
pub struct BereqBody {
    pub oc: Arc<ObjCore>,
}

/// Backend-selection policy at fetch time.
pub trait Director: Send + Sync {
    fn name(&self) -> &str;

    /// Send `bereq` (plus `body`, when given) and parse the response head
    /// into `beresp`.
    fn gethdrs(
        &self,
        bereq: &Http,
        body: Option<&BereqBody>,
        beresp: &mut Http,
        t: &FetchTimeouts,
    ) -> VclResult<BackendConn>;

    fn healthy(&self) -> bool {
        true
    }

    /// Wire-to-wire copy for pipe mode.
    fn pipe(&self, _bereq: &Http, _client: &mut dyn Read, _out: &mut dyn Write) -> VclResult<()> {
        Err(VclError::Msg(format!("director {} cannot pipe", self.name())))
    }
}

/// Stack the right body reader for the connection's framing.
pub fn push_body_reader(vfc: &mut Vfc, htc: &Htc) -> bool {
    let (bs, cl) = {
        let g = htc.lock();
        (g.body_status, g.content_length)
    };
    match bs {
        BodyStatus::Length(_) => vfc.push_processor(
            "v1f_straight",
            InitResult::Ok(Box::new(V1fStraight {
                htc: htc.clone(),
                remaining: cl.max(0) as u64,
            })),
        ),
        BodyStatus::Chunked => vfc.push_processor(
            "v1f_chunked",
            InitResult::Ok(Box::new(V1fChunked {
                htc: htc.clone(),
                state: ChunkState::Header,
            })),
        ),
        BodyStatus::Eof => vfc.push_processor(
            "v1f_eof",
            InitResult::Ok(Box::new(V1fEof { htc: htc.clone() })),
        ),
        _ => {
            vfc.error("no body to read");
            false
        }
    }
}

/// `Content-Length` framed body.
pub struct V1fStraight {
    htc: Htc,
    remaining: u64,
}

impl FetchProcessor for V1fStraight {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        if self.remaining == 0 {
            return PullResult::End(0);
        }
        let want = (self.remaining as usize).min(buf.len());
        let n = match self.htc.lock().src.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) => {
                ctx.error(&format!("straight read: {e}"));
                return PullResult::Err;
            }
        };
        if n == 0 {
            self.htc.lock().doclose = StreamClose::RxTimeout;
            ctx.error("straight insufficient bytes");
            return PullResult::Err;
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            PullResult::End(n)
        } else {
            PullResult::Ok(n)
        }
    }
}

#[derive(Clone, Copy)]
enum ChunkState {
    Header,
    Data(u64),
    /// CRLF after a chunk's data
    DataEnd,
    Trailers,
    Done,
}

/// `Transfer-Encoding: chunked` framed body.
pub struct V1fChunked {
    htc: Htc,
    state: ChunkState,
}

impl V1fChunked {
    fn read_line(&mut self) -> VclResult<String> {
        let mut line = Vec::new();
        let mut g = self.htc.lock();
        loop {
            let mut b = [0u8; 1];
            if g.src.read(&mut b)? == 0 {
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
}

impl FetchProcessor for V1fChunked {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        loop {
            match self.state {
                ChunkState::Header => {
                    let line = match self.read_line() {
                        Ok(l) => l,
                        Err(e) => {
                            ctx.error(&format!("chunked read: {e}"));
                            return PullResult::Err;
                        }
                    };
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let Ok(sz) = u64::from_str_radix(size_part, 16) else {
                        ctx.error("chunked header non-hex");
                        return PullResult::Err;
                    };
                    self.state = if sz == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(sz)
                    };
                }
                ChunkState::Data(left) => {
                    let want = (left as usize).min(buf.len());
                    let n = match self.htc.lock().src.read(&mut buf[..want]) {
                        Ok(0) => {
                            ctx.error("chunked: premature close in data");
                            return PullResult::Err;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            ctx.error(&format!("chunked read: {e}"));
                            return PullResult::Err;
                        }
                    };
                    self.state = if left == n as u64 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left - n as u64)
                    };
                    return PullResult::Ok(n);
                }
                ChunkState::DataEnd => {
                    if let Err(e) = self.read_line() {
                        ctx.error(&format!("chunked read: {e}"));
                        return PullResult::Err;
                    }
                    self.state = ChunkState::Header;
                }
                ChunkState::Trailers => {
                    // trailers are read and dropped until the blank line
                    loop {
                        match self.read_line() {
                            Ok(l) if l.is_empty() => break,
                            Ok(_) => {}
                            Err(e) => {
                                ctx.error(&format!("chunked read: {e}"));
                                return PullResult::Err;
                            }
                        }
                    }
                    self.state = ChunkState::Done;
                }
                ChunkState::Done => return PullResult::End(0),
            }
        }
    }
}

/// Read-to-EOF body (HTTP/1.0 style responses).
pub struct V1fEof {
    htc: Htc,
}

impl FetchProcessor for V1fEof {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        match self.htc.lock().src.read(buf) {
            Ok(0) => PullResult::End(0),
            Ok(n) => PullResult::Ok(n),
            Err(e) => {
                ctx.error(&format!("eof read: {e}"));
                PullResult::Err
            }
        }
    }
}

/// A byte source with a buffered prefix (bytes read past the response head).
struct ChainRead {
    first: std::io::Cursor<Vec<u8>>,
    rest: TcpStream,
}

impl Read for ChainRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.first.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        self.rest.read(buf)
    }
}

/// A plain HTTP/1.1 TCP backend.
pub struct Http1Director {
    name: String,
    addr: SocketAddr,
}

impl Http1Director {
    pub fn new(name: &str, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            addr,
        })
    }
}

fn dur(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

impl Director for Http1Director {
    fn name(&self) -> &str {
        &self.name
    }

    fn gethdrs(
        &self,
        bereq: &Http,
        body: Option<&BereqBody>,
        beresp: &mut Http,
        t: &FetchTimeouts,
    ) -> VclResult<BackendConn> {
        let timeout = dur(t.connect).unwrap_or(Duration::from_secs(3));
        let mut stream = TcpStream::connect_timeout(&self.addr, timeout)?;
        stream.set_nodelay(true)?;

        let mut head = Vec::with_capacity(1024);
        proto::write_req_head(bereq, &mut head);
        stream.write_all(&head)?;

        // a cached request body has a known length and is replayed verbatim
        if let Some(b) = body {
            let mut failed = None;
            b.oc.iterate(false, &mut |chunk, _| {
                if let Err(e) = stream.write_all(chunk) {
                    failed = Some(e);
                    return -1;
                }
                0
            });
            if let Some(e) = failed {
                return Err(e.into());
            }
        }

        stream.set_read_timeout(dur(t.first_byte))?;
        let mut buf = Vec::with_capacity(4096);
        let consumed = loop {
            let mut tmp = [0u8; 2048];
            let n = stream.read(&mut tmp)?;
            if n == 0 {
                return Err(VclError::Proto("backend closed before response head".into()));
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(l) = proto::head_len(&buf) {
                break l;
            }
            if buf.len() > 64 * 1024 {
                return Err(VclError::Proto("backend response head too large".into()));
            }
        };
        proto::parse_resp_head(beresp, &buf[..consumed])?;
        let status = beresp.status().unwrap_or(0);
        let body_status = proto::resp_body_status(beresp, bereq.method(), status);
        let content_length = beresp.content_length().unwrap_or(-1);

        stream.set_read_timeout(dur(t.between_bytes))?;
        let src = ChainRead {
            first: std::io::Cursor::new(buf[consumed..].to_vec()),
            rest: stream,
        };
        Ok(BackendConn::new(body_status, content_length, Box::new(src)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MallocStevedore;

    fn run_reader(bs: BodyStatus, cl: i64, wire: &[u8]) -> Result<Vec<u8>, ()> {
        let conn = BackendConn::new(bs, cl, Box::new(std::io::Cursor::new(wire.to_vec())));
        let h = htc(conn);
        let oc = ObjCore::new_busy([8; 32]);
        let mut vfc = Vfc::new(1, 16);
        vfc.attach(oc.clone(), MallocStevedore::new("t", None));
        assert!(push_body_reader(&mut vfc, &h));
        loop {
            let mut chunk = vfc.take_chunk(16).unwrap();
            match vfc.suck_top(&mut chunk) {
                PullResult::Ok(l) => vfc.put_chunk(chunk, l),
                PullResult::End(l) => {
                    vfc.put_chunk(chunk, l);
                    break;
                }
                PullResult::Err => return Err(()),
            }
        }
        oc.get_boc().unwrap().set_state(crate::objcore::BocState::Finished);
        oc.drop_boc();
        let mut out = Vec::new();
        oc.iterate(false, &mut |b, _| {
            out.extend_from_slice(b);
            0
        });
        Ok(out)
    }

    #[test]
    fn straight_reader_honors_content_length() {
        let out = run_reader(BodyStatus::Length(5), 5, b"helloEXTRA").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn straight_reader_fails_on_short_body() {
        assert!(run_reader(BodyStatus::Length(10), 10, b"hello").is_err());
    }

    #[test]
    fn chunked_reader_reassembles() {
        let wire = b"3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n";
        let out = run_reader(BodyStatus::Chunked, -1, wire).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn chunked_reader_accepts_extensions_and_trailers() {
        let wire = b"5;ext=1\r\nhello\r\n0\r\nX-Trailer: v\r\n\r\n";
        let out = run_reader(BodyStatus::Chunked, -1, wire).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn chunked_reader_rejects_junk_sizes() {
        assert!(run_reader(BodyStatus::Chunked, -1, b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn eof_reader_takes_everything() {
        let out = run_reader(BodyStatus::Eof, -1, b"anything goes").unwrap();
        assert_eq!(out, b"anything goes");
    }
}
