//! Response setup and the HTTP/1 delivery shim
//!
//! The transmit step owns the policy of *what* to send; this module owns the
//! mechanics: seeding the response from stored headers, synthesizing error
//! response heads, and the wire-writer delivery processor at the end of
//! every chain.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::VclResult;
use crate::http;
use crate::objcore::obj_flags;
use crate::proc::deliver::{DeliverCtx, DeliveryProcessor, PushResult, Vdc, VdpAction};
use crate::proc::vai::{Scarab, VdpioChain, SCARAB_END};
use crate::proto;
use crate::req::Req;
use crate::rfc2616;
use crate::session::StreamClose;
use crate::tim;

/// Shared sink a transport writes into.
pub type Out = Arc<Mutex<dyn Write + Send>>;

/// The wire side of a client connection, as much of it as the FSM needs.
pub trait Transport: Send {
    fn out(&self) -> Out;

    /// Emit a bare status line response (100, 400, 417, 500).
    fn minimal_response(&mut self, status: u16) -> VclResult<()> {
        let line = format!(
            "HTTP/1.1 {status} {}\r\n\r\n",
            http::default_reason(status)
        );
        self.out().lock().write_all(line.as_bytes())?;
        Ok(())
    }
}

/// In-memory transport: tests and ESI sub-deliveries.
pub struct MemTransport {
    pub buf: Arc<Mutex<Vec<u8>>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.buf.lock())
    }
}

impl Transport for MemTransport {
    fn out(&self) -> Out {
        self.buf.clone()
    }
}

/// TCP transport over an accepted client connection.
pub struct TcpTransport {
    out: Arc<Mutex<std::net::TcpStream>>,
}

impl TcpTransport {
    pub fn new(stream: std::net::TcpStream) -> Self {
        Self {
            out: Arc::new(Mutex::new(stream)),
        }
    }
}

impl Transport for TcpTransport {
    fn out(&self) -> Out {
        self.out.clone()
    }
}

/// Seed the client response from the stored object: decoded headers plus the
/// hop-local ones (`X-Varnish`, `Age`, `Via`).
pub fn resp_setup_deliver(req: &mut Req) -> VclResult<()> {
    let oc = req.objcore.as_ref().expect("objcore in deliver");
    let packed = oc
        .with_attrs(|a| a.headers.clone())
        .ok_or("object without headers")?;
    req.resp.decode(&packed, req.params.http_max_hdr)?;
    req.resp.set_proto("HTTP/1.1");

    if req.is_hit {
        req.resp
            .force_header("X-Varnish", &format!("{} {}", req.xid, oc.xid()));
    } else {
        req.resp.force_header("X-Varnish", &req.xid.to_string());
    }

    // Age from the last client-side timestamp; clamp to zero, the object
    // may have entered the cache after that timestamp was taken
    let age = (req.t_prev - oc.exp().t_origin).max(0.0).floor();
    req.resp.force_header("Age", &format!("{age:.0}"));
    let _ = req.resp.append_header("Via", http::via_value());

    if req.params.http_gzip_support
        && oc.has_obj_flag(obj_flags::GZIPED)
        && !rfc2616::req_gzip(&req.http)
    {
        rfc2616::weaken_etag(&mut req.resp);
    }
    Ok(())
}

/// Build a synthetic response head on the request.
pub fn resp_setup_synth(req: &mut Req) {
    req.resp.setup();
    req.resp
        .put_response("HTTP/1.1", req.err_code, req.err_reason.as_deref());
    req.resp
        .force_header("Date", &tim::format_http_date(tim::real()));
    req.resp.force_header("Server", "Varnish");
    req.resp.force_header("X-Varnish", &req.xid.to_string());
    if req.want100cont {
        // suggest closing; policy may veto by removing the header
        req.resp.force_header("Connection", "close");
    }
}

/// The terminal delivery processor: writes to the transport, framing with
/// chunked encoding when asked to.
pub struct V1dWriter {
    out: Out,
    chunked: bool,
    closed: bool,
}

impl V1dWriter {
    pub fn new(out: Out, chunked: bool) -> Self {
        Self {
            out,
            chunked,
            closed: false,
        }
    }
}

impl DeliveryProcessor for V1dWriter {
    fn push(&mut self, ctx: &mut DeliverCtx<'_>, act: VdpAction, buf: &[u8]) -> PushResult {
        if self.closed {
            return PushResult::Err;
        }
        let mut g = self.out.lock();
        let r = (|| -> std::io::Result<()> {
            if self.chunked {
                if !buf.is_empty() {
                    write!(g, "{:x}\r\n", buf.len())?;
                    g.write_all(buf)?;
                    g.write_all(b"\r\n")?;
                }
                if act == VdpAction::End {
                    g.write_all(b"0\r\n\r\n")?;
                }
            } else {
                g.write_all(buf)?;
            }
            if act != VdpAction::Null {
                g.flush()?;
            }
            Ok(())
        })();
        match r {
            Ok(()) => PushResult::Ok,
            Err(e) => {
                log::debug!("v1d: write error: {e}");
                self.closed = true;
                ctx.set_doclose(StreamClose::TxError);
                PushResult::Err
            }
        }
    }
}

/// Write the response head and drive the object through the chain.
/// Returns the body bytes that reached the wire.
pub fn v1d_deliver(req: &mut Req, vdc: &mut Vdc, sendbody: bool) -> u64 {
    let chunked = sendbody && req.resp_len < 0 && req.http.protover() >= 11;
    if chunked {
        req.resp.force_header("Transfer-Encoding", "chunked");
    }

    let out = req.transport.out();
    let mut head = Vec::with_capacity(1024);
    proto::write_resp_head(&req.resp, &mut head);
    req.acct.resp_hdrbytes += head.len() as u64;
    if out.lock().write_all(&head).is_err() {
        req.doclose = StreamClose::TxError;
        return vdc.close();
    }

    if sendbody {
        vdc.push_processor(
            "v1d",
            crate::proc::InitResult::Ok(Box::new(V1dWriter::new(out, chunked))),
        );
        let oc = req.objcore.as_ref().expect("objcore in deliver").clone();
        if vdc.deliver_obj(&oc) < 0 && req.doclose == StreamClose::None {
            if let Some(sc) = vdc.doclose {
                req.doclose = sc;
            }
        }
    }
    let bytes = vdc.close();
    req.acct.resp_bodybytes += bytes;
    bytes
}

/// Write the response head and drive the object through a lease-style
/// chain: scarabs are pulled from the chain, written to the wire, and their
/// leases returned. Returns the body bytes that reached the wire.
pub fn v1d_deliver_io(req: &mut Req, chain: &mut VdpioChain, sendbody: bool) -> u64 {
    let chunked = sendbody && req.resp_len < 0 && req.http.protover() >= 11;
    if chunked {
        req.resp.force_header("Transfer-Encoding", "chunked");
    }

    let out = req.transport.out();
    let mut head = Vec::with_capacity(1024);
    proto::write_resp_head(&req.resp, &mut head);
    req.acct.resp_hdrbytes += head.len() as u64;
    if out.lock().write_all(&head).is_err() {
        req.doclose = StreamClose::TxError;
        chain.close();
        return 0;
    }

    let mut bytes = 0u64;
    if sendbody {
        let mut scarab = Scarab::new(chain.capacity);
        loop {
            scarab.clear();
            if chain.pull(&mut scarab) < 0 {
                req.doclose = StreamClose::TxError;
                chain.return_scarab(&mut scarab);
                break;
            }
            let done = scarab.flags & SCARAB_END != 0;
            let r = {
                let mut g = out.lock();
                (|| -> std::io::Result<()> {
                    for v in &scarab.s {
                        if v.data.is_empty() {
                            continue;
                        }
                        if chunked {
                            write!(g, "{:x}\r\n", v.data.len())?;
                            g.write_all(&v.data)?;
                            g.write_all(b"\r\n")?;
                        } else {
                            g.write_all(&v.data)?;
                        }
                        bytes += v.data.len() as u64;
                    }
                    if done && chunked {
                        g.write_all(b"0\r\n\r\n")?;
                    }
                    g.flush()
                })()
            };
            chain.return_scarab(&mut scarab);
            if let Err(e) = r {
                log::debug!("v1d: write error: {e}");
                req.doclose = StreamClose::TxError;
                break;
            }
            if done {
                break;
            }
        }
    }
    chain.close();
    req.acct.resp_bodybytes += bytes;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_writer_frames_and_terminates() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut vdc = Vdc::new(1, -1);
        vdc.push_processor(
            "v1d",
            crate::proc::InitResult::Ok(Box::new(V1dWriter::new(buf.clone(), true))),
        );
        vdc.bytes(VdpAction::Flush, b"hello");
        vdc.bytes(VdpAction::End, b"!");
        vdc.close();
        assert_eq!(&*buf.lock(), b"5\r\nhello\r\n1\r\n!\r\n0\r\n\r\n");
    }

    #[test]
    fn plain_writer_passes_bytes_through() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut vdc = Vdc::new(1, 5);
        vdc.push_processor(
            "v1d",
            crate::proc::InitResult::Ok(Box::new(V1dWriter::new(buf.clone(), false))),
        );
        vdc.bytes(VdpAction::End, b"hello");
        vdc.close();
        assert_eq!(&*buf.lock(), b"hello");
    }
}
