//! Edge-side-include filters
//!
//! The fetch-side scanner strips `<esi:include src="..."/>` tags and
//! `<!--esi ... -->` wrappers out of the stored body while recording an ESI
//! program: the byte offsets (in the stored body) where included content
//! must be spliced in. The program is persisted as the object's ESI data
//! attribute.
//!
//! The delivery-side expander replays the stored body, pausing at each
//! include point to hand the include source to a callback that delivers the
//! included object through the rest of the chain at `esi_level + 1`.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use memchr::{memchr, memchr2};

use crate::error::{VclError, VclResult};
use crate::objcore::{obj_flags, ObjCore};
use crate::proc::deliver::{DeliverCtx, DeliveryProcessor, PushResult, VdpAction};
use crate::proc::fetch::{FetchCtx, FetchProcessor, PullResult};
use crate::proc::InitResult;

/// One include point: at stored-body offset `off`, fetch and splice `src`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsiInclude {
    pub off: u64,
    pub src: String,
}

/// The stored ESI program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsiProgram {
    pub includes: Vec<EsiInclude>,
}

impl EsiProgram {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u32(self.includes.len() as u32);
        for inc in &self.includes {
            b.put_u64(inc.off);
            b.put_u16(inc.src.len() as u16);
            b.put_slice(inc.src.as_bytes());
        }
        b.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> VclResult<Self> {
        let err = || VclError::Msg("truncated esi program".into());
        if buf.len() < 4 {
            return Err(err());
        }
        let n = u32::from_be_bytes(buf[..4].try_into().unwrap());
        buf = &buf[4..];
        let mut includes = Vec::with_capacity(n as usize);
        for _ in 0..n {
            if buf.len() < 10 {
                return Err(err());
            }
            let off = u64::from_be_bytes(buf[..8].try_into().unwrap());
            let sl = u16::from_be_bytes(buf[8..10].try_into().unwrap()) as usize;
            buf = &buf[10..];
            if buf.len() < sl {
                return Err(err());
            }
            let src = std::str::from_utf8(&buf[..sl])
                .map_err(|_| err())?
                .to_owned();
            buf = &buf[sl..];
            includes.push(EsiInclude { off, src });
        }
        Ok(Self { includes })
    }
}

/// Incremental scanner over the body byte stream.
#[derive(Default)]
struct Scanner {
    program: EsiProgram,
    /// Bytes emitted to storage so far
    out_off: u64,
    /// Partial tag carried between pulls
    pending: Vec<u8>,
    /// Inside a `<!--esi ... -->` wrapper
    in_comment: bool,
}

const TAG_OPEN: &[u8] = b"<esi:include";
const COMMENT_OPEN: &[u8] = b"<!--esi";
const COMMENT_CLOSE: &[u8] = b"-->";

impl Scanner {
    /// Scan `input`, appending the literal output to `out`.
    fn scan(&mut self, input: &[u8], out: &mut Vec<u8>) -> VclResult<()> {
        self.pending.extend_from_slice(input);
        loop {
            let data = std::mem::take(&mut self.pending);
            let pos = if self.in_comment {
                memchr2(b'<', b'-', &data)
            } else {
                memchr(b'<', &data)
            };
            let Some(i) = pos else {
                self.emit(&data, out);
                return Ok(());
            };
            self.emit(&data[..i], out);
            let tail = &data[i..];

            if tail[0] == b'-' {
                // only reachable inside a comment wrapper
                if tail.len() < COMMENT_CLOSE.len() && COMMENT_CLOSE.starts_with(tail) {
                    self.pending = tail.to_vec();
                    return Ok(());
                }
                if tail.starts_with(COMMENT_CLOSE) {
                    self.in_comment = false;
                    self.pending = tail[COMMENT_CLOSE.len()..].to_vec();
                } else {
                    self.emit(&tail[..1], out);
                    self.pending = tail[1..].to_vec();
                }
                continue;
            }

            // not enough bytes to recognize the tag yet
            if tail.len() < TAG_OPEN.len().max(COMMENT_OPEN.len()) && is_prefix_of_any(tail) {
                self.pending = tail.to_vec();
                return Ok(());
            }
            if tail.starts_with(TAG_OPEN) {
                let Some(gt) = memchr(b'>', tail) else {
                    self.pending = tail.to_vec();
                    return Ok(());
                };
                let tag = &tail[..=gt];
                let src = parse_src(tag)
                    .ok_or_else(|| VclError::Msg("esi:include without src".into()))?;
                self.program.includes.push(EsiInclude {
                    off: self.out_off,
                    src,
                });
                self.pending = tail[gt + 1..].to_vec();
                continue;
            }
            if tail.starts_with(COMMENT_OPEN) {
                // the wrapped content is kept, the markers vanish
                self.in_comment = true;
                self.pending = tail[COMMENT_OPEN.len()..].to_vec();
                continue;
            }
            // a plain '<'
            self.emit(&tail[..1], out);
            self.pending = tail[1..].to_vec();
        }
    }

    fn emit(&mut self, bytes: &[u8], out: &mut Vec<u8>) {
        self.out_off += bytes.len() as u64;
        out.extend_from_slice(bytes);
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        let data = std::mem::take(&mut self.pending);
        self.emit(&data, out);
    }
}

fn is_prefix_of_any(tail: &[u8]) -> bool {
    TAG_OPEN.starts_with(tail) || COMMENT_OPEN.starts_with(tail)
}

fn parse_src(tag: &[u8]) -> Option<String> {
    let tag = std::str::from_utf8(tag).ok()?;
    let at = tag.find("src=")? + 4;
    let rest = &tag[at..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_owned())
}

/// Fetch-side scanner.
pub struct EsiScanVfp {
    scanner: Scanner,
    oc: Arc<ObjCore>,
    /// Literal bytes scanned but not yet handed to the puller
    ready: Vec<u8>,
    upstream_done: bool,
}

impl EsiScanVfp {
    pub fn init(oc: &Arc<ObjCore>) -> InitResult<Box<dyn FetchProcessor>> {
        InitResult::Ok(Box::new(Self {
            scanner: Scanner::default(),
            oc: oc.clone(),
            ready: Vec::new(),
            upstream_done: false,
        }))
    }
}

impl FetchProcessor for EsiScanVfp {
    fn pull(&mut self, ctx: &mut FetchCtx<'_>, buf: &mut [u8]) -> PullResult {
        loop {
            if !self.ready.is_empty() || (self.upstream_done && self.ready.is_empty()) {
                let l = self.ready.len().min(buf.len());
                buf[..l].copy_from_slice(&self.ready[..l]);
                self.ready.drain(..l);
                if self.upstream_done && self.ready.is_empty() {
                    let program = std::mem::take(&mut self.scanner.program);
                    self.oc
                        .with_attrs_mut(|a| a.esidata = Some(program.encode()));
                    self.oc.set_obj_flag(obj_flags::ESIPROC, true);
                    return PullResult::End(l);
                }
                if l > 0 {
                    return PullResult::Ok(l);
                }
            }
            let mut scratch = vec![0u8; buf.len().max(512)];
            let r = ctx.pull(&mut scratch);
            let n = match r {
                PullResult::Err => return PullResult::Err,
                PullResult::Ok(n) => n,
                PullResult::End(n) => {
                    self.upstream_done = true;
                    n
                }
            };
            if let Err(e) = self.scanner.scan(&scratch[..n], &mut self.ready) {
                ctx.error(&format!("esi: {e}"));
                return PullResult::Err;
            }
            if self.upstream_done {
                self.scanner.finish(&mut self.ready);
            }
        }
    }
}

/// Callback delivering one included object through the downstream chain.
/// Returns `Err` on failure; the expander latches it.
pub type IncludeFn = Box<dyn FnMut(&str, &mut DeliverCtx<'_>) -> Result<(), VclError> + Send>;

/// Delivery-side expander.
pub struct EsiExpandVdp {
    program: EsiProgram,
    next: usize,
    off: u64,
    include: IncludeFn,
}

impl EsiExpandVdp {
    pub fn init(oc: &Arc<ObjCore>, include: IncludeFn) -> InitResult<Box<dyn DeliveryProcessor>> {
        if !oc.has_obj_flag(obj_flags::ESIPROC) {
            return InitResult::Pass;
        }
        let Some(data) = oc.with_attrs(|a| a.esidata.clone()) else {
            return InitResult::Pass;
        };
        match EsiProgram::decode(&data) {
            Ok(program) => InitResult::Ok(Box::new(Self {
                program,
                next: 0,
                off: 0,
                include,
            })),
            Err(e) => InitResult::Err(e),
        }
    }
}

impl DeliveryProcessor for EsiExpandVdp {
    fn push(&mut self, ctx: &mut DeliverCtx<'_>, act: VdpAction, buf: &[u8]) -> PushResult {
        let mut p = buf;
        while !p.is_empty() {
            // splice any include scheduled at the current offset
            while self
                .program
                .includes
                .get(self.next)
                .is_some_and(|i| i.off == self.off)
            {
                let src = self.program.includes[self.next].src.clone();
                self.next += 1;
                if (self.include)(&src, ctx).is_err() {
                    return PushResult::Err;
                }
            }
            let until = self
                .program
                .includes
                .get(self.next)
                .map_or(u64::MAX, |i| i.off);
            let l = ((until - self.off) as usize).min(p.len());
            self.off += l as u64;
            let r = ctx.push(VdpAction::Flush, &p[..l]);
            if !matches!(r, PushResult::Ok) {
                return r;
            }
            p = &p[l..];
        }
        if act == VdpAction::End {
            // trailing includes sit exactly at the end offset
            while self
                .program
                .includes
                .get(self.next)
                .is_some_and(|i| i.off == self.off)
            {
                let src = self.program.includes[self.next].src.clone();
                self.next += 1;
                if (self.include)(&src, ctx).is_err() {
                    return PushResult::Err;
                }
            }
            return ctx.push(VdpAction::End, &[]);
        }
        if act == VdpAction::Flush && buf.is_empty() {
            return ctx.push(VdpAction::Flush, &[]);
        }
        PushResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::deliver::{CollectSink, Vdc};

    fn scan_all(input: &[u8]) -> (Vec<u8>, EsiProgram) {
        let mut sc = Scanner::default();
        let mut out = Vec::new();
        // feed byte by byte to stress resumption across boundaries
        for b in input {
            sc.scan(std::slice::from_ref(b), &mut out).unwrap();
        }
        sc.finish(&mut out);
        (out, std::mem::take(&mut sc.program))
    }

    #[test]
    fn scanner_strips_includes_and_records_offsets() {
        let (out, prog) = scan_all(b"AA<esi:include src=\"/frag\"/>BB");
        assert_eq!(out, b"AABB");
        assert_eq!(
            prog.includes,
            vec![EsiInclude {
                off: 2,
                src: "/frag".into()
            }]
        );
    }

    #[test]
    fn scanner_unwraps_esi_comments_and_keeps_plain_lt() {
        let (out, prog) = scan_all(b"1 < 2 <!--esi <b>x</b> --> done");
        assert_eq!(out, b"1 < 2  <b>x</b>  done");
        assert!(prog.includes.is_empty());
    }

    #[test]
    fn program_round_trips() {
        let prog = EsiProgram {
            includes: vec![
                EsiInclude { off: 0, src: "/a".into() },
                EsiInclude { off: 7, src: "/b?q=1".into() },
            ],
        };
        assert_eq!(EsiProgram::decode(&prog.encode()).unwrap(), prog);
    }

    #[test]
    fn expander_splices_includes() {
        let oc = ObjCore::new_private();
        oc.set_obj_flag(obj_flags::ESIPROC, true);
        let prog = EsiProgram {
            includes: vec![
                EsiInclude { off: 2, src: "/x".into() },
                EsiInclude { off: 4, src: "/y".into() },
            ],
        };
        oc.with_attrs_mut(|a| a.esidata = Some(prog.encode()));

        let include: IncludeFn = Box::new(|src, ctx| {
            let body = format!("[{src}]");
            match ctx.push(VdpAction::Flush, body.as_bytes()) {
                PushResult::Err => Err("include failed".into()),
                _ => Ok(()),
            }
        });

        let mut vdc = Vdc::new(1, -1);
        vdc.push_processor("esi", EsiExpandVdp::init(&oc, include));
        let (out, sink) = CollectSink::build();
        vdc.push_processor("sink", sink);

        vdc.bytes(VdpAction::Flush, b"AB");
        vdc.bytes(VdpAction::End, b"CD");
        vdc.close();
        assert_eq!(&*out.lock(), b"AB[/x]CD[/y]");
    }
}
