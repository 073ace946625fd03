//! Range delivery filter
//!
//! Parses `Range: bytes=lo-hi`, rewrites the response to 206 with a
//! `Content-Range`, then trims the byte stream to the requested window,
//! asking for early termination once the high bound is reached. A range the
//! object cannot satisfy turns the response into a 416 with an empty body.

use crate::http::Http;
use crate::objcore::ObjCore;
use crate::proc::deliver::{DeliverCtx, DeliveryProcessor, PushResult, Vdc, VdpAction};
use crate::proc::InitResult;
use crate::session::StreamClose;
use crate::tim;

pub struct RangeVdp {
    low: u64,
    high: u64, // inclusive
    off: u64,
}

/// `(low, high)` from `bytes=..`, or `None` when the spec is unsatisfiable
/// or malformed. `len < 0` means the total length is unknown.
fn parse_range(spec: &str, len: i64) -> Option<(u64, u64)> {
    let spec = spec.trim();
    let rest = spec.strip_prefix("bytes=")?;
    // multiple ranges are legal but we only serve a single one
    if rest.contains(',') {
        return None;
    }
    let (lo_s, hi_s) = rest.split_once('-')?;
    let lo_s = lo_s.trim();
    let hi_s = hi_s.trim();
    if lo_s.is_empty() {
        // suffix range: last N bytes
        let n: u64 = hi_s.parse().ok()?;
        if len < 0 || n == 0 {
            return None;
        }
        let len = len as u64;
        let lo = len.saturating_sub(n);
        return Some((lo, len - 1));
    }
    let lo: u64 = lo_s.parse().ok()?;
    let hi: u64 = if hi_s.is_empty() {
        if len < 0 {
            return None;
        }
        (len as u64).checked_sub(1)?
    } else {
        hi_s.parse().ok()?
    };
    if hi < lo {
        return None;
    }
    if len >= 0 {
        let len = len as u64;
        if lo >= len {
            return None;
        }
        return Some((lo, hi.min(len - 1)));
    }
    Some((lo, hi))
}

/// rfc7233,l,455,456: an `If-Range` that does not match disables the range.
fn if_range_matches(req: &Http, resp: &Http, oc: &ObjCore) -> bool {
    let Some(ir) = req.header("if-range") else {
        return true;
    };
    if ir.starts_with('"') || ir.starts_with("W/") {
        return resp.header("etag") == Some(ir);
    }
    match (tim::parse_http_date(ir), oc.with_attrs(|a| a.lastmodified)) {
        (Some(t), Some(lm)) => t == lm,
        _ => false,
    }
}

impl RangeVdp {
    /// Decide whether to stack the filter, rewriting `resp` and `resp_len`
    /// on the way.
    pub fn init(
        req_http: &Http,
        resp: &mut Http,
        resp_len: &mut i64,
        oc: &ObjCore,
    ) -> InitResult<Box<dyn DeliveryProcessor>> {
        let Some(spec) = req_http.header("range") else {
            return InitResult::Pass;
        };
        if !if_range_matches(req_http, resp, oc) {
            return InitResult::Pass;
        }
        match parse_range(spec, *resp_len) {
            Some((low, high)) => {
                let total = if *resp_len >= 0 {
                    (*resp_len).to_string()
                } else {
                    "*".to_owned()
                };
                resp.put_response("HTTP/1.1", 206, None);
                let _ = resp.set_header("Content-Range", &format!("bytes {low}-{high}/{total}"));
                *resp_len = (high - low + 1) as i64;
                InitResult::Ok(Box::new(Self { low, high, off: 0 }))
            }
            None => {
                log::debug!("RANGE_FAIL {spec:?}");
                if *resp_len >= 0 {
                    let _ = resp.set_header("Content-Range", &format!("bytes */{}", *resp_len));
                }
                resp.put_response("HTTP/1.1", 416, None);
                *resp_len = 0;
                InitResult::Pass
            }
        }
    }
}

impl DeliveryProcessor for RangeVdp {
    fn push(&mut self, ctx: &mut DeliverCtx<'_>, mut act: VdpAction, buf: &[u8]) -> PushResult {
        let mut p = buf;
        // skip bytes before the window
        if self.off < self.low {
            let skip = ((self.low - self.off) as usize).min(p.len());
            self.off += skip as u64;
            p = &p[skip..];
        }
        // clip to the window
        let keep = ((self.high + 1).saturating_sub(self.off) as usize).min(p.len());
        self.off += p.len() as u64;
        if self.off > self.high {
            act = VdpAction::End;
        }
        let r = if keep > 0 {
            ctx.push(act, &p[..keep])
        } else if act != VdpAction::Null {
            ctx.push(act, &[])
        } else {
            PushResult::Ok
        };
        if matches!(r, PushResult::Err) || act == VdpAction::End {
            PushResult::End
        } else {
            r
        }
    }

    fn fini(&mut self, vdc: &mut Vdc) {
        if self.off <= self.high && vdc.retval >= 0 {
            // ran out of object before the window was served
            vdc.retval = -1;
            vdc.doclose.get_or_insert(StreamClose::RangeShort);
        }
    }
}

/// `Accept-Ranges: bytes` is advertised on plain 200 responses when range
/// support is on.
pub fn announce(resp: &mut Http) {
    resp.force_header("Accept-Ranges", "bytes");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::deliver::CollectSink;

    fn run_range(spec: &str, len: i64, body: &[u8]) -> (Http, i64, Vec<u8>, i32) {
        let mut req = Http::new(8);
        req.set_header("Range", spec).unwrap();
        let mut resp = Http::new(8);
        resp.put_response("HTTP/1.1", 200, None);
        let mut resp_len = len;
        let oc = ObjCore::new_private();

        let mut vdc = Vdc::new(1, len);
        let init = RangeVdp::init(&req, &mut resp, &mut resp_len, &oc);
        vdc.push_processor("range", init);
        let (out, sink) = CollectSink::build();
        vdc.push_processor("sink", sink);

        // feed in two buffers to exercise offset tracking
        let mid = body.len() / 2;
        vdc.bytes(VdpAction::Flush, &body[..mid]);
        vdc.bytes(VdpAction::End, &body[mid..]);
        vdc.close();
        let ret = vdc.retval;
        let collected = out.lock().clone();
        (resp, resp_len, collected, ret)
    }

    #[test]
    fn middle_range() {
        let (resp, len, body, _) = run_range("bytes=1-3", 5, b"hello");
        assert_eq!(resp.status(), Some(206));
        assert_eq!(resp.header("content-range"), Some("bytes 1-3/5"));
        assert_eq!(len, 3);
        assert_eq!(body, b"ell");
    }

    #[test]
    fn single_byte_at_zero() {
        let (_, len, body, _) = run_range("bytes=0-0", 5, b"hello");
        assert_eq!(len, 1);
        assert_eq!(body, b"h");
    }

    #[test]
    fn open_ended_and_suffix() {
        let (_, _, body, _) = run_range("bytes=2-", 5, b"hello");
        assert_eq!(body, b"llo");
        let (_, _, body, _) = run_range("bytes=-2", 5, b"hello");
        assert_eq!(body, b"lo");
    }

    #[test]
    fn high_bound_clipped_to_length() {
        let (resp, len, body, _) = run_range("bytes=3-99", 5, b"hello");
        assert_eq!(resp.header("content-range"), Some("bytes 3-4/5"));
        assert_eq!(len, 2);
        assert_eq!(body, b"lo");
    }

    #[test]
    fn unsatisfiable_is_416_with_empty_body() {
        let (resp, len, body, _) = run_range("bytes=9-10", 5, b"hello");
        assert_eq!(resp.status(), Some(416));
        assert_eq!(resp.header("content-range"), Some("bytes */5"));
        assert_eq!(len, 0);
        // filter declined, identity chain still ran
        assert_eq!(body, b"hello");
    }

    #[test]
    fn inverted_bounds_are_unsatisfiable() {
        let (resp, _, _, _) = run_range("bytes=4-2", 5, b"hello");
        assert_eq!(resp.status(), Some(416));
    }

    #[test]
    fn short_object_fails_with_range_short() {
        // claim 10 bytes, deliver 5: window 6-9 never arrives
        let (_, _, _, ret) = run_range("bytes=6-9", 10, b"hello");
        assert_eq!(ret, -1);
    }

    #[test]
    fn no_range_header_declines() {
        let req = Http::new(8);
        let mut resp = Http::new(8);
        resp.put_response("HTTP/1.1", 200, None);
        let mut l = 5i64;
        let oc = ObjCore::new_private();
        assert!(matches!(
            RangeVdp::init(&req, &mut resp, &mut l, &oc),
            InitResult::Pass
        ));
    }
}
