//! HTTP message headers
//!
//! [`Http`] is the header table every task works on: client request, backend
//! request, backend response, client response. It is protocol-agnostic; the
//! HTTP/1 wire form lives in [`crate::proto`]. The packed encoding produced
//! by [`Http::encode`] is what gets persisted on a cache object and decoded
//! again at delivery time.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{VclError, VclResult};

/// Headers plus request/status line fields of one HTTP message.
#[derive(Debug, Clone, Default)]
pub struct Http {
    method: Option<String>,
    url: Option<String>,
    proto: Option<String>,
    status: Option<u16>,
    reason: Option<String>,
    hdrs: Vec<(String, String)>,
    max_hdr: usize,
}

/// Hop-by-hop headers never forwarded to the backend.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the proxy owns on a cacheable fetch: conditionals and ranges are
/// handled by the cache itself, not forwarded.
const FETCH_FILTERED: &[&str] = &[
    "if-modified-since",
    "if-none-match",
    "if-match",
    "if-unmodified-since",
    "range",
    "if-range",
];

impl Http {
    pub fn new(max_hdr: usize) -> Self {
        Self {
            max_hdr,
            ..Self::default()
        }
    }

    /// Reset to empty, keeping the slot limit.
    pub fn setup(&mut self) {
        let max = self.max_hdr;
        *self = Self::new(max);
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn proto(&self) -> Option<&str> {
        self.proto.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_method(&mut self, m: &str) {
        self.method = Some(m.to_owned());
    }

    pub fn set_url(&mut self, u: &str) {
        self.url = Some(u.to_owned());
    }

    pub fn set_proto(&mut self, p: &str) {
        self.proto = Some(p.to_owned());
    }

    /// `1.1` for `HTTP/1.1`, `2.0` for `HTTP/2.0`, 0 when unparsable.
    pub fn protover(&self) -> u32 {
        match self.proto.as_deref() {
            Some("HTTP/1.1") => 11,
            Some("HTTP/1.0") => 10,
            Some("HTTP/2.0") => 20,
            _ => 0,
        }
    }

    /// Set the status line of a response, with the default reason phrase if
    /// none is given.
    pub fn put_response(&mut self, proto: &str, status: u16, reason: Option<&str>) {
        self.proto = Some(proto.to_owned());
        self.status = Some(status);
        self.reason = Some(reason.unwrap_or_else(|| default_reason(status)).to_owned());
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Value of the first header called `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.hdrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, name: &str) -> usize {
        self.hdrs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    /// Append a header line. Fails when the slot limit is reached.
    pub fn set_header(&mut self, name: &str, value: &str) -> VclResult<()> {
        if self.hdrs.len() >= self.max_hdr {
            return Err(VclError::Msg("no more header slot".into()));
        }
        self.hdrs.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    /// Remove every `name` header, then set it to `value`.
    pub fn force_header(&mut self, name: &str, value: &str) {
        self.unset_header(name);
        // a slot was just freed, this cannot fail
        self.hdrs.push((name.to_owned(), value.to_owned()));
    }

    /// Append `value` to an existing `name` header (comma separated), or set
    /// it.
    pub fn append_header(&mut self, name: &str, value: &str) -> VclResult<()> {
        match self
            .hdrs
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => {
                v.push_str(", ");
                v.push_str(value);
                Ok(())
            }
            None => self.set_header(name, value),
        }
    }

    pub fn unset_header(&mut self, name: &str) {
        self.hdrs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Fold multiple `name` headers into a single comma separated one, in
    /// place, keeping the position of the first.
    pub fn collect_header(&mut self, name: &str) {
        let mut folded: Option<String> = None;
        let mut first = None;
        let mut i = 0;
        while i < self.hdrs.len() {
            if self.hdrs[i].0.eq_ignore_ascii_case(name) {
                match &mut folded {
                    None => {
                        folded = Some(self.hdrs[i].1.clone());
                        first = Some(i);
                        i += 1;
                    }
                    Some(s) => {
                        s.push_str(", ");
                        s.push_str(&self.hdrs[i].1);
                        self.hdrs.remove(i);
                    }
                }
            } else {
                i += 1;
            }
        }
        if let (Some(i), Some(v)) = (first, folded) {
            self.hdrs[i].1 = v;
        }
    }

    /// Does header `name` contain `token` in its comma separated value?
    pub fn has_field(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Parsed `Content-Length`, `-1` when absent, error when junk.
    pub fn content_length(&self) -> VclResult<i64> {
        match self.header("content-length") {
            None => Ok(-1),
            Some(v) => v
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|l| *l >= 0)
                .ok_or_else(|| VclError::Proto("bogus Content-Length".into())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.hdrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Copy `src` into a backend request head, dropping hop-by-hop headers,
    /// headers named in `Connection`, and (unless this is a pass) the
    /// conditional/range headers the cache handles itself.
    pub fn filter_req(&mut self, src: &Http, pass: bool) {
        self.setup();
        self.method = src.method.clone();
        self.url = src.url.clone();
        self.proto = src.proto.clone();
        let conn_named: Vec<String> = src
            .header("connection")
            .map(|v| {
                v.split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        for (n, v) in src.iter() {
            let ln = n.to_ascii_lowercase();
            if HOP_BY_HOP.contains(&ln.as_str()) || conn_named.contains(&ln) {
                continue;
            }
            if !pass && FETCH_FILTERED.contains(&ln.as_str()) {
                continue;
            }
            let _ = self.set_header(n, v);
        }
    }

    /// Estimated size of [`Http::encode`] output.
    pub fn estimate(&self) -> usize {
        let mut l = 8;
        for (n, v) in self.iter() {
            l += 4 + n.len() + v.len();
        }
        l += self.proto.as_deref().map_or(0, str::len)
            + self.reason.as_deref().map_or(0, str::len)
            + 4;
        l
    }

    /// Pack status line and headers into the stored-object form.
    pub fn encode(&self) -> Bytes {
        fn put_str(b: &mut BytesMut, s: Option<&str>) {
            let s = s.unwrap_or("");
            b.put_u16(s.len() as u16);
            b.put_slice(s.as_bytes());
        }
        let mut b = BytesMut::with_capacity(self.estimate());
        b.put_u16(self.status.unwrap_or(0));
        put_str(&mut b, self.proto.as_deref());
        put_str(&mut b, self.reason.as_deref());
        b.put_u16(self.hdrs.len() as u16);
        for (n, v) in self.iter() {
            put_str(&mut b, Some(n));
            put_str(&mut b, Some(v));
        }
        b.freeze()
    }

    /// Inverse of [`Http::encode`].
    pub fn decode(&mut self, mut buf: &[u8], max_hdr: usize) -> VclResult<()> {
        fn get_u16(buf: &mut &[u8]) -> VclResult<u16> {
            if buf.len() < 2 {
                return Err(VclError::Proto("truncated header pack".into()));
            }
            let v = u16::from_be_bytes([buf[0], buf[1]]);
            *buf = &buf[2..];
            Ok(v)
        }
        fn get_str(buf: &mut &[u8]) -> VclResult<String> {
            let l = get_u16(buf)? as usize;
            if buf.len() < l {
                return Err(VclError::Proto("truncated header pack".into()));
            }
            let s = std::str::from_utf8(&buf[..l])
                .map_err(|_| VclError::Proto("stored header not utf-8".into()))?
                .to_owned();
            *buf = &buf[l..];
            Ok(s)
        }

        *self = Self::new(max_hdr);
        let status = get_u16(&mut buf)?;
        self.status = (status != 0).then_some(status);
        let proto = get_str(&mut buf)?;
        self.proto = (!proto.is_empty()).then_some(proto);
        let reason = get_str(&mut buf)?;
        self.reason = (!reason.is_empty()).then_some(reason);
        let n = get_u16(&mut buf)? as usize;
        for _ in 0..n {
            let name = get_str(&mut buf)?;
            let value = get_str(&mut buf)?;
            self.hdrs.push((name, value));
        }
        Ok(())
    }
}

/// The `Via` value this instance appends.
pub fn via_value() -> &'static str {
    concat!("1.1 varnish (Varnish-core/", env!("CARGO_PKG_VERSION"), ")")
}

/// Default reason phrase for a status code.
pub fn default_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        410 => "Gone",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Http {
        let mut h = Http::new(32);
        h.set_method("GET");
        h.set_url("/a");
        h.set_proto("HTTP/1.1");
        h.set_header("Host", "h").unwrap();
        h
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = req();
        assert_eq!(h.header("hOsT"), Some("h"));
        assert_eq!(h.header("nope"), None);
    }

    #[test]
    fn collect_folds_in_place() {
        let mut h = req();
        h.set_header("Cache-Control", "no-store").unwrap();
        h.set_header("X-Other", "1").unwrap();
        h.set_header("Cache-Control", "max-age=3").unwrap();
        h.collect_header("cache-control");
        assert_eq!(h.count("cache-control"), 1);
        assert_eq!(h.header("cache-control"), Some("no-store, max-age=3"));
    }

    #[test]
    fn connection_token_scan() {
        let mut h = req();
        h.set_header("Connection", "keep-alive, Close").unwrap();
        assert!(h.has_field("connection", "close"));
        assert!(!h.has_field("connection", "upgrade"));
    }

    #[test]
    fn filter_req_drops_hop_by_hop_and_conditionals() {
        let mut src = req();
        src.set_header("Connection", "x-private").unwrap();
        src.set_header("X-Private", "1").unwrap();
        src.set_header("Transfer-Encoding", "chunked").unwrap();
        src.set_header("If-None-Match", "\"e\"").unwrap();
        src.set_header("Accept", "*/*").unwrap();

        let mut bereq = Http::new(32);
        bereq.filter_req(&src, false);
        assert_eq!(bereq.header("accept"), Some("*/*"));
        assert_eq!(bereq.header("host"), Some("h"));
        assert!(bereq.header("x-private").is_none());
        assert!(bereq.header("transfer-encoding").is_none());
        assert!(bereq.header("if-none-match").is_none());

        let mut pass = Http::new(32);
        pass.filter_req(&src, true);
        assert_eq!(pass.header("if-none-match"), Some("\"e\""));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut h = Http::new(32);
        h.put_response("HTTP/1.1", 200, None);
        h.set_header("Content-Length", "5").unwrap();
        h.set_header("Vary", "Accept-Encoding").unwrap();
        let packed = h.encode();

        let mut out = Http::new(32);
        out.decode(&packed, 32).unwrap();
        assert_eq!(out.status(), Some(200));
        assert_eq!(out.reason(), Some("OK"));
        assert_eq!(out.header("vary"), Some("Accept-Encoding"));
        // the law is on bytes: re-encoding is stable
        assert_eq!(out.encode(), packed);
    }

    #[test]
    fn content_length_parsing() {
        let mut h = req();
        assert_eq!(h.content_length().unwrap(), -1);
        h.set_header("Content-Length", "42").unwrap();
        assert_eq!(h.content_length().unwrap(), 42);
        h.force_header("Content-Length", "nope");
        assert!(h.content_length().is_err());
    }
}
