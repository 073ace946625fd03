//! Minimal HTTP/1 wire grammar
//!
//! Only as much of RFC 7230 as the request core needs: head parsing with
//! strict framing checks, head serialization for the two directions, and
//! body-status classification. Chunked body decoding lives with the fetch
//! processors in [`crate::backend`].

use memchr::memmem;

use crate::error::{VclError, VclResult};
use crate::http::Http;

/// How a message body is framed, and on the client side how far the request
/// body has progressed through its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    /// No body at all
    None,
    /// `Content-Length` known
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Read until EOF (responses only)
    Eof,
    /// Spooled into a body objcore, reusable
    Cached,
    /// Consumed, gone
    Taken,
    /// Framing was broken
    Error,
}

impl BodyStatus {
    /// Are there bytes to be had?
    pub fn avail(self) -> bool {
        matches!(self, Self::Length(l) if l > 0)
            || matches!(self, Self::Chunked | Self::Eof | Self::Cached)
    }
}

/// Find the end of a message head, returning the offset just past the blank
/// line.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n").map(|i| i + 4)
}

fn parse_hdr_lines(h: &mut Http, lines: std::str::Lines) -> VclResult<()> {
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| VclError::Proto(format!("header without colon: {line:?}")))?;
        if name.is_empty() || name.contains(' ') || name.contains('\t') {
            return Err(VclError::Proto("bad header field name".into()));
        }
        h.set_header(name, value.trim())?;
    }
    Ok(())
}

/// Parse a request head. `buf` must be exactly the head (see [`head_len`]).
pub fn parse_req_head(h: &mut Http, buf: &[u8]) -> VclResult<()> {
    let text = std::str::from_utf8(buf).map_err(|_| VclError::Proto("head not ascii".into()))?;
    let mut lines = text.lines();
    let reqline = lines.next().ok_or_else(|| VclError::Proto("empty head".into()))?;
    let mut parts = reqline.split(' ').filter(|s| !s.is_empty());
    h.setup();
    h.set_method(parts.next().ok_or_else(|| VclError::Proto("no method".into()))?);
    h.set_url(parts.next().ok_or_else(|| VclError::Proto("no url".into()))?);
    h.set_proto(parts.next().ok_or_else(|| VclError::Proto("no protocol".into()))?);
    if parts.next().is_some() {
        return Err(VclError::Proto("junk after request line".into()));
    }
    parse_hdr_lines(h, lines)
}

/// Parse a response head.
pub fn parse_resp_head(h: &mut Http, buf: &[u8]) -> VclResult<()> {
    let text = std::str::from_utf8(buf).map_err(|_| VclError::Proto("head not ascii".into()))?;
    let mut lines = text.lines();
    let statusline = lines
        .next()
        .ok_or_else(|| VclError::Proto("empty head".into()))?;
    let mut parts = statusline.splitn(3, ' ');
    let proto = parts.next().unwrap_or("");
    if !proto.starts_with("HTTP/") {
        return Err(VclError::Proto("bad response protocol".into()));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| VclError::Proto("bad status".into()))?;
    let reason = parts.next().unwrap_or("").trim();
    h.setup();
    h.put_response(proto, status, (!reason.is_empty()).then_some(reason));
    parse_hdr_lines(h, lines)
}

/// Classify the request body. Ambiguous framing is an error the caller turns
/// into a 400.
pub fn req_body_status(h: &Http) -> BodyStatus {
    let chunked = h.has_field("transfer-encoding", "chunked");
    let te_other = h.header("transfer-encoding").is_some() && !chunked;
    if te_other {
        return BodyStatus::Error;
    }
    match (chunked, h.content_length()) {
        (true, Ok(-1)) => BodyStatus::Chunked,
        // Content-Length together with chunked is unambiguously illegal
        (true, _) => BodyStatus::Error,
        (false, Ok(-1)) => BodyStatus::None,
        (false, Ok(0)) => BodyStatus::None,
        (false, Ok(l)) => BodyStatus::Length(l as u64),
        (false, Err(_)) => BodyStatus::Error,
    }
}

/// Classify the response body per RFC 7230 section 3.3.3.
pub fn resp_body_status(h: &Http, req_method: Option<&str>, status: u16) -> BodyStatus {
    if req_method == Some("HEAD") || status < 200 || status == 204 || status == 304 {
        return BodyStatus::None;
    }
    if h.has_field("transfer-encoding", "chunked") {
        return BodyStatus::Chunked;
    }
    if h.header("transfer-encoding").is_some() {
        return BodyStatus::Error;
    }
    match h.content_length() {
        Ok(-1) => BodyStatus::Eof,
        Ok(0) => BodyStatus::None,
        Ok(l) => BodyStatus::Length(l as u64),
        Err(_) => BodyStatus::Error,
    }
}

/// Serialize a request head onto the wire.
pub fn write_req_head(h: &Http, out: &mut Vec<u8>) {
    out.extend_from_slice(h.method().unwrap_or("GET").as_bytes());
    out.push(b' ');
    out.extend_from_slice(h.url().unwrap_or("/").as_bytes());
    out.push(b' ');
    out.extend_from_slice(h.proto().unwrap_or("HTTP/1.1").as_bytes());
    out.extend_from_slice(b"\r\n");
    write_hdrs(h, out);
}

/// Serialize a response head onto the wire.
pub fn write_resp_head(h: &Http, out: &mut Vec<u8>) {
    out.extend_from_slice(h.proto().unwrap_or("HTTP/1.1").as_bytes());
    out.push(b' ');
    out.extend_from_slice(h.status().unwrap_or(200).to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(
        h.reason()
            .unwrap_or_else(|| crate::http::default_reason(h.status().unwrap_or(200)))
            .as_bytes(),
    );
    out.extend_from_slice(b"\r\n");
    write_hdrs(h, out);
}

fn write_hdrs(h: &Http, out: &mut Vec<u8>) {
    for (n, v) in h.iter() {
        out.extend_from_slice(n.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_req(buf: &[u8]) -> VclResult<Http> {
        let mut h = Http::new(32);
        let l = head_len(buf).expect("complete head");
        parse_req_head(&mut h, &buf[..l])?;
        Ok(h)
    }

    #[test]
    fn request_head() {
        let h = parse_req(b"GET /a HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(h.method(), Some("GET"));
        assert_eq!(h.url(), Some("/a"));
        assert_eq!(h.header("host"), Some("h"));
        assert_eq!(req_body_status(&h), BodyStatus::None);
    }

    #[test]
    fn response_head() {
        let mut h = Http::new(32);
        parse_resp_head(&mut h, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(h.status(), Some(200));
        assert_eq!(resp_body_status(&h, Some("GET"), 200), BodyStatus::Length(5));
        assert_eq!(resp_body_status(&h, Some("HEAD"), 200), BodyStatus::None);
        assert_eq!(resp_body_status(&h, Some("GET"), 304), BodyStatus::None);
    }

    #[test]
    fn ambiguous_framing_is_an_error() {
        let h =
            parse_req(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap();
        assert_eq!(req_body_status(&h), BodyStatus::Error);

        let h2 = parse_req(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(req_body_status(&h2), BodyStatus::Chunked);
    }

    #[test]
    fn head_serialization_round_trips() {
        let h = parse_req(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let mut out = Vec::new();
        write_req_head(&h, &mut out);
        assert_eq!(out, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    }

    #[test]
    fn bad_heads_are_rejected() {
        assert!(parse_req(b"GET /a\r\n\r\n").is_err());
        assert!(parse_req(b"GET /a HTTP/1.1 junk\r\n\r\n").is_err());
        assert!(parse_req(b"GET /a HTTP/1.1\r\nBad Header: x\r\n\r\n").is_err());
    }
}
