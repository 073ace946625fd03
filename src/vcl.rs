//! Policy hooks
//!
//! Policy compilation is out of scope; the FSMs call into a [`Vcl`] trait
//! with one method per subroutine, each returning the [`Handling`] the state
//! machine dispatches on. [`BuiltinVcl`] reproduces the built-in policy:
//! what every bundle falls through to when it does not take over.

use sha2::Sha256;

use crate::fetch::BusyObj;
use crate::req::Req;

/// Policy verdicts. Which subset is legal depends on the subroutine; the
/// FSMs treat an out-of-place verdict as a policy failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Abandon,
    Deliver,
    Error,
    Fail,
    Fetch,
    Hash,
    Lookup,
    Pass,
    Pipe,
    Purge,
    Restart,
    Retry,
    Synth,
    /// Switch the active policy bundle (only from recv, before any restart)
    Vcl,
}

/// The user-facing policy bundle, as an opaque set of hooks.
pub trait Vcl: Send + Sync {
    fn name(&self) -> &str {
        "builtin"
    }

    fn recv(&self, req: &mut Req) -> Handling {
        builtin_recv(req)
    }

    /// Feed the hash context with the key material. The surrounding code
    /// owns init/finalize.
    fn hash(&self, req: &Req, sha: &mut Sha256) -> Handling {
        builtin_hash(req, sha)
    }

    fn hit(&self, _req: &mut Req) -> Handling {
        Handling::Deliver
    }

    fn miss(&self, _req: &mut Req) -> Handling {
        Handling::Fetch
    }

    fn pass(&self, _req: &mut Req) -> Handling {
        Handling::Fetch
    }

    fn pipe(&self, _req: &mut Req, _bo: &mut BusyObj) -> Handling {
        Handling::Pipe
    }

    fn purge(&self, req: &mut Req) -> Handling {
        req.err_code = 200;
        req.err_reason = Some("Purged".into());
        Handling::Synth
    }

    fn deliver(&self, _req: &mut Req) -> Handling {
        Handling::Deliver
    }

    fn synth(&self, req: &mut Req, body: &mut Vec<u8>) -> Handling {
        builtin_synth_body(req, body);
        Handling::Deliver
    }

    fn backend_fetch(&self, _bo: &mut BusyObj) -> Handling {
        Handling::Fetch
    }

    fn backend_response(&self, bo: &mut BusyObj) -> Handling {
        builtin_backend_response(bo)
    }

    fn backend_error(&self, bo: &mut BusyObj, body: &mut Vec<u8>) -> Handling {
        builtin_backend_error_body(bo, body);
        Handling::Deliver
    }
}

/// The built-in policy, verbatim.
pub struct BuiltinVcl;

impl Vcl for BuiltinVcl {}

pub fn builtin_recv(req: &mut Req) -> Handling {
    let method = req.http.method().unwrap_or("");
    match method {
        "GET" | "HEAD" | "PUT" | "POST" | "TRACE" | "OPTIONS" | "DELETE" | "PATCH" => {}
        // unknown methods are piped through
        _ => return Handling::Pipe,
    }
    if method != "GET" && method != "HEAD" {
        return Handling::Pass;
    }
    if req.http.header("authorization").is_some() || req.http.header("cookie").is_some() {
        return Handling::Pass;
    }
    Handling::Hash
}

pub fn builtin_hash(req: &Req, sha: &mut Sha256) -> Handling {
    use sha2::Digest;
    sha.update(req.http.url().unwrap_or("/").as_bytes());
    sha.update([0u8]);
    sha.update(req.http.header("host").unwrap_or("").as_bytes());
    sha.update([0u8]);
    Handling::Lookup
}

pub fn builtin_backend_response(bo: &mut BusyObj) -> Handling {
    let mut exp = bo.fetch_oc.exp();
    let hfm = exp.ttl <= 0.0
        || bo.beresp.header("set-cookie").is_some()
        || bo.beresp.has_field("cache-control", "no-store")
        || bo
            .beresp
            .header("vary")
            .is_some_and(|v| v.trim() == "*");
    if hfm {
        // cache the decision not to cache
        exp.ttl = 120.0;
        exp.grace = 0.0;
        exp.keep = 0.0;
        bo.fetch_oc.set_exp(exp);
        bo.uncacheable = true;
    }
    Handling::Deliver
}

pub fn builtin_synth_body(req: &Req, body: &mut Vec<u8>) {
    let status = req.resp.status().unwrap_or(503);
    let reason = req
        .resp
        .reason()
        .unwrap_or_else(|| crate::http::default_reason(status));
    body.extend_from_slice(
        format!(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <title>{status} {reason}</title>\n  </head>\n  <body>\n    <h1>Error {status} {reason}</h1>\n    <p>{reason}</p>\n    <h3>Guru Meditation:</h3>\n    <p>XID: {}</p>\n    <hr>\n    <p>Varnish cache server</p>\n  </body>\n</html>\n",
            req.xid
        )
        .as_bytes(),
    );
}

pub fn builtin_backend_error_body(bo: &BusyObj, body: &mut Vec<u8>) {
    let status = bo.beresp.status().unwrap_or(503);
    let reason = bo
        .beresp
        .reason()
        .unwrap_or_else(|| crate::http::default_reason(status));
    body.extend_from_slice(
        format!(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <title>{status} {reason}</title>\n  </head>\n  <body>\n    <h1>Error {status} {reason}</h1>\n    <p>{reason}</p>\n    <h3>Guru Meditation:</h3>\n    <p>XID: {}</p>\n    <hr>\n    <p>Varnish cache server</p>\n  </body>\n</html>\n",
            bo.xid
        )
        .as_bytes(),
    );
}
