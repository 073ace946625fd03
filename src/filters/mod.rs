//! Concrete filters and the filter registry
//!
//! Filter chains are described by a space separated list of names, computed
//! from the object and response characteristics unless policy overrode it
//! (`beresp.filters` / `resp.filters`). The registry resolves names into
//! stacked processors; an unknown name fails the chain, which the caller
//! turns into its overload path.

pub mod esi;
pub mod gzip;
pub mod range;

use std::sync::Arc;

use crate::http::Http;
use crate::objcore::{obj_flags, ObjCore};
use crate::param::Params;
use crate::proc::deliver::Vdc;
use crate::proc::fetch::Vfc;
use crate::rfc2616;

/// Build inputs for the delivery chain.
pub struct VdpBuild<'a> {
    pub req_http: &'a Http,
    pub resp: &'a mut Http,
    pub resp_len: &'a mut i64,
    pub oc: &'a Arc<ObjCore>,
    pub params: &'a Params,
    /// Consumed by the esi filter when it stacks
    pub esi_include: Option<esi::IncludeFn>,
}

/// Compute the default delivery filter list for a response.
pub fn default_vdp_list(req_http: &Http, oc: &ObjCore, status: u16, p: &Params) -> String {
    let mut l: Vec<&str> = Vec::new();
    if p.http_gzip_support
        && oc.has_obj_flag(obj_flags::GZIPED)
        && !rfc2616::req_gzip(req_http)
    {
        l.push("gunzip");
    }
    if oc.has_obj_flag(obj_flags::ESIPROC) {
        l.push("esi");
    }
    if p.http_range_support && status == 200 && req_http.header("range").is_some() {
        l.push("range");
    }
    l.join(" ")
}

/// Stack `list` onto `vdc`. Returns the chain verdict (0 on success).
pub fn stack_vdp(vdc: &mut Vdc, list: &str, b: &mut VdpBuild<'_>) -> i32 {
    for name in list.split_whitespace() {
        let r = match name {
            "gunzip" => vdc.push_processor(
                "gunzip",
                gzip::GunzipVdp::init(b.req_http, b.resp, b.resp_len, b.oc, b.params.gzip_buffer),
            ),
            "esi" => match b.esi_include.take() {
                Some(inc) => {
                    let r = vdc.push_processor("esi", esi::EsiExpandVdp::init(b.oc, inc));
                    if r == 0 {
                        // expansion changes the length; the response is framed
                        // by the transport instead
                        *b.resp_len = -1;
                    }
                    r
                }
                None => vdc.push_processor(
                    "esi",
                    crate::proc::deliver::init_err("esi: no include context"),
                ),
            },
            "range" => vdc.push_processor(
                "range",
                range::RangeVdp::init(b.req_http, b.resp, b.resp_len, b.oc),
            ),
            _ => vdc.push_processor(
                "unknown",
                crate::proc::deliver::init_err(format!("filter not found: {name}")),
            ),
        };
        if r != 0 {
            return r;
        }
    }
    vdc.retval
}

/// Build inputs for the fetch chain.
pub struct VfpBuild<'a> {
    pub beresp: &'a mut Http,
    pub oc: &'a Arc<ObjCore>,
    pub params: &'a Params,
}

/// Compute the default fetch filter list from the busyobj toggles and the
/// backend response. ESI objects are stored plain, so a compressed upstream
/// body is decompressed before the scanner.
pub fn default_vfp_list(
    do_esi: bool,
    do_gzip: bool,
    do_gunzip: bool,
    beresp: &Http,
    p: &Params,
) -> String {
    let is_gzip = beresp.has_field("content-encoding", "gzip");
    let mut l: Vec<&str> = Vec::new();
    if do_esi {
        l.push("esi");
        if is_gzip {
            l.push("gunzip");
        }
    } else if do_gunzip && is_gzip {
        l.push("gunzip");
    } else if do_gzip && !is_gzip && p.http_gzip_support {
        l.push("gzip");
    } else if is_gzip && p.http_gzip_support {
        l.push("testgunzip");
    }
    l.join(" ")
}

/// Stack `list` onto `vfc`. Returns false when a filter failed to
/// initialize (the chain is latched failed).
pub fn stack_vfp(vfc: &mut Vfc, list: &str, b: &mut VfpBuild<'_>) -> bool {
    for name in list.split_whitespace() {
        let ok = match name {
            "esi" => vfc.push_processor("esi", esi::EsiScanVfp::init(b.oc)),
            "gunzip" => vfc.push_processor(
                "gunzip",
                gzip::GunzipVfp::init(b.beresp, b.oc, b.params.gzip_buffer),
            ),
            "gzip" => vfc.push_processor(
                "gzip",
                gzip::GzipVfp::init(b.beresp, b.oc, b.params.gzip_level, b.params.gzip_buffer),
            ),
            "testgunzip" => vfc.push_processor("testgunzip", gzip::TestGunzipVfp::init(b.beresp, b.oc)),
            _ => {
                vfc.error(&format!("filter not found: {name}"));
                false
            }
        };
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delivery_list_composition() {
        let p = Params::default();
        let oc = ObjCore::new_private();
        let mut req = Http::new(8);
        assert_eq!(default_vdp_list(&req, &oc, 200, &p), "");

        oc.set_obj_flag(obj_flags::GZIPED, true);
        req.set_header("Range", "bytes=0-1").unwrap();
        assert_eq!(default_vdp_list(&req, &oc, 200, &p), "gunzip range");

        // gzip-capable client keeps the compressed form
        req.set_header("Accept-Encoding", "gzip").unwrap();
        assert_eq!(default_vdp_list(&req, &oc, 200, &p), "range");

        // ranges only apply to plain 200s
        assert_eq!(default_vdp_list(&req, &oc, 503, &p), "");
    }

    #[test]
    fn default_fetch_list_composition() {
        let p = Params::default();
        let mut gzresp = Http::new(8);
        gzresp.set_header("Content-Encoding", "gzip").unwrap();
        let plain = Http::new(8);

        assert_eq!(default_vfp_list(false, false, false, &gzresp, &p), "testgunzip");
        assert_eq!(default_vfp_list(false, false, true, &gzresp, &p), "gunzip");
        assert_eq!(default_vfp_list(false, true, false, &plain, &p), "gzip");
        assert_eq!(default_vfp_list(true, false, false, &gzresp, &p), "esi gunzip");
        assert_eq!(default_vfp_list(true, false, false, &plain, &p), "esi");
        assert_eq!(default_vfp_list(false, false, false, &plain, &p), "");
    }

    #[test]
    fn unknown_filter_latches_the_chain() {
        let p = Params::default();
        let oc = ObjCore::new_private();
        let mut resp = Http::new(8);
        let req = Http::new(8);
        let mut len = -1i64;
        let mut vdc = Vdc::new(1, -1);
        let mut b = VdpBuild {
            req_http: &req,
            resp: &mut resp,
            resp_len: &mut len,
            oc: &oc,
            params: &p,
            esi_include: None,
        };
        assert!(stack_vdp(&mut vdc, "frobnicate", &mut b) < 0);
    }
}
