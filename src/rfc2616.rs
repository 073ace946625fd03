//! Freshness, validators and content negotiation
//!
//! The pieces of RFC 7231/7232/7234 the core needs, abstracted from any
//! parser: TTL computation from response headers, strong validator checks
//! for conditional refreshes, gzip negotiation, and conditional responses on
//! hits.

use crate::http::Http;
use crate::param::Params;
use crate::tim;

/// Expiry knobs of one object.
#[derive(Debug, Clone, Copy)]
pub struct Expiry {
    pub t_origin: f64,
    pub ttl: f64,
    pub grace: f64,
    pub keep: f64,
}

impl Expiry {
    pub fn new() -> Self {
        Self {
            t_origin: tim::real(),
            ttl: 0.0,
            grace: 0.0,
            keep: 0.0,
        }
    }
}

fn cc_duration(cc: &str, directive: &str) -> Option<f64> {
    for part in cc.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix(directive) {
            if let Some(v) = v.strip_prefix('=') {
                let v = v.trim_matches('"');
                if let Ok(secs) = v.parse::<u64>() {
                    return Some(secs as f64);
                }
            }
        }
    }
    None
}

fn cc_has(cc: &str, directive: &str) -> bool {
    cc.split(',').any(|p| {
        let p = p.trim();
        p.eq_ignore_ascii_case(directive)
            || p.to_ascii_lowercase()
                .starts_with(&format!("{directive}="))
    })
}

/// Statuses that may be cached with a default TTL absent explicit freshness
/// information.
fn status_cacheable(status: u16) -> bool {
    matches!(status, 200 | 203 | 204 | 300 | 301 | 304 | 404 | 410 | 414)
}

/// Compute the expiry of a response received `now`, per RFC 7234 with the
/// historical defaults.
pub fn ttl(status: u16, beresp: &Http, now: f64, p: &Params) -> Expiry {
    let age = beresp
        .header("age")
        .and_then(|a| a.trim().parse::<u64>().ok())
        .unwrap_or(0) as f64;
    let t_origin = now - age;

    let mut exp = Expiry {
        t_origin,
        ttl: if status_cacheable(status) {
            p.default_ttl
        } else {
            -1.0
        },
        grace: p.default_grace,
        keep: p.default_keep,
    };

    let cc = beresp.header("cache-control").unwrap_or("");
    if cc_has(cc, "no-store") || cc_has(cc, "no-cache") || cc_has(cc, "private") {
        exp.ttl = -1.0;
        return exp;
    }
    if let Some(d) = cc_duration(cc, "s-maxage").or_else(|| cc_duration(cc, "max-age")) {
        exp.ttl = d;
    } else if let Some(expires) = beresp.header("expires").and_then(tim::parse_http_date) {
        let date = beresp
            .header("date")
            .and_then(tim::parse_http_date)
            .unwrap_or(now);
        exp.ttl = expires - date;
    }
    if let Some(d) = cc_duration(cc, "stale-while-revalidate") {
        exp.grace = d;
    }
    exp
}

/// A `Last-Modified` is a strong validator when it predates `Date` by at
/// least a second. Returns the parsed time when strong.
pub fn strong_lm(h: &Http) -> Option<f64> {
    let lm = h.header("last-modified").and_then(tim::parse_http_date)?;
    let date = h.header("date").and_then(tim::parse_http_date)?;
    (lm <= date - 1.0).then_some(lm)
}

/// Does the client accept gzip?
pub fn req_gzip(req: &Http) -> bool {
    req.header("accept-encoding").is_some_and(|ae| {
        ae.split(',').any(|t| {
            let t = t.trim();
            let name = t.split(';').next().unwrap_or("").trim();
            let q0 = t
                .split(';')
                .find_map(|p| p.trim().strip_prefix("q=").map(|q| q.trim() == "0"))
                .unwrap_or(false);
            name.eq_ignore_ascii_case("gzip") && !q0
        })
    })
}

/// Turn a strong `ETag` into a weak one, in place.
pub fn weaken_etag(h: &mut Http) {
    if let Some(etag) = h.header("etag") {
        if !etag.starts_with("W/") {
            let weak = format!("W/{etag}");
            h.force_header("ETag", &weak);
        }
    }
}

fn etag_match(a: &str, b: &str) -> bool {
    // weak comparison, rfc7232 section 2.3.2
    a.trim().trim_start_matches("W/") == b.trim().trim_start_matches("W/")
}

/// Should a hit be answered 304 given the conditional request headers?
pub fn do_cond(req: &Http, resp: &Http, lastmod: Option<f64>) -> bool {
    if let (Some(inm), Some(etag)) = (req.header("if-none-match"), resp.header("etag")) {
        return inm == "*" || inm.split(',').any(|c| etag_match(c, etag));
    }
    if let (Some(ims), Some(lm)) = (req.header("if-modified-since").and_then(tim::parse_http_date), lastmod) {
        return lm <= ims;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(extra: &[(&str, &str)]) -> Http {
        let mut h = Http::new(32);
        h.put_response("HTTP/1.1", 200, None);
        for (n, v) in extra {
            h.set_header(n, v).unwrap();
        }
        h
    }

    #[test]
    fn max_age_wins_over_default() {
        let p = Params::default();
        let now = tim::real();
        let exp = ttl(200, &resp(&[("Cache-Control", "max-age=60")]), now, &p);
        assert!((exp.ttl - 60.0).abs() < f64::EPSILON);
        assert!((exp.t_origin - now).abs() < 0.001);
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let p = Params::default();
        let exp = ttl(
            200,
            &resp(&[("Cache-Control", "max-age=60, s-maxage=120")]),
            tim::real(),
            &p,
        );
        assert!((exp.ttl - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_store_is_uncacheable() {
        let p = Params::default();
        let exp = ttl(200, &resp(&[("Cache-Control", "no-store")]), tim::real(), &p);
        assert!(exp.ttl < 0.0);
    }

    #[test]
    fn age_shifts_origin() {
        let p = Params::default();
        let now = tim::real();
        let exp = ttl(
            200,
            &resp(&[("Age", "30"), ("Cache-Control", "max-age=60")]),
            now,
            &p,
        );
        assert!((exp.t_origin - (now - 30.0)).abs() < 0.001);
    }

    #[test]
    fn uncacheable_status_gets_negative_ttl() {
        let p = Params::default();
        assert!(ttl(500, &resp(&[]), tim::real(), &p).ttl < 0.0);
        assert!(ttl(200, &resp(&[]), tim::real(), &p).ttl > 0.0);
    }

    #[test]
    fn strong_and_weak_last_modified() {
        let h = resp(&[
            ("Date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("Last-Modified", "Sun, 06 Nov 1994 08:49:30 GMT"),
        ]);
        assert!(strong_lm(&h).is_some());
        let h2 = resp(&[
            ("Date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
        ]);
        assert!(strong_lm(&h2).is_none());
    }

    #[test]
    fn gzip_negotiation() {
        let mut r = Http::new(8);
        assert!(!req_gzip(&r));
        r.set_header("Accept-Encoding", "br, gzip;q=0.5").unwrap();
        assert!(req_gzip(&r));
        r.force_header("Accept-Encoding", "gzip;q=0");
        assert!(!req_gzip(&r));
    }

    #[test]
    fn etag_weakening_and_matching() {
        let mut h = resp(&[("ETag", "\"abc\"")]);
        weaken_etag(&mut h);
        assert_eq!(h.header("etag"), Some("W/\"abc\""));
        weaken_etag(&mut h);
        assert_eq!(h.header("etag"), Some("W/\"abc\""));

        let mut req = Http::new(8);
        req.set_header("If-None-Match", "\"abc\"").unwrap();
        assert!(do_cond(&req, &h, None));
    }

    #[test]
    fn ims_exact_match_is_not_modified() {
        let mut req = Http::new(8);
        req.set_header("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT")
            .unwrap();
        let resp = resp(&[]);
        assert!(do_cond(&req, &resp, Some(784_111_777.0)));
        assert!(!do_cond(&req, &resp, Some(784_111_778.0)));
    }
}
