//! Hash table, lookup and the waiting list
//!
//! Every cache key hashes to an [`ObjHead`] grouping all variants of one
//! resource. The objhead owns the variant list and the waiting list of
//! requests parked on a busy placeholder. Lookups resolve to one of the
//! [`Lookup`] outcomes; a `Busy` outcome means the request was parked and
//! its resume callback will run when the placeholder settles.
//!
//! At most one fetch task is ever responsible for filling a given busy
//! placeholder: the placeholder is created inside the objhead lock, and
//! every later lookup for the same key+vary either hits it (and parks) or
//! sees the published object.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest as _, Sha256};

use crate::error::{VclError, VclResult};
use crate::http::Http;
use crate::lck::{Lck, LockClass};
use crate::objcore::{oc_flags, Digest, ObjCore};

/// Compute a cache digest over the given key parts.
pub fn digest(parts: &[&[u8]]) -> Digest {
    let mut sha = Sha256::new();
    for p in parts {
        sha.update(p);
        sha.update([0u8]);
    }
    sha.finalize().into()
}

/// Resume callback of a parked request.
pub type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct OhInner {
    objcs: Vec<Arc<ObjCore>>,
    waiters: Vec<Waiter>,
}

/// One hash bucket entry: all variants of a resource plus its waiting list.
pub struct ObjHead {
    pub digest: Digest,
    inner: Lck<OhInner>,
}

impl ObjHead {
    fn new(digest: Digest) -> Arc<Self> {
        Arc::new(Self {
            digest,
            inner: Lck::new(LockClass::ObjHead, OhInner::default()),
        })
    }

    /// Wake up to `max` parked requests. Runs the callbacks outside the
    /// objhead lock.
    pub fn rush(&self, max: usize) {
        let woken: Vec<Waiter> = {
            let mut g = self.inner.lock();
            let n = g.waiters.len().min(max);
            g.waiters.drain(..n).collect()
        };
        for w in woken {
            w();
        }
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl std::fmt::Debug for ObjHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "objhead {:02x}{:02x}..", self.digest[0], self.digest[1])
    }
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// Fresh object
    Hit { oc: Arc<ObjCore> },
    /// Expired but in grace; serve it and refresh in the background through
    /// the new placeholder
    Grace {
        oc: Arc<ObjCore>,
        busy: Arc<ObjCore>,
    },
    /// Nothing usable; fill the placeholder, maybe revalidating `stale`
    Miss {
        busy: Arc<ObjCore>,
        stale: Option<Arc<ObjCore>>,
    },
    /// A hit-for-miss object short-circuited to a (cacheable) miss
    HitMiss {
        busy: Arc<ObjCore>,
        stale: Option<Arc<ObjCore>>,
    },
    /// A hit-for-pass object: go pass, no placeholder
    HitPass,
    /// Parked on somebody else's busy placeholder
    Busy,
}

/// Inputs of one lookup.
pub struct LookupArgs<'a> {
    pub digest: Digest,
    pub req_http: &'a Http,
    pub now: f64,
    pub always_miss: bool,
    pub ignore_busy: bool,
    pub ignore_vary: bool,
    /// Extra grace allowed by policy, NaN = no override
    pub d_grace: f64,
}

/// The cache hash.
pub struct Hsh {
    tbl: Lck<HashMap<Digest, Arc<ObjHead>>>,
}

impl Hsh {
    pub fn new() -> Self {
        Self {
            tbl: Lck::new(LockClass::HashTable, HashMap::new()),
        }
    }

    pub fn get_or_create(&self, digest: Digest) -> Arc<ObjHead> {
        self.tbl
            .lock()
            .entry(digest)
            .or_insert_with(|| ObjHead::new(digest))
            .clone()
    }

    /// Look the request up, parking it via `park` when it loses to a busy
    /// placeholder. Returns the outcome and the number of variants walked.
    pub fn lookup(
        &self,
        la: &LookupArgs,
        park: impl FnOnce() -> Waiter,
    ) -> (Lookup, usize) {
        let oh = self.get_or_create(la.digest);
        let mut g = oh.inner.lock();

        let mut busy_found = None;
        let mut fresh = None;
        let mut grace_oc: Option<Arc<ObjCore>> = None;
        let mut stale_oc: Option<Arc<ObjCore>> = None;
        let mut hfm = None;
        let mut hfp = false;
        let mut variants = 0usize;

        for oc in &g.objcs {
            if oc.has_flag(oc_flags::DYING) || oc.has_flag(oc_flags::FAILED) {
                continue;
            }
            variants += 1;
            if oc.has_flag(oc_flags::BUSY) {
                // can only vary-match once the fetch published its key
                let candidate = match oc.get_boc().and_then(|b| b.vary()) {
                    Some(key) => la.ignore_vary || vary_match(&key, la.req_http),
                    None => true,
                };
                if candidate && !la.ignore_busy && !la.always_miss {
                    busy_found = Some(oc.clone());
                }
                continue;
            }
            if !la.ignore_vary {
                let matched = oc.with_attrs(|a| {
                    a.vary
                        .as_ref()
                        .map_or(true, |key| vary_match(key, la.req_http))
                });
                if !matched {
                    continue;
                }
            }
            let exp = oc.exp();
            let remaining = exp.t_origin + exp.ttl - la.now;
            if oc.has_flag(oc_flags::HFP) {
                if remaining > 0.0 {
                    hfp = true;
                }
                continue;
            }
            if oc.has_flag(oc_flags::HFM) {
                if remaining > 0.0 {
                    hfm = Some(oc.clone());
                } else {
                    stale_oc.get_or_insert_with(|| oc.clone());
                }
                continue;
            }
            if la.always_miss {
                stale_oc.get_or_insert_with(|| oc.clone());
                continue;
            }
            let grace = if la.d_grace.is_nan() { exp.grace } else { la.d_grace };
            if remaining > 0.0 {
                fresh.get_or_insert_with(|| oc.clone());
            } else if remaining + grace > 0.0 {
                grace_oc.get_or_insert_with(|| oc.clone());
            } else if remaining + exp.grace + exp.keep > 0.0 {
                stale_oc.get_or_insert_with(|| oc.clone());
            }
        }

        if let Some(oc) = fresh {
            return (Lookup::Hit { oc }, variants);
        }
        if hfp {
            return (Lookup::HitPass, variants);
        }
        if hfm.is_some() {
            let busy = self.insert_busy_locked(&oh, &mut g);
            return (
                Lookup::HitMiss {
                    busy,
                    stale: stale_oc,
                },
                variants,
            );
        }
        if let Some(oc) = grace_oc {
            if busy_found.is_some() {
                // refresh already under way, plain grace hit
                return (Lookup::Hit { oc }, variants);
            }
            let busy = self.insert_busy_locked(&oh, &mut g);
            return (Lookup::Grace { oc, busy }, variants);
        }
        if busy_found.is_some() {
            g.waiters.push(park());
            return (Lookup::Busy, variants);
        }
        let busy = self.insert_busy_locked(&oh, &mut g);
        (
            Lookup::Miss {
                busy,
                stale: stale_oc,
            },
            variants,
        )
    }

    fn insert_busy_locked(
        &self,
        oh: &Arc<ObjHead>,
        g: &mut crate::lck::LckGuard<'_, OhInner>,
    ) -> Arc<ObjCore> {
        let busy = ObjCore::new_busy(oh.digest);
        busy.set_objhead(oh);
        g.objcs.push(busy.clone());
        busy
    }

    /// A private objcore for pass fetches and synthetic bodies.
    pub fn private(&self) -> Arc<ObjCore> {
        ObjCore::new_private()
    }

    /// Publish a filled placeholder: clear `BUSY` and rush the waiting list.
    pub fn unbusy(&self, oc: &Arc<ObjCore>) {
        assert!(oc.has_flag(oc_flags::BUSY));
        oc.clear_busy();
        self.rush_policy(oc);
    }

    /// Take an unfilled placeholder back out (the fetch never happened).
    /// The caller owns any boc-state signaling.
    pub fn withdraw(&self, oc: &Arc<ObjCore>) {
        assert!(oc.has_flag(oc_flags::BUSY));
        oc.set_flag(oc_flags::DYING);
        oc.clear_busy();
        oc.drop_boc();
        self.remove(oc);
    }

    /// Mark a fetch failure. The placeholder stays findable as failed until
    /// killed.
    pub fn fail(&self, oc: &Arc<ObjCore>) {
        oc.set_flag(oc_flags::FAILED);
        oc.set_obj_flag(crate::objcore::obj_flags::FAILED, true);
    }

    /// Remove an object from its head and stop serving it.
    pub fn kill(&self, oc: &Arc<ObjCore>) {
        oc.set_flag(oc_flags::DYING);
        self.remove(oc);
    }

    /// Swap a revalidated object for the stale one it replaces.
    pub fn replace(&self, stale: &Arc<ObjCore>, new: &Arc<ObjCore>) {
        debug_assert_eq!(stale.digest, new.digest);
        self.kill(stale);
    }

    /// Kill every live, non-busy variant under the head. Returns how many.
    pub fn purge(&self, oh: &Arc<ObjHead>) -> usize {
        let victims: Vec<Arc<ObjCore>> = {
            let g = oh.inner.lock();
            g.objcs
                .iter()
                .filter(|oc| !oc.has_flag(oc_flags::BUSY) && !oc.has_flag(oc_flags::DYING))
                .cloned()
                .collect()
        };
        for oc in &victims {
            self.kill(oc);
        }
        victims.len()
    }

    /// Drop a reference, rushing the waiting list when asked to.
    pub fn deref(&self, oc: Arc<ObjCore>, rush: bool) {
        if rush {
            self.rush_policy(&oc);
        }
        drop(oc);
    }

    fn rush_policy(&self, oc: &Arc<ObjCore>) {
        if let Some(oh) = oc.objhead() {
            let n = 1usize << crate::param::get().rush_exponent;
            oh.rush(n);
        }
    }

    fn remove(&self, oc: &Arc<ObjCore>) {
        if let Some(oh) = oc.objhead() {
            let mut g = oh.inner.lock();
            g.objcs.retain(|o| !Arc::ptr_eq(o, oc));
            drop(g);
            let n = 1usize << crate::param::get().rush_exponent;
            oh.rush(n);
        }
    }
}

/// Build the vary key for a response: the folded `Vary` names paired with
/// the request values they had. `Vary: *` cannot be matched and is an error
/// the caller turns into a pass.
pub fn vary_create(req: &Http, beresp: &Http) -> VclResult<Option<Bytes>> {
    let Some(vary) = beresp.header("vary") else {
        return Ok(None);
    };
    let mut b = BytesMut::new();
    let mut names: Vec<String> = vary
        .split(',')
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort();
    names.dedup();
    for name in names {
        if name == "*" {
            return Err(VclError::Msg("Illegal 'Vary' header from backend".into()));
        }
        let val = req.header(&name).unwrap_or("");
        b.put_u16(name.len() as u16);
        b.put_slice(name.as_bytes());
        b.put_u16(val.len() as u16);
        b.put_slice(val.as_bytes());
    }
    if b.is_empty() {
        return Ok(None);
    }
    Ok(Some(b.freeze()))
}

/// Does the request present the same values the vary key was built from?
pub fn vary_match(key: &Bytes, req: &Http) -> bool {
    let mut buf = &key[..];
    while buf.len() >= 2 {
        let nl = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        buf = &buf[2..];
        if buf.len() < nl + 2 {
            return false;
        }
        let name = &buf[..nl];
        buf = &buf[nl..];
        let vl = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        buf = &buf[2..];
        if buf.len() < vl {
            return false;
        }
        let want = &buf[..vl];
        buf = &buf[vl..];
        let name = std::str::from_utf8(name).unwrap_or("");
        let have = req.header(name).unwrap_or("");
        if have.as_bytes() != want {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objcore::BocState;
    use crate::rfc2616::Expiry;
    use crate::tim;

    fn req(hdrs: &[(&str, &str)]) -> Http {
        let mut h = Http::new(16);
        h.set_method("GET");
        h.set_url("/a");
        for (n, v) in hdrs {
            h.set_header(n, v).unwrap();
        }
        h
    }

    fn args<'a>(d: Digest, http: &'a Http) -> LookupArgs<'a> {
        LookupArgs {
            digest: d,
            req_http: http,
            now: tim::real(),
            always_miss: false,
            ignore_busy: false,
            ignore_vary: false,
            d_grace: f64::NAN,
        }
    }

    fn no_park() -> Waiter {
        Box::new(|| panic!("unexpected park"))
    }

    fn publish(hsh: &Hsh, oc: &Arc<ObjCore>, ttl: f64, grace: f64, keep: f64) {
        oc.set_exp(Expiry {
            t_origin: tim::real(),
            ttl,
            grace,
            keep,
        });
        let boc = oc.get_boc().unwrap();
        boc.set_state(BocState::ReqDone);
        boc.set_state(BocState::PrepStream);
        hsh.unbusy(oc);
        boc.set_state(BocState::Stream);
        boc.set_state(BocState::Finished);
        oc.drop_boc();
    }

    #[test]
    fn miss_then_hit() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);

        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, stale } = r else {
            panic!("expected miss");
        };
        assert!(stale.is_none());
        publish(&hsh, &busy, 60.0, 10.0, 0.0);

        let (r, variants) = hsh.lookup(&args(d, &h), no_park);
        assert!(matches!(r, Lookup::Hit { .. }));
        assert_eq!(variants, 1);
    }

    #[test]
    fn second_lookup_parks_on_busy() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };

        let woken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let w2 = woken.clone();
        let (r, _) = hsh.lookup(&args(d, &h), move || {
            Box::new(move || w2.store(true, std::sync::atomic::Ordering::SeqCst))
        });
        assert!(matches!(r, Lookup::Busy));
        assert!(!woken.load(std::sync::atomic::Ordering::SeqCst));

        publish(&hsh, &busy, 60.0, 10.0, 0.0);
        assert!(woken.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn expired_in_grace_schedules_refresh() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        publish(&hsh, &busy, 60.0, 30.0, 0.0);
        // age it out of ttl but not out of grace
        let mut e = busy.exp();
        e.t_origin -= 70.0;
        busy.set_exp(e);

        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Grace { oc, busy: nb } = r else {
            panic!("expected grace outcome");
        };
        assert!(Arc::ptr_eq(&oc, &busy));
        assert!(nb.has_flag(oc_flags::BUSY));

        // while the refresh placeholder exists, further lookups are plain
        // grace hits, not more placeholders
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        assert!(matches!(r, Lookup::Hit { .. }));
        hsh.withdraw(&nb);
    }

    #[test]
    fn keep_window_supplies_stale_candidate() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        publish(&hsh, &busy, 10.0, 5.0, 100.0);
        let mut e = busy.exp();
        e.t_origin -= 50.0;
        busy.set_exp(e);

        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { stale, .. } = r else {
            panic!("expected miss with stale");
        };
        assert!(stale.is_some_and(|s| Arc::ptr_eq(&s, &busy)));
    }

    #[test]
    fn vary_separates_variants() {
        let hsh = Hsh::new();
        let d = digest(&[b"/a"]);
        let gz = req(&[("Accept-Encoding", "gzip")]);
        let plain = req(&[]);

        let (r, _) = hsh.lookup(&args(d, &gz), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        let mut beresp = Http::new(8);
        beresp.put_response("HTTP/1.1", 200, None);
        beresp.set_header("Vary", "Accept-Encoding").unwrap();
        let key = vary_create(&gz, &beresp).unwrap();
        busy.with_attrs_mut(|a| a.vary = key.clone());
        publish(&hsh, &busy, 60.0, 0.0, 0.0);

        let (r, _) = hsh.lookup(&args(d, &gz), no_park);
        assert!(matches!(r, Lookup::Hit { .. }));
        let (r, _) = hsh.lookup(&args(d, &plain), no_park);
        assert!(matches!(r, Lookup::Miss { .. }));
    }

    #[test]
    fn vary_star_is_refused() {
        let mut beresp = Http::new(8);
        beresp.put_response("HTTP/1.1", 200, None);
        beresp.set_header("Vary", "*").unwrap();
        assert!(vary_create(&req(&[]), &beresp).is_err());
    }

    #[test]
    fn purge_kills_all_variants() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        publish(&hsh, &busy, 60.0, 0.0, 0.0);

        let oh = hsh.get_or_create(d);
        assert_eq!(hsh.purge(&oh), 1);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        assert!(matches!(r, Lookup::Miss { .. }));
    }

    #[test]
    fn hitmiss_objects_force_miss_and_hitpass_forces_pass() {
        let hsh = Hsh::new();
        let h = req(&[]);
        let d = digest(&[b"/a"]);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        busy.set_flag(oc_flags::HFM);
        publish(&hsh, &busy, 60.0, 0.0, 0.0);
        let (r, _) = hsh.lookup(&args(d, &h), no_park);
        let Lookup::HitMiss { busy: b2, .. } = r else {
            panic!("expected hitmiss");
        };
        hsh.withdraw(&b2);

        let d2 = digest(&[b"/b"]);
        let (r, _) = hsh.lookup(&args(d2, &h), no_park);
        let Lookup::Miss { busy, .. } = r else {
            panic!()
        };
        busy.set_flag(oc_flags::HFP);
        publish(&hsh, &busy, 60.0, 0.0, 0.0);
        let (r, _) = hsh.lookup(&args(d2, &h), no_park);
        assert!(matches!(r, Lookup::HitPass));
    }
}
