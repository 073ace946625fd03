//! Run-time parameters
//!
//! All tunables the core reads live in a single [`Params`] struct. The active
//! set is published process-wide as an immutable snapshot behind an `Arc`;
//! readers grab the snapshot once per task and never lock on the hot path.
//! Updating parameters swaps the snapshot wholesale.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Process-wide tunables.
///
/// Durations are in seconds, sizes in bytes. Per-busyobj timeout overrides
/// start out as NaN, meaning "inherit the value here at resolution time".
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Params {
    /// Backend fetch attempts on top of the first one
    pub max_retries: u32,
    /// Client-side restart budget
    pub max_restarts: u32,
    /// ESI include nesting budget
    pub max_esi_depth: u32,

    /// TTL assigned when the response carries no caching information
    pub default_ttl: f64,
    pub default_grace: f64,
    pub default_keep: f64,
    /// Objects with a total lifetime below this go to transient storage
    pub shortlived: f64,

    /// Upper bound on a single storage chunk requested by the fetch pipeline
    pub fetch_chunksize: usize,
    /// Scratch buffer size for the gzip/gunzip filters
    pub gzip_buffer: usize,
    /// Compression level for the fetch-side gzip filter
    pub gzip_level: u32,

    pub http_gzip_support: bool,
    pub http_range_support: bool,
    /// Maximum header count per message
    pub http_max_hdr: usize,

    /// Log a notice when a lookup walks more variants than this
    pub vary_notice: usize,
    /// High watermark (bytes) for streaming fetches ahead of delivery, 0 = off
    pub transit_buffer: u64,
    /// How many waiting-list entries one unbusy wakes up
    pub rush_exponent: usize,

    pub workspace_client: usize,
    pub workspace_backend: usize,
    pub workspace_session: usize,

    pub connect_timeout: f64,
    pub first_byte_timeout: f64,
    pub between_bytes_timeout: f64,
    pub send_timeout: f64,

    /// Deliver through the lease (VAI) path when the whole chain supports it
    pub vai_deliver: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_retries: 4,
            max_restarts: 4,
            max_esi_depth: 5,
            default_ttl: 120.0,
            default_grace: 10.0,
            default_keep: 0.0,
            shortlived: 10.0,
            fetch_chunksize: 16 * 1024,
            gzip_buffer: 32 * 1024,
            gzip_level: 6,
            http_gzip_support: true,
            http_range_support: true,
            http_max_hdr: 64,
            vary_notice: 10,
            transit_buffer: 0,
            rush_exponent: 3,
            workspace_client: 32 * 1024,
            workspace_backend: 64 * 1024,
            workspace_session: 512,
            connect_timeout: 3.5,
            first_byte_timeout: 60.0,
            between_bytes_timeout: 60.0,
            send_timeout: 600.0,
            vai_deliver: false,
        }
    }
}

static ACTIVE: Lazy<RwLock<Arc<Params>>> = Lazy::new(|| RwLock::new(Arc::new(Params::default())));

/// Fetch the active parameter snapshot.
pub fn get() -> Arc<Params> {
    ACTIVE.read().clone()
}

/// Publish a new parameter snapshot. Tasks already running keep the one they
/// grabbed at start.
pub fn publish(p: Params) {
    *ACTIVE.write() = Arc::new(p);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_stable_across_publish() {
        let before = get();
        let mut p = Params::default();
        p.max_retries = 9;
        publish(p);
        assert_eq!(before.max_retries, 4);
        assert_eq!(get().max_retries, 9);
        publish(Params::default());
    }
}
