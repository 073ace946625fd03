//! Sessions and stream close reasons

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::tim;

/// Why a stream (client connection, backend connection) was or will be
/// closed. `None` means "no reason yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClose {
    None,
    RemClose,
    ReqClose,
    ReqHttp10,
    RxBad,
    RxBody,
    RxJunk,
    RxOverflow,
    RxTimeout,
    TxPipe,
    TxError,
    TxEof,
    RespClose,
    Overload,
    PipeOverflow,
    RangeShort,
    ReqHttp20,
    VclFailure,
    RapidReset,
    TrafficRefuse,
}

impl StreamClose {
    pub fn desc(self) -> &'static str {
        match self {
            Self::None => "(null)",
            Self::RemClose => "Remote closed",
            Self::ReqClose => "Client requested close",
            Self::ReqHttp10 => "Proto < HTTP/1.1",
            Self::RxBad => "Received bad req/resp",
            Self::RxBody => "Failure receiving body",
            Self::RxJunk => "Received junk data",
            Self::RxOverflow => "Received buffer overflow",
            Self::RxTimeout => "Receive timeout",
            Self::TxPipe => "Piped transaction",
            Self::TxError => "Error transaction",
            Self::TxEof => "EOF transmission",
            Self::RespClose => "Backend/VCL requested close",
            Self::Overload => "Out of some resource",
            Self::PipeOverflow => "Session pipe overflow",
            Self::RangeShort => "Insufficient data for range",
            Self::ReqHttp20 => "HTTP2 not accepted",
            Self::VclFailure => "VCL failure",
            Self::RapidReset => "HTTP2 rapid reset",
            Self::TrafficRefuse => "Traffic refused",
        }
    }

    /// Does this reason describe an error (as opposed to an orderly close)?
    pub fn is_err(self) -> bool {
        !matches!(
            self,
            Self::None | Self::RemClose | Self::ReqClose | Self::ReqHttp10 | Self::TxPipe | Self::TxEof | Self::RespClose
        )
    }
}

/// One client connection. The listener creates it, the last request on it
/// drops it.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub client_addr: Option<SocketAddr>,
    pub t_open: f64,
    reason: AtomicU8,
}

impl Session {
    pub fn new(id: u64, client_addr: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            id,
            client_addr,
            t_open: tim::real(),
            reason: AtomicU8::new(0),
        })
    }

    /// Record why the session is being closed; first reason wins.
    pub fn close(&self, why: StreamClose) {
        let _ = self
            .reason
            .compare_exchange(0, why as u8 + 1, Ordering::AcqRel, Ordering::Acquire);
        log::debug!("sess {}: close {}", self.id, why.desc());
    }

    pub fn closed(&self) -> bool {
        self.reason.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_close_reason_wins() {
        let sp = Session::new(1, None);
        assert!(!sp.closed());
        sp.close(StreamClose::TxError);
        sp.close(StreamClose::RemClose);
        assert!(sp.closed());
    }

    #[test]
    fn every_reason_has_a_description() {
        assert_eq!(StreamClose::Overload.desc(), "Out of some resource");
        assert!(StreamClose::TxError.is_err());
        assert!(!StreamClose::TxEof.is_err());
    }
}
