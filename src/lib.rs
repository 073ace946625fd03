//! # varnish-core
//!
//! The request-handling core of an HTTP caching reverse proxy: the state
//! machine that carries a client request from arrival through cache lookup,
//! backend fetch (possibly concurrent with delivery), filter-chain
//! processing, and response transmission.
//!
//! The crate is organized around three cooperating pieces:
//!
//! * the client request FSM ([`req_fsm`]), which suspends on busy objects
//!   and resumes when they settle;
//! * the backend fetch FSM ([`fetch`]), running on its own worker, feeding a
//!   storage object the client side may stream from *before* the fetch
//!   completes;
//! * the filter pipelines ([`proc`]): composable byte transforms with a
//!   push/pull interface and a vectored, lease-based zero-copy alternative.
//!
//! Everything meets in [`cache::Cache`], which owns the hash, storage and
//! worker pool:
//!
//! ```no_run
//! use std::sync::Arc;
//! use varnish_core::backend::Http1Director;
//! use varnish_core::cache::Cache;
//! use varnish_core::deliver::MemTransport;
//!
//! let backend = Http1Director::new("default", "127.0.0.1:8081".parse().unwrap());
//! let cache = Cache::new(backend);
//!
//! let sess = cache.new_session(None);
//! let transport = MemTransport::new();
//! let out = transport.buf.clone();
//! let mut req = cache
//!     .http1_req(sess, Box::new(transport), b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", None)
//!     .unwrap();
//! cache.serve(&mut req);
//! let response = out.lock().clone();
//! # drop(response);
//! ```
//!
//! Management plane, policy compilation, protocol dissectors and persistent
//! storage live elsewhere; this crate treats them as collaborators behind
//! the [`vcl::Vcl`], [`backend::Director`], [`deliver::Transport`] and
//! [`storage::Stevedore`] traits.

pub mod backend;
pub mod cache;
pub mod deliver;
pub mod error;
pub mod fetch;
pub mod filters;
pub mod hash;
pub mod http;
pub mod lck;
pub mod objcore;
pub mod param;
pub mod proc;
pub mod proto;
pub mod req;
pub mod req_fsm;
pub mod rfc2616;
pub mod session;
pub mod storage;
pub mod tim;
pub mod vcl;
pub mod worker;
pub mod ws;

pub use error::{VclError, VclResult};
