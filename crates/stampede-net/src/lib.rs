#![forbid(unsafe_code)]

//! `stampede-net`
//!
//! The HTTP layer consumed by the stampede core. It deliberately stays thin:
//! a reqwest-backed [`HttpClient`] with two entry points (`get_bytes` for
//! manifests, `get_streaming` for segment workers), plus the header and
//! byte-range types the downloader needs to speak the ranged-HTTP contract.
//!
//! Status-code policy: `get_bytes` treats non-2xx as an error, while
//! `get_streaming` hands any status back to the caller — the downloader owns
//! the temporary/permanent classification (404 is retried, most other non-2xx
//! are fatal).

mod client;
mod error;
mod types;

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

pub use client::{HttpClient, StreamingResponse};
pub use error::{NetError, NetResult};
pub use types::{ContentRange, Headers, NetOptions, RangeSpec, RequestHook};

/// Streamed response body; each item is one chunk as it arrives off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;
