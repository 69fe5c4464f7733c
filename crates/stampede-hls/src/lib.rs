#![forbid(unsafe_code)]

//! `stampede-hls`
//!
//! The orchestration half of the stampede cache: live playlist tracking,
//! per-client progress, prefetch scheduling and manifest rewriting.
//!
//! How a stream flows through this crate:
//! 1. A client asks for a manifest URL carrying the boost marker. The
//!    [`service::BoostService`] sniffs the upstream, registers a live
//!    [`playlist::Playlist`] and hands back a rewritten manifest whose URIs
//!    re-enter the proxy with tracking markers.
//! 2. Every tracked segment fetch updates the client's
//!    [`user::User`] stream state, which sizes a prefetch window and plants a
//!    prefetch intent on the playlist.
//! 3. The playlist's run loop refreshes the upstream manifest, starts
//!    segment downloads ahead of the client (bounded by the prefetch cap)
//!    and shrinks the cached window behind it.

mod cache_dirs;
mod error;
mod ids;
mod manager;
mod manifest;
mod options;
mod playlist;
mod rewrite;
mod segment;
mod service;
mod user;

pub use cache_dirs::CacheDirs;
pub use error::{HlsError, HlsResult};
pub use ids::{gen_user_id, short_hash};
pub use manager::Manager;
pub use manifest::{looks_like_m3u8, Manifest};
pub use options::UrlOptions;
pub use playlist::{Playlist, PlaylistRef, PrefetchHandle, PrefetchIntent};
pub use rewrite::{rewrite_master, rewrite_media, to_proxy_uri, variant_manifest};
pub use segment::{Segment, SegmentRef};
pub use service::{boost_router, BoostService, HlsOptions, SKIP_HEADER};
pub use user::{User, UserRef};
