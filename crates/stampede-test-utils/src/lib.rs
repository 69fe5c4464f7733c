#![forbid(unsafe_code)]

//! Shared async HTTP test helpers for the stampede workspace.

mod http_server;
mod range_fixture;

pub use http_server::TestHttpServer;
pub use range_fixture::{range_fixture_router, RangeFixture};
