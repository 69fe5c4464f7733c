use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;

/// Content server configuration for downloader scenarios.
///
/// Routes:
/// - `/ranged` — honors `Range:` (206 + `Content-Range`), throttled.
/// - `/plain` — rejects `Range:` with 400, serves 200 with `Content-Length`.
/// - `/no-length` — like `/plain` but without `Content-Length`.
#[derive(Clone)]
pub struct RangeFixture {
    pub content: Bytes,
    /// Bytes per emitted chunk.
    pub chunk: usize,
    /// Pause between chunks; zero disables throttling.
    pub chunk_delay: Duration,
}

impl RangeFixture {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            chunk: 8 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn throttled(mut self, chunk: usize, delay: Duration) -> Self {
        self.chunk = chunk;
        self.chunk_delay = delay;
        self
    }

    fn body_for(&self, slice: Bytes) -> Body {
        let chunk = self.chunk.max(1);
        let delay = self.chunk_delay;
        Body::from_stream(async_stream::stream! {
            let mut off = 0usize;
            while off < slice.len() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let end = (off + chunk).min(slice.len());
                yield Ok::<_, std::convert::Infallible>(slice.slice(off..end));
                off = end;
            }
        })
    }
}

fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = header.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    if start >= len || end < start {
        return None;
    }
    Some((start, end.min(len - 1)))
}

async fn ranged(State(fx): State<RangeFixture>, request: Request) -> Result<Response, StatusCode> {
    let len = fx.content.len();
    let header = request.headers().get("Range").and_then(|h| h.to_str().ok());

    if let Some(header) = header {
        let (start, end) = parse_range(header, len).ok_or(StatusCode::RANGE_NOT_SATISFIABLE)?;
        let body = fx.body_for(fx.content.slice(start..=end));
        return Ok(Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header("Content-Range", format!("bytes {start}-{end}/{len}"))
            .header("Content-Length", (end - start + 1).to_string())
            .body(body)
            .unwrap());
    }

    let body = fx.body_for(fx.content.clone());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", len.to_string())
        .body(body)
        .unwrap())
}

async fn plain(State(fx): State<RangeFixture>, request: Request) -> Result<Response, StatusCode> {
    if request.headers().contains_key("Range") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let body = fx.body_for(fx.content.clone());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", fx.content.len().to_string())
        .body(body)
        .unwrap())
}

async fn no_length(
    State(fx): State<RangeFixture>,
    request: Request,
) -> Result<Response, StatusCode> {
    if request.headers().contains_key("Range") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let body = fx.body_for(fx.content.clone());
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .unwrap())
}

/// Router exposing the three scenario endpoints for `fixture`.
pub fn range_fixture_router(fixture: RangeFixture) -> Router {
    Router::new()
        .route("/ranged", get(ranged))
        .route("/plain", get(plain))
        .route("/no-length", get(no_length))
        .with_state(fixture)
}
