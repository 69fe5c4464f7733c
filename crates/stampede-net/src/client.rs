use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    types::{Headers, NetOptions, RangeSpec, RequestHook},
    ByteStream,
};

/// Streamed GET response with the headers the downloader cares about.
///
/// The status code is *not* checked here; range workers classify it
/// themselves (a 404 is a retryable condition for segments that have not
/// reached the CDN yet, while most other non-2xx codes are fatal).
pub struct StreamingResponse {
    pub status: u16,
    pub final_url: Url,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub stream: ByteStream,
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }

    fn build_headers(headers: Option<Headers>, hook: Option<&RequestHook>) -> Headers {
        let mut headers = headers.unwrap_or_default();
        if let Some(hook) = hook {
            hook(&mut headers);
        }
        headers
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: &Headers,
    ) -> reqwest::RequestBuilder {
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        req
    }

    /// Fetch a whole body, requiring a 2xx status.
    ///
    /// Redirects are followed; the returned URL is the final one, which the
    /// HLS layer needs to resolve relative manifest entries correctly.
    pub async fn get_bytes(
        &self,
        url: Url,
        headers: Option<Headers>,
        hook: Option<&RequestHook>,
    ) -> NetResult<(Url, Bytes)> {
        let headers = Self::build_headers(headers, hook);
        let req = Self::apply_headers(self.inner.get(url.clone()), &headers)
            .timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();
        let final_url = resp.url().clone();

        if !status.is_success() {
            return Err(NetError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await.map_err(NetError::from)?;
        Ok((final_url, body))
    }

    /// Open a streaming GET, optionally ranged.
    ///
    /// No overall timeout is applied: segment downloads are guarded against
    /// stalls by the caller's watchdog, not by wall-clock limits.
    pub async fn get_streaming(
        &self,
        url: Url,
        range: Option<RangeSpec>,
        headers: Option<Headers>,
        hook: Option<&RequestHook>,
    ) -> NetResult<StreamingResponse> {
        let mut headers = Self::build_headers(headers, hook);
        if let Some(range) = &range {
            headers.insert("Range", range.to_header_value());
        }

        let req = Self::apply_headers(self.inner.get(url.clone()), &headers);
        let resp = req.send().await.map_err(NetError::from)?;

        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        let content_length = resp.content_length();
        let content_range = resp
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(
            url = %final_url,
            status,
            content_length,
            ranged = range.is_some(),
            "streaming request opened"
        );

        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(StreamingResponse {
            status,
            final_url,
            content_length,
            content_range,
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::Request, http::StatusCode, response::Response, routing::get, Router};
    use futures::StreamExt;
    use tokio::net::TcpListener;

    use super::*;

    const DATA: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    async fn range_endpoint(request: Request) -> Result<Response, StatusCode> {
        let range = request
            .headers()
            .get("Range")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("bytes="))
            .and_then(|h| h.split_once('-'));

        if let Some((start, end)) = range {
            let start: usize = start.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
            let end: usize = if end.is_empty() {
                DATA.len() - 1
            } else {
                end.parse().map_err(|_| StatusCode::BAD_REQUEST)?
            };
            if start >= DATA.len() || end < start {
                return Err(StatusCode::RANGE_NOT_SATISFIABLE);
            }
            let end = end.min(DATA.len() - 1);
            return Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header("Content-Range", format!("bytes {start}-{end}/{}", DATA.len()))
                .body(axum::body::Body::from(Bytes::copy_from_slice(
                    &DATA[start..=end],
                )))
                .unwrap());
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(axum::body::Body::from(Bytes::copy_from_slice(DATA)))
            .unwrap())
    }

    async fn echo_marker(request: Request) -> String {
        request
            .headers()
            .get("x-test-marker")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("absent")
            .to_string()
    }

    async fn run_server() -> String {
        let app = Router::new()
            .route("/data", get(range_endpoint))
            .route("/marker", get(echo_marker))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn get_bytes_returns_body() {
        let base = run_server().await;
        let client = HttpClient::new(NetOptions::default());
        let (_, body) = client
            .get_bytes(format!("{base}/data").parse().unwrap(), None, None)
            .await
            .unwrap();
        assert_eq!(&body[..], DATA);
    }

    #[tokio::test]
    async fn get_bytes_errors_on_404() {
        let base = run_server().await;
        let client = HttpClient::new(NetOptions::default());
        let err = client
            .get_bytes(format!("{base}/missing").parse().unwrap(), None, None)
            .await
            .unwrap_err();
        match err {
            NetError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_streaming_reports_content_range() {
        let base = run_server().await;
        let client = HttpClient::new(NetOptions::default());
        let resp = client
            .get_streaming(
                format!("{base}/data").parse().unwrap(),
                Some(RangeSpec::new(5, Some(9))),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 206);
        let cr = crate::ContentRange::parse(resp.content_range.as_deref().unwrap()).unwrap();
        assert_eq!(cr.range, 5..10);
        assert_eq!(cr.total, DATA.len() as u64);

        let mut collected = Vec::new();
        let mut stream = resp.stream;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"56789");
    }

    #[tokio::test]
    async fn get_streaming_surfaces_status_without_error() {
        let base = run_server().await;
        let client = HttpClient::new(NetOptions::default());
        let resp = client
            .get_streaming(format!("{base}/missing").parse().unwrap(), None, None, None)
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn request_hook_stamps_headers() {
        let base = run_server().await;
        let client = HttpClient::new(NetOptions::default());
        let hook: RequestHook = Arc::new(|headers: &mut Headers| {
            headers.insert("x-test-marker", "1");
        });
        let (_, body) = client
            .get_bytes(
                format!("{base}/marker").parse().unwrap(),
                None,
                Some(&hook),
            )
            .await
            .unwrap();
        assert_eq!(&body[..], b"1");
    }
}
