use std::{io, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::Response,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use stampede_ant::Status;
use stampede_net::{Headers, HttpClient, RequestHook};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    cache_dirs::CacheDirs,
    error::HlsResult,
    ids::{gen_user_id, short_hash},
    manifest::{master_to_bytes, media_to_bytes, Manifest},
    manager::Manager,
    options::UrlOptions,
    playlist::Playlist,
    rewrite::{rewrite_master, rewrite_media, to_proxy_uri, variant_manifest},
    segment::SegmentRef,
};

/// Header stamped on self-issued requests so they bypass the boost path
/// instead of recursing through it.
pub const SKIP_HEADER: &str = "x-stampede-skip-boost";

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Clone, Debug)]
pub struct HlsOptions {
    pub cache_root: PathBuf,
    pub tidy_interval: Duration,
    pub user_idle_timeout: Duration,
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("./hlscache"),
            tidy_interval: Duration::from_secs(5),
            user_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// The HLS boost entry points: tracked playlist serving and tracked segment
/// streaming, with "fall back to plain forwarding" as the escape hatch.
#[derive(Clone)]
pub struct BoostService {
    mgr: Arc<Manager>,
    net: HttpClient,
    cache_dirs: Arc<CacheDirs>,
    hook: RequestHook,
}

impl BoostService {
    pub fn new(opts: HlsOptions, net: HttpClient) -> HlsResult<Self> {
        let cache_dirs = Arc::new(CacheDirs::open(&opts.cache_root)?);
        let mgr = Manager::with_intervals(opts.tidy_interval, opts.user_idle_timeout);
        let hook: RequestHook = Arc::new(|headers: &mut Headers| {
            headers.insert(SKIP_HEADER, "1");
        });
        Ok(Self {
            mgr,
            net,
            cache_dirs,
            hook,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.mgr
    }

    pub fn shutdown(&self) {
        self.mgr.shutdown();
    }

    async fn handle(&self, req: Request) -> Response {
        let path = req.uri().path().to_string();
        let query = req
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let client_range = req
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (clean_path, opts) = UrlOptions::extract(&path);
        let path_query = format!("{clean_path}{query}");

        let skip = req.headers().contains_key(SKIP_HEADER)
            || opts.hls_skip == Some(true)
            || req.method() != Method::GET;
        if skip {
            return self.forward(&path_query, &opts, client_range.as_deref()).await;
        }

        if opts.hls_segment.is_some() {
            let short_url = clean_path == "/";
            match self.serve_segment(&opts, short_url, client_range.as_deref()).await {
                Some(resp) => resp,
                None => self.forward(&path_query, &opts, client_range.as_deref()).await,
            }
        } else if opts.hls_boost == Some(true) {
            match self.serve_playlist(&path_query, &opts).await {
                Some(resp) => resp,
                None => self.forward(&path_query, &opts, client_range.as_deref()).await,
            }
        } else {
            self.forward(&path_query, &opts, client_range.as_deref()).await
        }
    }

    /// Serve a tracked segment. `None` means "fall back to plain proxying".
    async fn serve_segment(
        &self,
        opts: &UrlOptions,
        short_url: bool,
        client_range: Option<&str>,
    ) -> Option<Response> {
        let (Some(playlist_id), Some(user_id), Some(seg_id)) =
            (&opts.hls_playlist, &opts.hls_user, &opts.hls_segment)
        else {
            return None;
        };

        let Some(pl) = self.mgr.playlist(playlist_id) else {
            warn!(playlist = %playlist_id, "playlist not found");
            return Some(gone());
        };
        let user = self.mgr.user(user_id);

        // Looking the segment up also advances the user's tracked progress.
        let Some(seg) = user.get_segment(&pl, seg_id) else {
            warn!(user = %user_id, playlist = %playlist_id, seg_id = %seg_id, "segment not found");
            // A short URL has no upstream to fall back to.
            return short_url.then(gone);
        };

        if pl.max_prefetches() <= 0 {
            // Prefetching disabled; a short URL still has to be answered
            // in place, everything else goes the plain route.
            if short_url {
                let url = seg.url().clone();
                return Some(self.forward_url(url, client_range).await);
            }
            return None;
        }

        let cancel = CancellationToken::new();
        let total = match seg.total_size(&cancel).await {
            Ok(total) => total,
            Err(e) => {
                debug!(seg_id = %seg.seg_id(), error = %e, "segment size unavailable");
                None
            }
        };
        let status = seg.status();
        if status == Status::Aborted || status == Status::Destroyed {
            error!(seg_id = %seg.seg_id(), ?status, "segment unusable, resetting progress");
            // The playlist may be stale; force the client back to a fresh
            // manifest on its next pull.
            user.reset_progress(pl.id());
            return None;
        }

        debug!(seg_id = %seg.seg_id(), total, "serving segment");
        Some(stream_segment(seg, total))
    }

    /// Serve a tracked manifest. `None` means "fall back to plain proxying".
    async fn serve_playlist(&self, path_query: &str, req_opts: &UrlOptions) -> Option<Response> {
        let mut opts = req_opts.clone();

        // The playlist id hashes the canonical proxy form of the upstream
        // URL, independent of who is asking.
        let canonical = {
            let normalized = opts.normalized();
            format!("/{}{}", normalized.option_path(), path_query)
        };
        let playlist_id = match &opts.hls_playlist {
            Some(id) => id.clone(),
            None => {
                let id = short_hash(&canonical);
                opts.hls_playlist = Some(id.clone());
                id
            }
        };
        let mut new_user = false;
        let user_id = match &opts.hls_user {
            Some(id) => id.clone(),
            None => {
                let id = gen_user_id();
                opts.hls_user = Some(id.clone());
                new_user = true;
                id
            }
        };
        let user = self.mgr.user(&user_id);

        if let Some(pl) = self.mgr.playlist(&playlist_id) {
            let m3 = user.get_m3u8(&pl);
            debug!(user = %user_id, playlist = %playlist_id, "serving tracked manifest");
            let body = if new_user {
                variant_injection(path_query, &opts)
            } else {
                media_to_bytes(&rewrite_media(&m3, pl.uri().path(), &opts))
            };
            return Some(manifest_response(body));
        }

        // Unknown playlist: sniff the upstream to see what this URL is.
        let upstream = opts.upstream_url(path_query)?;
        let (final_url, body) = match self.net.get_bytes(upstream, None, Some(&self.hook)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(path = %path_query, error = %e, "sniffing failed");
                return None;
            }
        };
        let manifest = match Manifest::parse(&body) {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path_query, error = %e, "not a manifest, serving as-is");
                return Some(bytes_response(body));
            }
        };

        if manifest.is_master() {
            // Masters carry no media; rewriting their entries (with the
            // user marker already in `opts`) is all the tracking needed.
            let body = match &manifest {
                Manifest::Master(m) => master_to_bytes(&rewrite_master(m, final_url.path(), &opts)),
                Manifest::Media(m) => media_to_bytes(&rewrite_media(m, final_url.path(), &opts)),
            };
            return Some(manifest_response(body));
        }

        match manifest {
            Manifest::Master(_) => None,
            Manifest::Media(media) => {
                let cache_dir = match self.cache_dirs.playlist_dir(&playlist_id) {
                    Ok(dir) => dir,
                    Err(e) => {
                        error!(playlist = %playlist_id, error = %e, "cache dir unavailable");
                        return None;
                    }
                };
                let mut reg_opts = opts.normalized();
                reg_opts.scheme = Some(final_url.scheme().to_string());
                reg_opts.host = Some(host_with_port(&final_url));

                let candidate = Playlist::new(
                    playlist_id.clone(),
                    final_url.clone(),
                    reg_opts,
                    self.net.clone(),
                    Some(self.hook.clone()),
                    cache_dir,
                );
                candidate.init(media);

                // Someone else may be registering the same playlist right
                // now; exactly one instance keeps its run loop.
                let (pl, added) = self.mgr.get_or_add_playlist(candidate.clone());
                if added {
                    info!(playlist = %playlist_id, url = %final_url, "tracking new playlist");
                } else {
                    candidate.shutdown();
                }

                // Associate user and playlist so the tidy loop keeps both.
                let m3 = user.get_m3u8(&pl);
                let body = if new_user {
                    variant_injection(path_query, &opts)
                } else {
                    media_to_bytes(&rewrite_media(&m3, final_url.path(), &opts))
                };
                Some(manifest_response(body))
            }
        }
    }

    /// Minimal plain forwarding of the upstream URL; the fallback branch of
    /// every boost path.
    async fn forward(
        &self,
        path_query: &str,
        opts: &UrlOptions,
        client_range: Option<&str>,
    ) -> Response {
        let Some(upstream) = opts.upstream_url(path_query) else {
            return text_response(StatusCode::BAD_GATEWAY, "no upstream host to forward to");
        };
        self.forward_url(upstream, client_range).await
    }

    async fn forward_url(&self, upstream: Url, client_range: Option<&str>) -> Response {
        let mut headers = Headers::new();
        if let Some(range) = client_range {
            headers.insert("Range", range);
        }
        match self
            .net
            .get_streaming(upstream, None, Some(headers), None)
            .await
        {
            Ok(resp) => {
                let mut builder = Response::builder()
                    .status(resp.status)
                    .header("Access-Control-Allow-Origin", "*");
                if let Some(len) = resp.content_length {
                    builder = builder.header("Content-Length", len);
                }
                if let Some(cr) = &resp.content_range {
                    builder = builder.header("Content-Range", cr);
                }
                let body = Body::from_stream(async_stream::stream! {
                    let mut stream = resp.stream;
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => yield Ok::<_, io::Error>(bytes),
                            Err(e) => {
                                yield Err(io::Error::other(e.to_string()));
                                break;
                            }
                        }
                    }
                });
                builder.body(body).unwrap_or_else(|_| gone())
            }
            Err(e) => text_response(StatusCode::BAD_GATEWAY, &format!("forward failed: {e}")),
        }
    }
}

/// Synthetic master manifest whose lone variant re-requests the same URL
/// with the (now user-stamped) markers attached.
fn variant_injection(path_query: &str, opts: &UrlOptions) -> Vec<u8> {
    let mut variant_opts = opts.clone();
    variant_opts.hls_boost = Some(true);
    variant_opts.hls_playlist = None;
    variant_opts.hls_segment = None;
    let uri = to_proxy_uri("/", path_query, &variant_opts);
    master_to_bytes(&variant_manifest(&uri))
}

fn stream_segment(seg: SegmentRef, total: Option<u64>) -> Response {
    let cancel = CancellationToken::new();
    let body = Body::from_stream(async_stream::stream! {
        let mut buf = vec![0u8; 8 * 1024];
        let mut off: u64 = 0;
        loop {
            match seg.read_at(&cancel, &mut buf, off).await {
                Ok(0) => break,
                Ok(n) => {
                    off += n as u64;
                    yield Ok::<_, io::Error>(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    error!(seg_id = %seg.seg_id(), error = %e, "segment read failed");
                    yield Err(io::Error::other(e.to_string()));
                    break;
                }
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Content-Type", "application/octet-stream");
    if let Some(total) = total {
        builder = builder.header("Content-Length", total);
    }
    builder.body(body).unwrap_or_else(|_| gone())
}

fn manifest_response(body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", MANIFEST_CONTENT_TYPE)
        .header("Content-Length", body.len())
        .header("Cache-Control", "no-store, no-cache, must-revalidate")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(body))
        .unwrap_or_else(|_| gone())
}

fn bytes_response(body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", body.len())
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(body))
        .unwrap_or_else(|_| gone())
}

fn text_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| gone())
}

fn gone() -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::GONE;
    resp
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

async fn route(State(svc): State<BoostService>, req: Request) -> Response {
    svc.handle(req).await
}

/// Router exposing the boost service; every path is handled, markers decide
/// the behavior.
pub fn boost_router(svc: BoostService) -> Router {
    Router::new().fallback(route).with_state(svc)
}
