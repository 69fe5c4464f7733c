use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

/// Characters escaped inside a `Key=value` path segment.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'=');

/// Marker keys recognized in request paths.
pub mod keys {
    pub const HOST: &str = "Host";
    pub const SCHEME: &str = "Scheme";
    pub const HLS_BOOST: &str = "HLSBoost";
    pub const HLS_SKIP: &str = "HLSSkip";
    pub const HLS_SHORT_URL: &str = "HLSShortUrl";
    pub const HLS_PREFETCHES: &str = "HLSPrefetches";
    pub const HLS_TIMEOUT_MS: &str = "HLSTimeoutMs";
    pub const HLS_PLAYLIST: &str = "HLSPlaylist";
    pub const HLS_USER: &str = "HLSUser";
    pub const HLS_SEGMENT: &str = "HLSSegment";
    pub const ANT_PIECE_SIZE: &str = "AntPieceSize";
    pub const ANT_CONCURRENT_PIECES: &str = "AntConcurrentPieces";
}

/// URL option markers carried as `Key=value` path segments on rewritten
/// URLs. These route follow-up client requests back through the proxy and
/// tune per-playlist behavior.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UrlOptions {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub hls_boost: Option<bool>,
    pub hls_skip: Option<bool>,
    pub hls_short_url: Option<bool>,
    pub hls_prefetches: Option<i64>,
    pub hls_timeout_ms: Option<u64>,
    pub hls_playlist: Option<String>,
    pub hls_user: Option<String>,
    pub hls_segment: Option<String>,
    pub ant_piece_size: Option<u64>,
    pub ant_concurrent_pieces: Option<usize>,
}

impl UrlOptions {
    /// Split recognized markers out of a request path. Returns the path with
    /// marker segments removed (leading slash preserved) and the parsed
    /// options. Unrecognized segments stay in the path untouched.
    pub fn extract(path: &str) -> (String, UrlOptions) {
        let mut opts = UrlOptions::default();
        let mut rest: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            if !opts.apply_segment(segment) {
                rest.push(segment);
            }
        }
        let mut clean = rest.join("/");
        if path.starts_with('/') && !clean.starts_with('/') {
            clean.insert(0, '/');
        }
        if clean.is_empty() {
            clean.push('/');
        }
        (clean, opts)
    }

    fn apply_segment(&mut self, segment: &str) -> bool {
        let Some((key, raw)) = segment.split_once('=') else {
            return false;
        };
        let Ok(value) = percent_decode_str(raw).decode_utf8() else {
            return false;
        };
        let value = value.into_owned();
        match key {
            keys::HOST => self.host = Some(value),
            keys::SCHEME => self.scheme = Some(value),
            keys::HLS_BOOST => self.hls_boost = parse_bool(&value),
            keys::HLS_SKIP => self.hls_skip = parse_bool(&value),
            keys::HLS_SHORT_URL => self.hls_short_url = parse_bool(&value),
            keys::HLS_PREFETCHES => self.hls_prefetches = value.parse().ok(),
            keys::HLS_TIMEOUT_MS => self.hls_timeout_ms = value.parse().ok(),
            keys::HLS_PLAYLIST => self.hls_playlist = Some(value),
            keys::HLS_USER => self.hls_user = Some(value),
            keys::HLS_SEGMENT => self.hls_segment = Some(value),
            keys::ANT_PIECE_SIZE => self.ant_piece_size = value.parse().ok(),
            keys::ANT_CONCURRENT_PIECES => self.ant_concurrent_pieces = value.parse().ok(),
            _ => return false,
        }
        true
    }

    /// Render the set markers as sorted `Key=value` path segments.
    pub fn path_segments(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut push = |key: &str, value: String| {
            let escaped = utf8_percent_encode(&value, SEGMENT_ESCAPE).to_string();
            out.push(format!("{key}={escaped}"));
        };
        if let Some(v) = &self.host {
            push(keys::HOST, v.clone());
        }
        if let Some(v) = &self.scheme {
            push(keys::SCHEME, v.clone());
        }
        if let Some(v) = self.hls_boost {
            push(keys::HLS_BOOST, v.to_string());
        }
        if let Some(v) = self.hls_skip {
            push(keys::HLS_SKIP, v.to_string());
        }
        if let Some(v) = self.hls_short_url {
            push(keys::HLS_SHORT_URL, v.to_string());
        }
        if let Some(v) = self.hls_prefetches {
            push(keys::HLS_PREFETCHES, v.to_string());
        }
        if let Some(v) = self.hls_timeout_ms {
            push(keys::HLS_TIMEOUT_MS, v.to_string());
        }
        if let Some(v) = &self.hls_playlist {
            push(keys::HLS_PLAYLIST, v.clone());
        }
        if let Some(v) = &self.hls_user {
            push(keys::HLS_USER, v.clone());
        }
        if let Some(v) = &self.hls_segment {
            push(keys::HLS_SEGMENT, v.clone());
        }
        if let Some(v) = self.ant_piece_size {
            push(keys::ANT_PIECE_SIZE, v.to_string());
        }
        if let Some(v) = self.ant_concurrent_pieces {
            push(keys::ANT_CONCURRENT_PIECES, v.to_string());
        }
        out.sort();
        out
    }

    /// Render markers as one `/`-joined path prefix (no leading slash).
    pub fn option_path(&self) -> String {
        self.path_segments().join("/")
    }

    /// Copy with routing identifiers cleared. Used when hashing a playlist
    /// URL so the id does not depend on who is asking.
    pub fn normalized(&self) -> UrlOptions {
        let mut o = self.clone();
        o.hls_boost = None;
        o.hls_playlist = None;
        o.hls_user = None;
        o.hls_segment = None;
        o
    }

    /// Rebuild the absolute upstream URL for a marker-free path, using the
    /// `Scheme`/`Host` markers. `None` without a host.
    pub fn upstream_url(&self, path_and_query: &str) -> Option<Url> {
        let host = self.host.as_deref()?;
        let scheme = self.scheme.as_deref().unwrap_or("http");
        Url::parse(&format!("{scheme}://{host}{path_and_query}")).ok()
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pulls_markers_and_keeps_the_rest() {
        let (path, opts) = UrlOptions::extract(
            "/Host=cdn.example.com/Scheme=https/HLSBoost=true/live/stream.m3u8",
        );
        assert_eq!(path, "/live/stream.m3u8");
        assert_eq!(opts.host.as_deref(), Some("cdn.example.com"));
        assert_eq!(opts.scheme.as_deref(), Some("https"));
        assert_eq!(opts.hls_boost, Some(true));
        assert_eq!(opts.hls_user, None);
    }

    #[test]
    fn extract_handles_short_urls() {
        let (path, opts) = UrlOptions::extract("/HLSUser=u1/HLSPlaylist=p1/HLSSegment=s1");
        assert_eq!(path, "/");
        assert_eq!(opts.hls_user.as_deref(), Some("u1"));
        assert_eq!(opts.hls_playlist.as_deref(), Some("p1"));
        assert_eq!(opts.hls_segment.as_deref(), Some("s1"));
    }

    #[test]
    fn path_segments_are_sorted_and_roundtrip() {
        let mut opts = UrlOptions::default();
        opts.host = Some("cdn.example.com".into());
        opts.hls_boost = Some(true);
        opts.ant_piece_size = Some(524288);
        let segments = opts.path_segments();
        let mut sorted = segments.clone();
        sorted.sort();
        assert_eq!(segments, sorted);

        let path = format!("/{}/live.m3u8", opts.option_path());
        let (clean, parsed) = UrlOptions::extract(&path);
        assert_eq!(clean, "/live.m3u8");
        assert_eq!(parsed, opts);
    }

    #[test]
    fn values_are_percent_escaped() {
        let mut opts = UrlOptions::default();
        opts.hls_segment = Some("a/b c".into());
        let seg = &opts.path_segments()[0];
        assert!(!seg[seg.find('=').unwrap() + 1..].contains('/'), "{seg}");
        let (_, parsed) = UrlOptions::extract(&format!("/{seg}"));
        assert_eq!(parsed.hls_segment.as_deref(), Some("a/b c"));
    }

    #[test]
    fn upstream_url_requires_host() {
        let (_, opts) = UrlOptions::extract("/live.m3u8");
        assert!(opts.upstream_url("/live.m3u8").is_none());

        let (_, opts) = UrlOptions::extract("/Host=origin:8080/live.m3u8");
        let url = opts.upstream_url("/live.m3u8").unwrap();
        assert_eq!(url.as_str(), "http://origin:8080/live.m3u8");
    }

    #[test]
    fn normalized_clears_routing_ids() {
        let (_, opts) = UrlOptions::extract(
            "/Host=o/HLSBoost=true/HLSUser=u/HLSPlaylist=p/HLSSegment=s/x.ts",
        );
        let n = opts.normalized();
        assert_eq!(n.host.as_deref(), Some("o"));
        assert!(n.hls_boost.is_none());
        assert!(n.hls_user.is_none());
        assert!(n.hls_playlist.is_none());
        assert!(n.hls_segment.is_none());
    }
}
