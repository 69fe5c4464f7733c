use m3u8_rs::{MasterPlaylist, MediaPlaylist, SessionDataField, VariantStream};
use url::Url;

use crate::{ids::short_hash, options::UrlOptions};

/// Bandwidth advertised on the synthetic variant; players only need a
/// plausible value to pick the lone entry.
const VARIANT_BANDWIDTH: u64 = 2_000_000;

/// Convert `uri` into a proxy-relative path carrying `opts` as markers.
///
/// Absolute URLs move their scheme/host into `Scheme=`/`Host=` markers;
/// relative ones are first resolved against the directory of
/// `relative_to` (a proxy-relative path). Unparsable URIs pass through
/// untouched.
pub fn to_proxy_uri(relative_to: &str, uri: &str, opts: &UrlOptions) -> String {
    if uri.is_empty() {
        return String::new();
    }
    match Url::parse(uri) {
        Ok(abs) => {
            let mut opts = opts.clone();
            opts.scheme = Some(abs.scheme().to_string());
            let Some(host) = abs.host_str() else {
                return uri.to_string();
            };
            let host = match abs.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            opts.host = Some(host);
            let query = abs.query().map(|q| format!("?{q}")).unwrap_or_default();
            format!("/{}{}{}", opts.option_path(), abs.path(), query)
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut path = uri.to_string();
            if !path.starts_with('/') {
                if let Some(pos) = relative_to.rfind('/') {
                    path = format!("{}{}", &relative_to[..pos + 1], path);
                }
            }
            let opt_path = opts.option_path();
            if opt_path.is_empty() {
                return path;
            }
            if let Some(rest) = path.strip_prefix('/') {
                format!("/{opt_path}/{rest}")
            } else {
                format!("{opt_path}/{path}")
            }
        }
        Err(_) => uri.to_string(),
    }
}

/// Rewrite a master playlist so every referenced URI re-enters the proxy.
/// Variant entries get the boost marker; auxiliary URIs are re-pointed
/// without it.
pub fn rewrite_master(m3: &MasterPlaylist, parent_uri: &str, opts: &UrlOptions) -> MasterPlaylist {
    let mut out = m3.clone();

    let mut variant_opts = opts.clone();
    variant_opts.hls_boost = Some(true);
    variant_opts.hls_playlist = None;
    variant_opts.hls_segment = None;

    for variant in &mut out.variants {
        variant.uri = to_proxy_uri(parent_uri, &variant.uri, &variant_opts);
    }
    for alternative in &mut out.alternatives {
        if let Some(uri) = &mut alternative.uri {
            *uri = to_proxy_uri(parent_uri, uri, opts);
        }
    }
    for data in &mut out.session_data {
        if let SessionDataField::Uri(uri) = &mut data.field {
            *uri = to_proxy_uri(parent_uri, uri, opts);
        }
    }
    for key in &mut out.session_key {
        if let Some(uri) = &mut key.0.uri {
            *uri = to_proxy_uri(parent_uri, uri, opts);
        }
    }
    out
}

/// Rewrite a media playlist. Real segments are stamped with their id (and
/// optionally shortened); zero-duration entries are nested playlists in
/// disguise and get the boost marker instead.
pub fn rewrite_media(m3: &MediaPlaylist, parent_uri: &str, opts: &UrlOptions) -> MediaPlaylist {
    let mut out = m3.clone();
    for segment in &mut out.segments {
        if let Some(key) = &mut segment.key {
            if let Some(uri) = &mut key.uri {
                *uri = to_proxy_uri(parent_uri, uri, opts);
            }
        }
        if let Some(map) = &mut segment.map {
            map.uri = to_proxy_uri(parent_uri, &map.uri, opts);
        }

        let mut seg_opts = opts.clone();
        if segment.duration > 0.0 {
            seg_opts.hls_boost = None;
            seg_opts.hls_segment = Some(short_hash(&segment.uri));
            if seg_opts.hls_short_url == Some(true) {
                segment.uri = short_segment_url(&seg_opts);
                continue;
            }
        } else {
            seg_opts.hls_boost = Some(true);
            seg_opts.hls_playlist = None;
            seg_opts.hls_segment = None;
        }
        segment.uri = to_proxy_uri(parent_uri, &segment.uri, &seg_opts);
    }
    out
}

/// Short form that routes through any proxy instance still holding the
/// playlist, without repeating the upstream URI.
fn short_segment_url(opts: &UrlOptions) -> String {
    let mut short = UrlOptions::default();
    short.hls_user = opts.hls_user.clone();
    short.hls_playlist = opts.hls_playlist.clone();
    short.hls_segment = opts.hls_segment.clone();
    format!("/{}", short.option_path())
}

/// Synthetic single-variant master pointing back at `uri`.
///
/// Served to brand-new clients so that the follow-up variant request (and
/// every segment pull after it) carries the tracking markers.
pub fn variant_manifest(uri: &str) -> MasterPlaylist {
    MasterPlaylist {
        variants: vec![VariantStream {
            uri: uri.to_string(),
            bandwidth: VARIANT_BANDWIDTH,
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use crate::manifest::Manifest;

    use super::*;

    fn opts_with_user() -> UrlOptions {
        let mut opts = UrlOptions::default();
        opts.hls_user = Some("u1".into());
        opts.hls_playlist = Some("p1".into());
        opts
    }

    #[test]
    fn absolute_uris_move_host_into_markers() {
        let out = to_proxy_uri(
            "/live/stream.m3u8",
            "https://cdn.example.com:8443/seg/1.ts?tok=a",
            &UrlOptions::default(),
        );
        assert_eq!(out, "/Host=cdn.example.com:8443/Scheme=https/seg/1.ts?tok=a");

        let (clean, parsed) = UrlOptions::extract("/Host=cdn.example.com:8443/Scheme=https/seg/1.ts");
        assert_eq!(clean, "/seg/1.ts");
        assert_eq!(parsed.host.as_deref(), Some("cdn.example.com:8443"));
        assert_eq!(parsed.scheme.as_deref(), Some("https"));
    }

    #[test]
    fn relative_uris_resolve_against_the_parent() {
        let mut opts = UrlOptions::default();
        opts.hls_user = Some("u1".into());
        let out = to_proxy_uri("/live/stream.m3u8", "seg-1.ts", &opts);
        assert_eq!(out, "/HLSUser=u1/live/seg-1.ts");

        let out = to_proxy_uri("/live/stream.m3u8", "/abs/seg-1.ts", &opts);
        assert_eq!(out, "/HLSUser=u1/abs/seg-1.ts");
    }

    #[test]
    fn media_segments_are_stamped_with_ids() {
        let media = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXTINF:4.0,\nseg-7.ts\n\
#EXTINF:4.0,\nseg-8.ts\n";
        let Manifest::Media(m3) = Manifest::parse(media.as_bytes()).unwrap() else {
            panic!("expected media playlist");
        };
        let mut opts = opts_with_user();
        opts.hls_boost = Some(true);

        let out = rewrite_media(&m3, "/live/stream.m3u8", &opts);
        let first = &out.segments[0].uri;
        assert!(
            first.contains(&format!("HLSSegment={}", short_hash("seg-7.ts"))),
            "{first}"
        );
        assert!(!first.contains("HLSBoost"), "{first}");
        assert!(first.contains("HLSUser=u1"), "{first}");
        assert!(first.ends_with("/live/seg-7.ts"), "{first}");
        // Segment ids differ per segment.
        assert_ne!(out.segments[0].uri, out.segments[1].uri);
    }

    #[test]
    fn short_urls_drop_the_upstream_path() {
        let media = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\nseg-7.ts\n";
        let Manifest::Media(m3) = Manifest::parse(media.as_bytes()).unwrap() else {
            panic!("expected media playlist");
        };
        let mut opts = opts_with_user();
        opts.hls_short_url = Some(true);

        let out = rewrite_media(&m3, "/live/stream.m3u8", &opts);
        let uri = &out.segments[0].uri;
        assert_eq!(
            uri,
            &format!(
                "/HLSPlaylist=p1/HLSSegment={}/HLSUser=u1",
                short_hash("seg-7.ts")
            )
        );
    }

    #[test]
    fn master_variants_get_the_boost_marker() {
        let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1280000\n\
low/stream.m3u8\n";
        let Manifest::Master(m3) = Manifest::parse(master.as_bytes()).unwrap() else {
            panic!("expected master playlist");
        };
        let out = rewrite_master(&m3, "/tv/master.m3u8", &opts_with_user());
        let uri = &out.variants[0].uri;
        assert!(uri.contains("HLSBoost=true"), "{uri}");
        assert!(uri.contains("HLSUser=u1"), "{uri}");
        assert!(!uri.contains("HLSPlaylist"), "{uri}");
        assert!(uri.ends_with("/tv/low/stream.m3u8"), "{uri}");
    }

    #[test]
    fn variant_manifest_has_one_tracked_entry() {
        let m3 = variant_manifest("/HLSBoost=true/HLSUser=u1/live/stream.m3u8");
        assert_eq!(m3.variants.len(), 1);
        assert_eq!(m3.variants[0].bandwidth, VARIANT_BANDWIDTH);
        let bytes = crate::manifest::master_to_bytes(&m3);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("#EXT-X-STREAM-INF"), "{text}");
        assert!(text.contains("/HLSBoost=true/HLSUser=u1/live/stream.m3u8"), "{text}");
    }
}
