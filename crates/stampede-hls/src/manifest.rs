use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};

use crate::error::{HlsError, HlsResult};

const M3U8_HEADER: &[u8] = b"#EXTM3U";

/// Cheap sniff used before committing to a full parse.
pub fn looks_like_m3u8(bytes: &[u8]) -> bool {
    bytes.starts_with(M3U8_HEADER)
}

/// A parsed manifest, master or media.
#[derive(Clone, Debug)]
pub enum Manifest {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

impl Manifest {
    /// Sniff, parse and validate a manifest body.
    pub fn parse(bytes: &[u8]) -> HlsResult<Manifest> {
        if !looks_like_m3u8(bytes) {
            return Err(HlsError::NotManifest);
        }
        let parsed = m3u8_rs::parse_playlist_res(bytes)
            .map_err(|e| HlsError::ManifestParse(e.to_string()))?;
        match parsed {
            Playlist::MasterPlaylist(m) => Ok(Manifest::Master(m)),
            Playlist::MediaPlaylist(m) => {
                validate_media(&m)?;
                Ok(Manifest::Media(m))
            }
        }
    }

    /// Whether this manifest enumerates other playlists rather than media.
    ///
    /// Besides the obvious master case, a "media" playlist whose entries all
    /// have zero duration is a master in disguise (some origins emit variant
    /// lists without `#EXT-X-STREAM-INF`).
    pub fn is_master(&self) -> bool {
        match self {
            Manifest::Master(_) => true,
            Manifest::Media(m) => m.segments.iter().any(|s| s.duration <= 0.0),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing to a Vec cannot fail.
        let res = match self {
            Manifest::Master(m) => m.write_to(&mut out),
            Manifest::Media(m) => m.write_to(&mut out),
        };
        debug_assert!(res.is_ok());
        out
    }
}

fn validate_media(m: &MediaPlaylist) -> HlsResult<()> {
    let zero = m.segments.iter().filter(|s| s.duration <= 0.0).count();
    if zero > 0 && zero < m.segments.len() {
        return Err(HlsError::MixedManifest);
    }
    Ok(())
}

/// Serialize a media playlist (helper for view responses).
pub fn media_to_bytes(m: &MediaPlaylist) -> Vec<u8> {
    let mut out = Vec::new();
    let res = m.write_to(&mut out);
    debug_assert!(res.is_ok());
    out
}

/// Serialize a master playlist.
pub fn master_to_bytes(m: &MasterPlaylist) -> Vec<u8> {
    let mut out = Vec::new();
    let res = m.write_to(&mut out);
    debug_assert!(res.is_ok());
    out
}
