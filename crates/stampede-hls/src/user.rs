use std::{
    collections::HashMap,
    ops::Deref,
    sync::Arc,
    time::{Duration, Instant},
};

use m3u8_rs::MediaPlaylist;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    playlist::{PlaylistRef, PrefetchHandle},
    segment::SegmentRef,
};

/// Manifest items handed out per progress-based view.
const VIEW_ITEMS: usize = 10;

/// Media time held back from a client's very first manifest pull.
const PRESERVED_DURATION_SECS: f64 = 20.0;
/// ...but never serve fewer than this many items.
const MIN_FIRST_PULL_ITEMS: usize = 3;

/// Prefetch window by watch time: short at first (channel zapping is
/// common), growing once the client sticks around.
fn prefetch_window_secs(watched: Duration) -> u32 {
    if watched < Duration::from_secs(30) {
        15
    } else if watched < Duration::from_secs(3 * 60) {
        20
    } else {
        30
    }
}

/// Per-(user, playlist) playback tracking.
struct UserStream {
    user_id: String,
    pl: Option<PlaylistRef>,
    latest_seq: Option<u64>,
    start_time: Instant,
    last_time: Instant,
    prefetch_dur_secs: u32,
    prefetch_handle: Option<PrefetchHandle>,
}

impl UserStream {
    fn new(user_id: String) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            pl: None,
            latest_seq: None,
            start_time: now,
            last_time: now,
            prefetch_dur_secs: 0,
            prefetch_handle: None,
        }
    }

    /// Record activity at `seq` (or a plain keep-alive with the current
    /// progress) and refresh the prefetch intent when anything changed.
    fn update(&mut self, seq: Option<u64>) {
        self.last_time = Instant::now();
        let window = prefetch_window_secs(self.start_time.elapsed());
        let mut refresh = false;
        if self.prefetch_dur_secs != window {
            self.prefetch_dur_secs = window;
            refresh = true;
            if let Some(pl) = &self.pl {
                info!(
                    user = %self.user_id,
                    playlist = %pl.id(),
                    window,
                    "prefetch window changed"
                );
            }
        }
        if let Some(seq) = seq {
            if self.latest_seq.is_none_or(|cur| seq > cur) {
                self.latest_seq = Some(seq);
                refresh = true;
            }
        }
        if refresh {
            if let Some(seq) = self.latest_seq {
                self.start_prefetch(seq);
            }
        }
    }

    fn start_prefetch(&mut self, seq: u64) {
        let Some(pl) = &self.pl else { return };
        if let Some(handle) = self.prefetch_handle.take() {
            pl.stop_prefetch(handle);
        }
        self.prefetch_handle = pl.prefetch(seq, f64::from(self.prefetch_dur_secs));
        debug!(
            user = %self.user_id,
            playlist = %pl.id(),
            seq,
            window = self.prefetch_dur_secs,
            "prefetch intent updated"
        );
    }

    fn set_playlist(&mut self, pl: Option<PlaylistRef>) {
        match (&self.pl, &pl) {
            (Some(cur), Some(new)) if cur.id() == new.id() => return,
            (None, None) => return,
            _ => {}
        }
        if let Some(old) = self.pl.take() {
            if let Some(handle) = self.prefetch_handle.take() {
                old.stop_prefetch(handle);
            }
        }
        self.pl = pl;
        if self.pl.is_some() {
            if let Some(seq) = self.latest_seq {
                self.start_prefetch(seq);
            }
        }
    }
}

/// Hold back the most recent segments from a first-time manifest pull.
///
/// Players tend to start from the second- or third-to-last segment, which
/// leaves the proxy almost no slack before the client falls off the live
/// edge. Serving a slightly older tail buys catch-up time.
fn preserve_recent_segments(m3: &mut MediaPlaylist) {
    let mut cut: Option<usize> = None;
    let mut sum = 0.0f64;
    for i in (0..m3.segments.len()).rev() {
        sum += f64::from(m3.segments[i].duration);
        if sum >= PRESERVED_DURATION_SECS {
            cut = Some(i);
            break;
        }
    }
    let cut = cut.unwrap_or(0).max(MIN_FIRST_PULL_ITEMS);
    if cut < m3.segments.len() {
        m3.segments.truncate(cut);
    }
}

struct UserState {
    /// playlist id -> stream.
    streams: HashMap<String, UserStream>,
    interests: usize,
}

/// One tracked client and its per-playlist streams.
pub struct User {
    id: String,
    state: Mutex<UserState>,
}

impl User {
    pub(crate) fn new(id: String) -> Arc<User> {
        Arc::new(User {
            id,
            state: Mutex::new(UserState {
                streams: HashMap::new(),
                interests: 0,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Progress-based manifest view for this user, creating the stream on
    /// first contact. A first pull holds recent segments back.
    pub fn get_m3u8(&self, pl: &PlaylistRef) -> MediaPlaylist {
        let mut state = self.state.lock();
        let stream = state
            .streams
            .entry(pl.id().to_string())
            .or_insert_with(|| {
                info!(user = %self.id, playlist = %pl.id(), "user starts watching");
                UserStream::new(self.id.clone())
            });
        stream.set_playlist(Some(pl.clone()));
        let latest = stream.latest_seq;
        stream.update(latest);

        let mut m3 = pl.segments_from(latest, VIEW_ITEMS);
        if latest.is_none() {
            preserve_recent_segments(&mut m3);
        }
        m3
    }

    /// Look up a segment and record the playback progress it implies.
    pub fn get_segment(&self, pl: &PlaylistRef, seg_id: &str) -> Option<SegmentRef> {
        let mut state = self.state.lock();
        let seg = pl.get_segment(seg_id)?;
        match state.streams.get_mut(pl.id()) {
            Some(stream) => stream.update(Some(seg.seq())),
            None => warn!(
                user = %self.id,
                playlist = %pl.id(),
                seg_id,
                "segment fetched before the playlist"
            ),
        }
        Some(seg)
    }

    /// Forget playback progress so the next manifest pull re-syncs to the
    /// live edge. Called after upstream segment failures.
    pub fn reset_progress(&self, playlist_id: &str) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(playlist_id) {
            stream.latest_seq = None;
        }
    }

    /// Evict streams idle longer than `timeout`; report whether the user is
    /// still worth keeping.
    pub fn check_active(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let user = &self.id;
        state.streams.retain(|pid, stream| {
            if stream.last_time.elapsed() > timeout {
                stream.set_playlist(None);
                info!(user = %user, playlist = %pid, "stream idle, stopped watching");
                false
            } else {
                true
            }
        });
        state.interests > 0 || !state.streams.is_empty()
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> UserRef {
        self.state.lock().interests += 1;
        UserRef { user: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.interests == 0 {
            warn!(user = %self.id, "user reference count underflow");
            return;
        }
        state.interests -= 1;
    }
}

/// Counted reference to a [`User`].
pub struct UserRef {
    user: Arc<User>,
}

impl Deref for UserRef {
    type Target = User;

    fn deref(&self) -> &User {
        &self.user
    }
}

impl Clone for UserRef {
    fn clone(&self) -> Self {
        self.user.acquire()
    }
}

impl Drop for UserRef {
    fn drop(&mut self) {
        self.user.release();
    }
}
