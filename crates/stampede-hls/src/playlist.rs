use std::{
    ops::Deref,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use m3u8_rs::{MediaPlaylist, MediaSegment};
use parking_lot::Mutex;
use stampede_ant::Status;
use stampede_net::{HttpClient, RequestHook};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{HlsError, HlsResult},
    ids::short_hash,
    manifest::Manifest,
    options::UrlOptions,
    segment::{Segment, SegmentRef},
};

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;
const MAX_UPDATE_INTERVAL_SECS: u64 = 10;
// libmpv asks for two segments at once and consumes neither until both
// produce data, so anything below 2 concurrent prefetches stalls startup.
const DEFAULT_MAX_PREFETCHES: i64 = 3;
const UPDATE_ATTEMPTS: usize = 3;

/// Never shrink the window below this many items.
const MIN_RETAINED_SEGMENTS: usize = 10;
/// Always retain this many segments before the earliest prefetch intent.
const KEEP_BEFORE_INTENT: u64 = 5;

/// A stream's request that segments following `start_from_seq` be prefetched
/// up to `duration_sec` of cumulative media time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrefetchIntent {
    pub start_from_seq: u64,
    pub duration_sec: f64,
}

/// Opaque handle identifying one registered [`PrefetchIntent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchHandle(u64);

struct PlState {
    /// Manifest window; `segments` below stays index-aligned with
    /// `m3.segments` at all times.
    m3: MediaPlaylist,
    segments: Vec<Arc<Segment>>,
    prefetches: Vec<(u64, PrefetchIntent)>,
    next_handle: u64,
    interests: usize,
}

/// One tracked live playlist: periodic upstream refresh, the segment window,
/// prefetch scheduling and cache shrinking.
pub struct Playlist {
    id: String,
    uri: Url,
    opts: UrlOptions,
    net: HttpClient,
    hook: Option<RequestHook>,
    cache_dir: PathBuf,
    fetch_timeout: Duration,
    max_prefetches: i64,
    update_interval_secs: AtomicU32,
    cancel: CancellationToken,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
    state: Mutex<PlState>,
}

impl Playlist {
    pub fn new(
        id: String,
        uri: Url,
        opts: UrlOptions,
        net: HttpClient,
        hook: Option<RequestHook>,
        cache_dir: PathBuf,
    ) -> Arc<Playlist> {
        let fetch_timeout =
            Duration::from_millis(opts.hls_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS));
        let max_prefetches = opts.hls_prefetches.unwrap_or(DEFAULT_MAX_PREFETCHES);
        let (notify_tx, notify_rx) = mpsc::channel(1);
        Arc::new(Playlist {
            id,
            uri,
            opts,
            net,
            hook,
            cache_dir,
            fetch_timeout,
            max_prefetches,
            update_interval_secs: AtomicU32::new(MAX_UPDATE_INTERVAL_SECS as u32),
            cancel: CancellationToken::new(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            state: Mutex::new(PlState {
                m3: MediaPlaylist::default(),
                segments: Vec::new(),
                prefetches: Vec::new(),
                next_handle: 0,
                interests: 0,
            }),
        })
    }

    /// Install the first manifest snapshot and start the run loop.
    pub fn init(self: &Arc<Self>, m3: MediaPlaylist) {
        {
            let mut state = self.state.lock();
            self.reset_locked(&mut state, m3);
        }
        let pl = self.clone();
        tokio::spawn(run_loop(pl));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn max_prefetches(&self) -> i64 {
        self.max_prefetches
    }

    #[cfg(test)]
    fn update_interval_secs(&self) -> u32 {
        self.update_interval_secs.load(Ordering::Relaxed)
    }

    /// (first sequence, window length) snapshot.
    pub fn window(&self) -> (u64, usize) {
        let state = self.state.lock();
        (state.m3.media_sequence, state.segments.len())
    }

    /// Stop the run loop without touching segments; used when this instance
    /// loses the registration race or the process shuts down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Newest `count` items as a standalone manifest view.
    pub fn newest_segments(&self, count: usize) -> MediaPlaylist {
        let state = self.state.lock();
        Self::newest_locked(&state, count)
    }

    fn newest_locked(state: &PlState, count: usize) -> MediaPlaylist {
        let mut pl = state.m3.clone();
        if pl.segments.len() > count {
            let off = pl.segments.len() - count;
            pl.segments.drain(..off);
            pl.media_sequence += off as u64;
        }
        pl
    }

    /// Up to `count` items starting at `seq`; out-of-window requests (and
    /// `None`) fall back to the newest `count` items.
    pub fn segments_from(&self, seq: Option<u64>, count: usize) -> MediaPlaylist {
        let state = self.state.lock();
        let Some(seq) = seq else {
            return Self::newest_locked(&state, count);
        };
        let end = state.m3.media_sequence + state.m3.segments.len() as u64;
        if seq < state.m3.media_sequence || seq >= end {
            return Self::newest_locked(&state, count);
        }
        let off = (seq - state.m3.media_sequence) as usize;
        let tail = (off + count).min(state.m3.segments.len());
        let mut pl = state.m3.clone();
        pl.segments = pl.segments[off..tail].to_vec();
        pl.media_sequence += off as u64;
        pl
    }

    /// Look a segment up by id and acquire it. Linear scan over the live
    /// window; on an id collision the earlier entry wins.
    pub fn get_segment(&self, seg_id: &str) -> Option<SegmentRef> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .find(|s| s.seg_id() == seg_id)
            .map(|s| s.acquire())
    }

    /// Register a prefetch intent. `None` if `next_to_seq` is outside the
    /// current window.
    pub fn prefetch(&self, next_to_seq: u64, duration_sec: f64) -> Option<PrefetchHandle> {
        let mut state = self.state.lock();
        let end = state.m3.media_sequence + state.m3.segments.len() as u64;
        if next_to_seq < state.m3.media_sequence || next_to_seq >= end {
            return None;
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.prefetches.push((
            handle,
            PrefetchIntent {
                start_from_seq: next_to_seq,
                duration_sec,
            },
        ));
        let _ = self.notify_tx.try_send(());
        Some(PrefetchHandle(handle))
    }

    pub fn stop_prefetch(&self, handle: PrefetchHandle) {
        let mut state = self.state.lock();
        state.prefetches.retain(|(id, _)| *id != handle.0);
    }

    /// Destroy if nothing references this playlist and no segments remain.
    pub fn try_destroy(&self) -> HlsResult<()> {
        self.try_clear();
        let state = self.state.lock();
        if state.interests > 0 || !state.segments.is_empty() {
            return Err(HlsError::StillInUse);
        }
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
        }
        Ok(())
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> PlaylistRef {
        self.state.lock().interests += 1;
        PlaylistRef { pl: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.interests == 0 {
            warn!(playlist = %self.id, "playlist reference count underflow");
            return;
        }
        state.interests -= 1;
    }

    async fn update(&self) -> HlsResult<()> {
        let fetch = self
            .net
            .get_bytes(self.uri.clone(), None, self.hook.as_ref());
        let (_, body) = tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .map_err(|_| HlsError::FetchTimeout)??;
        match Manifest::parse(&body)? {
            Manifest::Master(_) => Err(HlsError::MasterPlaylist),
            Manifest::Media(m3) => {
                self.merge(m3);
                Ok(())
            }
        }
    }

    fn merge(&self, m3: MediaPlaylist) {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        let end1 = state.m3.media_sequence + state.m3.segments.len() as u64;
        let end2 = m3.media_sequence + m3.segments.len() as u64;
        if end1 >= end2 {
            if end1 - end2 > 3 {
                warn!(playlist = %self.id, end1, end2, "upstream returned a stale list");
            } else {
                debug!(playlist = %self.id, "no update");
            }
            return;
        }
        let tails = (end2 - end1) as usize;
        if tails > m3.segments.len() {
            warn!(
                playlist = %self.id,
                tails,
                size = m3.segments.len(),
                "lagging too far behind, resetting window"
            );
            self.reset_locked(&mut state, m3);
            return;
        }
        let news = m3.segments[m3.segments.len() - tails..].to_vec();
        self.append_items_locked(&mut state, news);
        info!(playlist = %self.id, added = tails, "appended new items");
    }

    fn append_items_locked(&self, state: &mut PlState, items: Vec<MediaSegment>) {
        let mut added = false;
        for item in items {
            let seq = state.m3.media_sequence + state.m3.segments.len() as u64;
            let seg_id = short_hash(&item.uri);
            let url = match self.uri.join(&item.uri) {
                Ok(u) => u,
                Err(e) => {
                    warn!(uri = %item.uri, error = %e, "skipping unresolvable segment uri");
                    continue;
                }
            };
            match Segment::new(
                seq,
                seg_id,
                url,
                &self.cache_dir,
                self.net.clone(),
                &self.opts,
                self.hook.clone(),
            ) {
                Ok(seg) => {
                    state.segments.push(seg);
                    state.m3.segments.push(item);
                    added = true;
                }
                Err(e) => {
                    warn!(uri = %item.uri, error = %e, "skipping segment");
                }
            }
        }
        if added {
            let _ = self.notify_tx.try_send(());
        }
    }

    fn reset_locked(&self, state: &mut PlState, m3: MediaPlaylist) {
        let interval = (m3.target_duration as u64)
            .saturating_mul(2)
            .clamp(1, MAX_UPDATE_INTERVAL_SECS) as u32;
        let previous = self.update_interval_secs.swap(interval, Ordering::Relaxed);
        if previous != interval {
            info!(playlist = %self.id, from = previous, to = interval, "update interval changed");
        }

        for seg in state.segments.drain(..) {
            let _ = seg.destroy(true);
        }
        let mut header = m3;
        let items = std::mem::take(&mut header.segments);
        state.m3 = header;
        self.append_items_locked(state, items);
    }

    /// Start downloads for segments wanted by the active intents, keeping at
    /// most `max_prefetches` in flight.
    fn try_prefetch(&self) {
        let state = self.state.lock();
        if self.cancel.is_cancelled() || self.max_prefetches <= 0 {
            return;
        }
        let max = self.max_prefetches as usize;
        let mut fetchings = state
            .segments
            .iter()
            .filter(|s| s.status().is_started())
            .count();
        if fetchings >= max {
            debug!(playlist = %self.id, fetchings, max, "prefetch cap reached");
            return;
        }

        let seq0 = state.m3.media_sequence;
        let len = state.segments.len();
        let mut pending: Vec<Arc<Segment>> = Vec::new();
        for (_, pf) in &state.prefetches {
            let mut idx = pf.start_from_seq as i64 - seq0 as i64;
            let mut dur = 0.0f64;
            while idx >= 0 && (idx as usize) < len && dur < pf.duration_sec {
                let i = idx as usize;
                let status = state.segments[i].status();
                // Retry failed segments, but not the one the client is
                // requesting right now (idx 0): too late to prefetch it.
                if status == Status::NotStarted || (i > 0 && status == Status::Aborted) {
                    pending.push(state.segments[i].clone());
                }
                dur += f64::from(state.m3.segments[i].duration);
                idx += 1;
            }
        }

        pending.sort_by_key(|s| s.seq());
        let mut last_seq = None;
        for seg in pending {
            if fetchings >= max {
                break;
            }
            // Intents overlap, so the list may contain duplicates.
            if last_seq == Some(seg.seq()) {
                continue;
            }
            last_seq = Some(seg.seq());
            if seg.prefetch() {
                seg.add_completion_listener(self.notify_tx.clone());
                fetchings += 1;
            }
        }
    }

    /// Drop segments behind the earliest prefetch intent, keeping
    /// [`KEEP_BEFORE_INTENT`] items of slack and never going below
    /// [`MIN_RETAINED_SEGMENTS`] items.
    fn try_shrink(&self) {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        let end = state.m3.media_sequence + state.m3.segments.len() as u64;
        let min_seq = state
            .prefetches
            .iter()
            .map(|(_, p)| p.start_from_seq)
            .min()
            .unwrap_or(end);
        let cut = (min_seq as i64)
            - (state.m3.media_sequence as i64)
            - (KEEP_BEFORE_INTENT as i64);
        let cut = cut.min(state.segments.len() as i64 - MIN_RETAINED_SEGMENTS as i64);
        if cut <= 0 {
            return;
        }
        Self::shrink_locked(&mut state, cut as usize);
    }

    fn shrink_locked(state: &mut PlState, max: usize) {
        let mut cnt = 0;
        for i in 0..max {
            // A still-referenced segment stops the sweep; everything after
            // it survives this round.
            if state.segments[i].destroy(false).is_err() {
                break;
            }
            cnt += 1;
        }
        state.segments.drain(..cnt);
        state.m3.segments.drain(..cnt);
        state.m3.media_sequence += cnt as u64;
    }

    fn try_clear(&self) {
        let mut state = self.state.lock();
        if state.interests > 0 {
            return;
        }
        let len = state.segments.len();
        Self::shrink_locked(&mut state, len);
    }
}

/// Counted reference to a [`Playlist`]; dropping releases the count.
pub struct PlaylistRef {
    pl: Arc<Playlist>,
}

impl Deref for PlaylistRef {
    type Target = Playlist;

    fn deref(&self) -> &Playlist {
        &self.pl
    }
}

impl Clone for PlaylistRef {
    fn clone(&self) -> Self {
        self.pl.acquire()
    }
}

impl Drop for PlaylistRef {
    fn drop(&mut self) {
        self.pl.release();
    }
}

/// Ticker-driven refresh loop with out-of-cycle prefetch wake-ups.
async fn run_loop(pl: Arc<Playlist>) {
    let Some(mut notify_rx) = pl.notify_rx.lock().take() else {
        return;
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let interval = Duration::from_secs(
                    u64::from(pl.update_interval_secs.load(Ordering::Relaxed)),
                );
                if last.is_some_and(|t| t.elapsed() < interval) {
                    continue;
                }
                last = Some(Instant::now());
                let pl = pl.clone();
                tokio::spawn(async move {
                    for attempt in 1..=UPDATE_ATTEMPTS {
                        match pl.update().await {
                            Ok(()) => {
                                pl.try_shrink();
                                pl.try_prefetch();
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    playlist = %pl.id,
                                    attempt,
                                    error = %e,
                                    "playlist update failed"
                                );
                            }
                        }
                    }
                });
            }
            _ = notify_rx.recv() => {
                pl.try_prefetch();
            }
            _ = pl.cancel.cancelled() => return,
        }
    }
}
