use std::{ops::Deref, path::Path, sync::Arc};

use parking_lot::Mutex;
use stampede_ant::{AntOptions, Downloader, Status, WaitOutcome};
use stampede_net::{HttpClient, RequestHook};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use url::Url;

use crate::{error::HlsError, error::HlsResult, options::UrlOptions};

const DEFAULT_PIECE_SIZE: u64 = 512 * 1024;
const DEFAULT_ANTS: usize = 5;

/// One media segment of a live playlist: a downloader plus the bookkeeping
/// that decides when it may be destroyed.
pub struct Segment {
    seq: u64,
    seg_id: String,
    downloader: Downloader,
    state: Mutex<SegState>,
}

struct SegState {
    /// Latched on the first prefetch; later calls only retry after failure.
    started: bool,
    interests: usize,
    dying: bool,
}

impl Segment {
    pub(crate) fn new(
        seq: u64,
        seg_id: String,
        url: Url,
        cache_dir: &Path,
        net: HttpClient,
        opts: &UrlOptions,
        hook: Option<RequestHook>,
    ) -> HlsResult<Arc<Segment>> {
        let ant_opts = AntOptions {
            piece_size: opts.ant_piece_size.unwrap_or(DEFAULT_PIECE_SIZE),
            ants: opts.ant_concurrent_pieces.unwrap_or(DEFAULT_ANTS),
            hook,
            ..AntOptions::default()
        };
        let downloader = Downloader::new(url, cache_dir.join(&seg_id), net, ant_opts)?;
        Ok(Arc::new(Segment {
            seq,
            seg_id,
            downloader,
            state: Mutex::new(SegState {
                started: false,
                interests: 0,
                dying: false,
            }),
        }))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn seg_id(&self) -> &str {
        &self.seg_id
    }

    /// Upstream URL of this segment.
    pub fn url(&self) -> &Url {
        self.downloader.url()
    }

    pub fn status(&self) -> Status {
        self.downloader.status().0
    }

    /// Start (or restart) downloading. Returns `true` iff a new download was
    /// actually kicked off; `false` when one already ran and cannot be
    /// retried, or starting failed.
    pub fn prefetch(&self) -> bool {
        let mut state = self.state.lock();
        if state.started {
            // A retry is only legal if the previous run aborted.
            if self.downloader.retry().is_err() {
                return false;
            }
        }
        state.started = true;
        if let Err(e) = self.downloader.start() {
            error!(seg_id = %self.seg_id, error = %e, "prefetch failed to start");
            return false;
        }
        true
    }

    /// Total size, blocking until the download learns it (first byte ready
    /// or terminal state). `None` if the size is still unknown.
    pub async fn total_size(&self, cancel: &CancellationToken) -> HlsResult<Option<u64>> {
        match self.downloader.wait_ready(cancel, 0).await {
            Ok(WaitOutcome::Ready | WaitOutcome::Eof) => Ok(self.downloader.status().1),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_at(
        &self,
        cancel: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> HlsResult<usize> {
        Ok(self.downloader.read_at(cancel, buf, offset).await?)
    }

    pub fn add_completion_listener(&self, tx: mpsc::Sender<()>) {
        self.downloader.add_completion_listener(tx);
    }

    /// Destroy the underlying downloader.
    ///
    /// While references are still live: `lazy` marks the segment dying (the
    /// last reference drop destroys it) and succeeds; non-lazy fails with
    /// [`HlsError::StillInUse`].
    pub(crate) fn destroy(&self, lazy: bool) -> HlsResult<()> {
        let mut state = self.state.lock();
        if state.interests > 0 {
            if lazy {
                state.dying = true;
                return Ok(());
            }
            return Err(HlsError::StillInUse);
        }
        self.downloader.destroy();
        Ok(())
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> SegmentRef {
        self.state.lock().interests += 1;
        SegmentRef { seg: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.interests == 0 {
            warn!(seg_id = %self.seg_id, "segment reference count underflow");
            return;
        }
        state.interests -= 1;
        if state.interests == 0 && state.dying {
            self.downloader.destroy();
        }
    }
}

/// Counted reference to a [`Segment`]. Dropping it releases the count and,
/// if the segment was lazily destroyed meanwhile, tears the download down.
pub struct SegmentRef {
    seg: Arc<Segment>,
}

impl Deref for SegmentRef {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.seg
    }
}

impl Clone for SegmentRef {
    fn clone(&self) -> Self {
        self.seg.acquire()
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.seg.release();
    }
}
