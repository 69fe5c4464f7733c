use std::{
    ops::Range,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use futures::StreamExt;
use stampede_net::{ContentRange, HttpClient, RangeSpec, RequestHook};

use crate::{
    error::{AntError, AntResult},
    space::CoveredSpace,
    status::Status,
    watchdog::Watchdog,
};

/// Hard cap on concurrent range workers per downloader.
pub const MAX_ANTS: usize = 10;

/// Temporary failures tolerated per download before giving up.
const FAILURE_TOLERANCE: i32 = 3;

#[derive(Clone)]
pub struct AntOptions {
    /// Bytes fetched per range request.
    pub piece_size: u64,
    /// Concurrent range workers; values < 2 disable probing and download the
    /// whole file over one connection.
    pub ants: usize,
    /// Idle window after which a stalled worker is cancelled.
    pub watchdog_timeout: Duration,
    /// Request-header hook applied to every fetch.
    pub hook: Option<RequestHook>,
}

impl Default for AntOptions {
    fn default() -> Self {
        Self {
            piece_size: 512 * 1024,
            ants: 5,
            watchdog_timeout: Duration::from_secs(30),
            hook: None,
        }
    }
}

/// Result of waiting for an offset to become readable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The offset is covered and can be read.
    Ready,
    /// The offset lies at or past the known total size.
    Eof,
}

/// Range assigned to one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
enum FetchRange {
    /// Plain GET of the entire resource.
    Whole,
    /// Ranged GET, end-exclusive.
    Part(Range<u64>),
}

#[derive(Clone, Debug)]
struct WorkerError {
    temporary: bool,
    reason: String,
}

impl WorkerError {
    fn temporary(reason: impl Into<String>) -> Self {
        Self {
            temporary: true,
            reason: reason.into(),
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        Self {
            temporary: false,
            reason: reason.into(),
        }
    }
}

enum BrainEvent {
    /// Outcome of the probing request. Always precedes the probing worker's
    /// `DownloadDone` on the same channel.
    ProbeResult(Result<u64, WorkerError>),
    DownloadDone {
        req: FetchRange,
        probing: bool,
        result: Result<(), WorkerError>,
    },
}

enum Finish {
    Completed,
    /// `None` reason means an explicit destroy; nothing is logged for it.
    Aborted(Option<String>),
}

struct Waiter {
    id: u64,
    offset: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    status: Status,
    total_size: Option<u64>,
    covered: CoveredSpace,
    stopped: bool,
    cancel: CancellationToken,
    file: Option<Arc<std::fs::File>>,
    waiters: Vec<Waiter>,
    listeners: Vec<mpsc::Sender<()>>,
    next_waiter_id: u64,
    started_at: Option<Instant>,
}

impl State {
    fn fresh() -> Self {
        Self {
            status: Status::NotStarted,
            total_size: None,
            covered: CoveredSpace::new(),
            stopped: false,
            cancel: CancellationToken::new(),
            file: None,
            waiters: Vec::new(),
            listeners: Vec::new(),
            next_waiter_id: 0,
            started_at: None,
        }
    }
}

struct Inner {
    url: Url,
    save: PathBuf,
    opts: AntOptions,
    net: HttpClient,
    state: Mutex<State>,
}

/// Parallel ranged downloader for one URL into one sparse file.
///
/// Cloning is cheap; all clones share the same download.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    pub fn new(url: Url, save: PathBuf, net: HttpClient, mut opts: AntOptions) -> AntResult<Self> {
        if opts.piece_size == 0 {
            return Err(AntError::InvalidArgument(format!(
                "piece_size {} is invalid",
                opts.piece_size
            )));
        }
        opts.ants = opts.ants.min(MAX_ANTS);
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                save,
                opts,
                net,
                state: Mutex::new(State::fresh()),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Begin downloading. Only legal once per lifecycle; use
    /// [`retry`](Self::retry) to re-arm an aborted downloader.
    pub fn start(&self) -> AntResult<()> {
        let mut state = self.inner.state.lock();
        if state.status != Status::NotStarted {
            return Err(AntError::AlreadyStarted);
        }
        state.started_at = Some(Instant::now());
        state.status = Status::Started;

        if let Some(parent) = self.inner.save.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                self.inner.finish_locked(
                    &mut state,
                    Finish::Aborted(Some(format!("create dir {}: {e}", parent.display()))),
                );
                return Err(e.into());
            }
        }
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.inner.save)
        {
            Ok(f) => f,
            Err(e) => {
                self.inner.finish_locked(
                    &mut state,
                    Finish::Aborted(Some(format!(
                        "open {}: {e}",
                        self.inner.save.display()
                    ))),
                );
                return Err(e.into());
            }
        };
        state.file = Some(Arc::new(file));

        let cancel = state.cancel.clone();
        drop(state);

        debug!(url = %self.inner.url, "ant start");
        let inner = self.inner.clone();
        tokio::spawn(brain(inner, cancel));
        Ok(())
    }

    /// Reset an aborted (or never-started) downloader so `start` can run
    /// again. Deletes the partial file. Status reads `NotStarted` until the
    /// next `start`.
    pub fn retry(&self) -> AntResult<()> {
        let mut state = self.inner.state.lock();
        if !matches!(state.status, Status::NotStarted | Status::Aborted) {
            return Err(AntError::BadStatus);
        }
        if state.file.take().is_some() {
            let _ = std::fs::remove_file(&self.inner.save);
        }
        *state = State::fresh();
        Ok(())
    }

    /// Cancel everything, delete the file, and make the terminal state
    /// `Destroyed`. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        self.inner.finish_locked(&mut state, Finish::Aborted(None));
        state.file = None;
        let _ = std::fs::remove_file(&self.inner.save);
        state.status = Status::Destroyed;
    }

    /// Snapshot of (status, total size). The total stays `None` until the
    /// probe or a `Content-Length` discovers it, or completion back-fills it.
    pub fn status(&self) -> (Status, Option<u64>) {
        let state = self.inner.state.lock();
        (state.status, state.total_size)
    }

    /// Block until `offset` is readable, the downloader terminates, or
    /// `cancel` fires.
    pub async fn wait_ready(
        &self,
        cancel: &CancellationToken,
        offset: u64,
    ) -> AntResult<WaitOutcome> {
        loop {
            let (rx, id) = {
                let mut state = self.inner.state.lock();
                if state.covered.is_covered(offset) {
                    return Ok(WaitOutcome::Ready);
                }
                if let Some(total) = state.total_size {
                    if offset >= total {
                        return Ok(WaitOutcome::Eof);
                    }
                }
                if state.stopped {
                    return Err(if state.status == Status::Destroyed {
                        AntError::Destroyed
                    } else {
                        AntError::Stopped
                    });
                }
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push(Waiter { id, offset, tx });
                (rx, id)
            };

            tokio::select! {
                _ = rx => {
                    // Woken; re-check under the lock. A terminal wake-up is
                    // observed as stopped on the next iteration.
                }
                _ = cancel.cancelled() => {
                    let mut state = self.inner.state.lock();
                    state.waiters.retain(|w| w.id != id);
                    return Err(AntError::Cancelled);
                }
            }
        }
    }

    /// Positional read of up to `buf.len()` bytes at `offset`, never past the
    /// contiguous covered run starting there. May short-read. `Ok(0)` means
    /// end of file.
    pub async fn read_at(
        &self,
        cancel: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> AntResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.wait_ready(cancel, offset).await? {
            WaitOutcome::Eof => Ok(0),
            WaitOutcome::Ready => {
                let (file, n) = {
                    let state = self.inner.state.lock();
                    let run = state
                        .covered
                        .covered_range_at(offset)
                        .ok_or(AntError::Stopped)?;
                    let n = ((run.end - run.start) as usize).min(buf.len());
                    let file = state.file.clone().ok_or(AntError::Destroyed)?;
                    (file, n)
                };
                file.read_exact_at(&mut buf[..n], offset)?;
                Ok(n)
            }
        }
    }

    /// Register a completion listener. The channel must be buffered; exactly
    /// one non-blocking send is delivered per downloader lifetime, or
    /// immediately if the downloader already terminated.
    pub fn add_completion_listener(&self, tx: mpsc::Sender<()>) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            let _ = tx.try_send(());
            return;
        }
        state.listeners.push(tx);
    }
}

impl Inner {
    fn finish(&self, outcome: Finish) {
        let mut state = self.state.lock();
        self.finish_locked(&mut state, outcome);
    }

    fn finish_locked(&self, state: &mut State, outcome: Finish) {
        if !state.stopped {
            state.cancel.cancel();
            state.stopped = true;
            // Wake every waiter as if the whole file arrived; they re-check
            // and observe the terminal status.
            for w in state.waiters.drain(..) {
                let _ = w.tx.send(());
            }
            for l in state.listeners.drain(..) {
                let _ = l.try_send(());
            }
        }
        if matches!(
            state.status,
            Status::NotStarted | Status::Started | Status::Downloading
        ) {
            let spent = state
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            match outcome {
                Finish::Aborted(reason) => {
                    if let Some(reason) = reason {
                        error!(url = %self.url, %reason, ?spent, "ant aborted");
                    }
                    state.status = Status::Aborted;
                }
                Finish::Completed => {
                    state.status = Status::Completed;
                    if state.total_size.is_none() {
                        state.total_size = Some(state.covered.contiguous_end());
                    }
                    info!(
                        url = %self.url,
                        size = state.total_size,
                        ?spent,
                        "ant download completed"
                    );
                }
            }
        }
    }

    fn set_total_size(&self, total: u64) {
        self.state.lock().total_size = Some(total);
    }

    fn mark_downloading(&self) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.status = Status::Downloading;
        }
    }

    /// Write a chunk at `offset`, publish the covered range, and wake the
    /// waiters it satisfies.
    fn write_at(&self, data: &[u8], offset: u64) -> AntResult<()> {
        let file = self
            .state
            .lock()
            .file
            .clone()
            .ok_or(AntError::Destroyed)?;
        file.write_all_at(data, offset)?;

        let mut state = self.state.lock();
        let range = offset..offset + data.len() as u64;
        state.covered.cover(range.clone());
        let mut kept = Vec::with_capacity(state.waiters.len());
        for w in state.waiters.drain(..) {
            if range.start <= w.offset && w.offset < range.end {
                let _ = w.tx.send(());
            } else {
                kept.push(w);
            }
        }
        state.waiters = kept;
        Ok(())
    }
}

/// The scheduler task. Sole owner of all scheduling decisions; workers talk
/// to it only through the event channel.
async fn brain(inner: Arc<Inner>, cancel: CancellationToken) {
    let piece = inner.opts.piece_size;
    let (tx, mut rx) = mpsc::channel::<BrainEvent>(16);

    let mut running: usize = 0;
    let mut tolerance: i32 = 0;
    let mut multi_threads = false;
    let mut downloading_whole = false;
    let mut total: u64 = 0;
    let mut progress: u64 = 0;
    let mut last_failed: Option<Range<u64>> = None;

    if inner.opts.ants >= 2 {
        running += 1;
        spawn_worker(&inner, &cancel, &tx, true, FetchRange::Part(0..piece));
    } else {
        // Drive the loop manually: a synthetic probe failure puts the brain
        // straight onto the single-thread path.
        let _ = tx
            .send(BrainEvent::ProbeResult(Err(WorkerError::fatal(
                "multi-thread downloading disabled",
            ))))
            .await;
    }

    loop {
        tokio::select! {
            ev = rx.recv() => {
                // The brain holds a sender, so the channel never closes on us.
                let Some(ev) = ev else { return };
                match ev {
                    BrainEvent::ProbeResult(result) => {
                        debug!(url = %inner.url, ok = result.is_ok(), "probe result");
                        if let Ok(t) = result {
                            multi_threads = true;
                            tolerance = FAILURE_TOLERANCE;
                            total = t;
                            progress = piece;
                        }
                        inner.mark_downloading();
                    }
                    BrainEvent::DownloadDone { req, probing, result } => {
                        running -= 1;
                        if let Err(e) = result {
                            if probing {
                                // The probe-failure side event already told us.
                            } else if !e.temporary {
                                inner.finish(Finish::Aborted(Some(e.reason)));
                                return;
                            } else {
                                tolerance -= 1;
                                if tolerance < 0 {
                                    inner.finish(Finish::Aborted(Some(e.reason)));
                                    return;
                                }
                                warn!(
                                    url = %inner.url,
                                    reason = %e.reason,
                                    tolerance,
                                    "temporary fetch failure, will retry range"
                                );
                                if let FetchRange::Part(r) = req {
                                    last_failed = Some(r);
                                }
                            }
                        }
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }

        // Reconcile: keep the worker pool full.
        if multi_threads {
            while running < inner.opts.ants {
                let next = if let Some(r) = last_failed.take() {
                    Some(r)
                } else if progress < total {
                    let r = progress..(progress + piece).min(total);
                    progress += piece;
                    Some(r)
                } else {
                    None
                };
                match next {
                    Some(r) => {
                        running += 1;
                        spawn_worker(&inner, &cancel, &tx, false, FetchRange::Part(r));
                    }
                    None => break,
                }
            }
        } else if !downloading_whole {
            running += 1;
            downloading_whole = true;
            spawn_worker(&inner, &cancel, &tx, false, FetchRange::Whole);
        }

        if running == 0 {
            inner.finish(Finish::Completed);
            return;
        }
    }
}

fn spawn_worker(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<BrainEvent>,
    probing: bool,
    req: FetchRange,
) {
    let inner = inner.clone();
    let cancel = cancel.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = fetch_range(&inner, &cancel, &tx, probing, &req).await;
        if probing {
            if let Err(e) = &result {
                // probeResult must precede downloadDone on the channel.
                send_event(&tx, &cancel, BrainEvent::ProbeResult(Err(e.clone()))).await;
            }
        }
        send_event(
            &tx,
            &cancel,
            BrainEvent::DownloadDone {
                req,
                probing,
                result,
            },
        )
        .await;
    });
}

async fn send_event(tx: &mpsc::Sender<BrainEvent>, cancel: &CancellationToken, ev: BrainEvent) {
    tokio::select! {
        _ = tx.send(ev) => {}
        _ = cancel.cancelled() => {}
    }
}

/// One HTTP fetch: issue the (possibly ranged) GET, stream the body into the
/// file under watchdog protection, and report progress/total discoveries.
async fn fetch_range(
    inner: &Arc<Inner>,
    root: &CancellationToken,
    tx: &mpsc::Sender<BrainEvent>,
    probing: bool,
    req: &FetchRange,
) -> Result<(), WorkerError> {
    let worker_cancel = root.child_token();
    let dog = {
        let c = worker_cancel.clone();
        Watchdog::new(inner.opts.watchdog_timeout, move || c.cancel())
    };

    let range_spec = match req {
        FetchRange::Part(r) => Some(RangeSpec::from_exclusive(r)),
        FetchRange::Whole => None,
    };

    let resp = tokio::select! {
        r = inner.net.get_streaming(
            inner.url.clone(),
            range_spec,
            None,
            inner.opts.hook.as_ref(),
        ) => r.map_err(|e| WorkerError::temporary(format!("request failed: {e}")))?,
        _ = worker_cancel.cancelled() => {
            return Err(stall_error(root));
        }
    };

    if !(200..300).contains(&resp.status) {
        // 404 can mean the segment has not been pushed to the CDN yet.
        let err = format!("bad http code: {}", resp.status);
        return Err(if resp.status == 404 {
            WorkerError::temporary(err)
        } else {
            WorkerError::fatal(err)
        });
    }

    let mut offset: u64 = 0;
    match req {
        FetchRange::Part(r) => {
            if let Some(raw) = resp.content_range.as_deref() {
                let cr = ContentRange::parse(raw)
                    .map_err(|e| WorkerError::fatal(format!("cannot parse Content-Range: {e}")))?;
                if cr.range.start != r.start {
                    return Err(WorkerError::fatal(format!(
                        "response range {:?} doesn't match the request {:?}",
                        cr.range, r
                    )));
                }
                offset = cr.range.start;
                if probing {
                    inner.set_total_size(cr.total);
                    send_event(tx, root, BrainEvent::ProbeResult(Ok(cr.total))).await;
                }
            } else if resp.status == 206 {
                return Err(WorkerError::fatal("206 response without Content-Range"));
            } else {
                // The server ignored Range and replied 200: data starts at
                // offset 0 and CoveredSpace linearizes progress.
                if probing {
                    return Err(WorkerError::fatal("server ignored the range request"));
                }
                if let Some(len) = resp.content_length {
                    inner.set_total_size(len);
                }
            }
        }
        FetchRange::Whole => {
            if let Some(len) = resp.content_length {
                inner.set_total_size(len);
            }
        }
    }

    let mut stream = resp.stream;
    loop {
        dog.feed();
        let chunk = tokio::select! {
            c = stream.next() => c,
            _ = worker_cancel.cancelled() => return Err(stall_error(root)),
        };
        match chunk {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                inner
                    .write_at(&bytes, offset)
                    .map_err(|e| WorkerError::fatal(format!("write at {offset}: {e}")))?;
                offset += bytes.len() as u64;
            }
            Some(Err(e)) => {
                return Err(WorkerError::temporary(format!(
                    "read response body: {e}"
                )));
            }
            None => break,
        }
    }

    Ok(())
}

fn stall_error(root: &CancellationToken) -> WorkerError {
    if root.is_cancelled() {
        // Destroy path; the event fan-out is already torn down.
        WorkerError::temporary("download cancelled")
    } else {
        WorkerError::temporary("no progress within the watchdog window")
    }
}
