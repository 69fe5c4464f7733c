use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Idle timer guarding a streaming transfer.
///
/// If `interval` elapses without a [`feed`](Watchdog::feed), `on_timeout`
/// runs exactly once and the timer stops. Feeding restarts the window;
/// dropping (or [`stop`](Watchdog::stop)) terminates the timer without
/// firing.
///
/// The watchdog guards *idleness*, not total elapsed time: a slow but
/// steadily-fed transfer never trips it.
pub struct Watchdog {
    feed_tx: mpsc::Sender<()>,
}

impl Watchdog {
    pub fn new<F>(interval: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (feed_tx, mut feed_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(interval, feed_rx.recv()).await {
                    // Fed within the window: restart it.
                    Ok(Some(())) => continue,
                    // All senders dropped: the owner stopped us.
                    Ok(None) => return,
                    Err(_) => {
                        warn!("watchdog timeout");
                        on_timeout();
                        return;
                    }
                }
            }
        });
        Self { feed_tx }
    }

    /// Restart the idle window. Non-blocking; a feed is dropped if one is
    /// already pending, which is just as good as delivering it.
    pub fn feed(&self) {
        let _ = self.feed_tx.try_send(());
    }

    /// Stop the timer without firing. Equivalent to dropping the watchdog.
    pub fn stop(self) {}
}
