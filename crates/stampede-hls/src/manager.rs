use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    playlist::{Playlist, PlaylistRef},
    user::{User, UserRef},
};

const TIDY_INTERVAL: Duration = Duration::from_secs(5);
const USER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Registry {
    users: HashMap<String, Arc<User>>,
    playlists: HashMap<String, Arc<Playlist>>,
}

/// Process-wide registries of users and playlists with an idle-GC loop.
///
/// Entries live as long as someone holds a counted reference or the entry's
/// own activity says it is busy; the tidy loop reclaims the rest.
pub struct Manager {
    state: Mutex<Registry>,
    cancel: CancellationToken,
    user_idle_timeout: Duration,
}

impl Manager {
    pub fn new() -> Arc<Manager> {
        Self::with_intervals(TIDY_INTERVAL, USER_IDLE_TIMEOUT)
    }

    /// Construction with explicit timings, for tests.
    pub fn with_intervals(tidy_interval: Duration, user_idle_timeout: Duration) -> Arc<Manager> {
        let mgr = Arc::new(Manager {
            state: Mutex::new(Registry {
                users: HashMap::new(),
                playlists: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            user_idle_timeout,
        });
        tokio::spawn(tidy_loop(Arc::downgrade(&mgr), tidy_interval));
        mgr
    }

    /// Look a user up, creating it on first sight. Always acquired.
    pub fn user(&self, id: &str) -> UserRef {
        let mut reg = self.state.lock();
        let user = reg
            .users
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(user = %id, "new user");
                User::new(id.to_string())
            });
        user.acquire()
    }

    /// Acquired lookup; `None` when the playlist is not registered.
    pub fn playlist(&self, id: &str) -> Option<PlaylistRef> {
        let reg = self.state.lock();
        reg.playlists.get(id).map(|pl| pl.acquire())
    }

    /// Register `pl` unless someone else won the race; the winner is
    /// returned acquired, along with whether `pl` was the one installed.
    pub fn get_or_add_playlist(&self, pl: Arc<Playlist>) -> (PlaylistRef, bool) {
        let mut reg = self.state.lock();
        match reg.playlists.entry(pl.id().to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => (e.get().acquire(), false),
            std::collections::hash_map::Entry::Vacant(e) => {
                let r = pl.acquire();
                e.insert(pl);
                (r, true)
            }
        }
    }

    /// Stop the tidy loop. Registered playlists keep running until their
    /// references drop; callers tearing the process down should not care.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn tidy(&self) {
        let mut reg = self.state.lock();
        let idle = self.user_idle_timeout;
        reg.users.retain(|id, user| {
            let active = user.check_active(idle);
            if !active {
                info!(user = %id, "user became inactive");
            }
            active
        });
        reg.playlists.retain(|id, pl| {
            if pl.try_destroy().is_ok() {
                info!(playlist = %id, "playlist became inactive");
                false
            } else {
                true
            }
        });
    }
}

async fn tidy_loop(mgr: Weak<Manager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval is immediate; skip it so a freshly
    // created registry is not swept before anyone used it.
    ticker.tick().await;
    loop {
        let cancelled = {
            let Some(mgr) = mgr.upgrade() else { return };
            tokio::select! {
                _ = ticker.tick() => {
                    mgr.tidy();
                    false
                }
                _ = mgr.cancel.cancelled() => true,
            }
        };
        if cancelled {
            return;
        }
    }
}
