use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{info, warn};

const LOCK_FILE: &str = "hlscache.lock";
const PLAYLIST_DIR_PREFIX: &str = "pl-";

/// Per-playlist cache directories under one cache root.
///
/// Each live playlist gets `pl-<playlistId>-<pid>` with an advisory-locked
/// lockfile inside. A directory whose lockfile can be re-locked belongs to a
/// dead process and is swept on the next startup; live directories are held
/// locked for the whole process lifetime.
pub struct CacheDirs {
    root: PathBuf,
    // Locks held by this process; flock would refuse a second lock on the
    // same path from a second file description.
    locks: Mutex<HashMap<PathBuf, fs::File>>,
}

impl CacheDirs {
    /// Open the cache root, sweeping directories orphaned by dead processes.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        sweep_stale_dirs(&root);
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the locked cache directory for `playlist_id`.
    pub fn playlist_dir(&self, playlist_id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(format!(
            "{PLAYLIST_DIR_PREFIX}{playlist_id}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir)?;

        let mut locks = self.locks.lock();
        if locks.contains_key(&dir) {
            return Ok(dir);
        }
        let lock_path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.try_lock_exclusive()?;
        info!(path = %lock_path.display(), "locked playlist cache dir");
        locks.insert(dir.clone(), file);
        Ok(dir)
    }
}

/// Delete sibling playlist directories whose lockfile can be taken over.
fn sweep_stale_dirs(root: &Path) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "cannot read cache root");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(PLAYLIST_DIR_PREFIX) {
            continue;
        }
        let lock_path = path.join(LOCK_FILE);
        if !lock_path.is_file() {
            continue;
        }
        let Ok(file) = fs::File::open(&lock_path) else {
            continue;
        };
        if file.try_lock_exclusive().is_ok() {
            // Lock acquired, so the process that owned this directory died.
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to sweep stale cache dir");
            } else {
                info!(path = %path.display(), "swept stale cache dir");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_pid_suffixed_locked_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dirs = CacheDirs::open(root.path()).unwrap();
        let a = dirs.playlist_dir("abcd1234").unwrap();
        assert!(a.is_dir());
        assert!(a.join(LOCK_FILE).is_file());
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("pl-abcd1234-"));
        assert!(name.ends_with(&std::process::id().to_string()));

        // Re-requesting the same playlist reuses the directory.
        let b = dirs.playlist_dir("abcd1234").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sweeps_unlocked_leftovers_but_keeps_live_dirs() {
        let root = tempfile::tempdir().unwrap();

        // Simulate a dir left by a dead process: lockfile present, unlocked.
        let stale = root.path().join("pl-deadbeef-99999");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join(LOCK_FILE), b"").unwrap();

        // A dir without the lockfile is not ours to judge.
        let unmanaged = root.path().join("pl-nolock-1");
        fs::create_dir_all(&unmanaged).unwrap();

        let dirs = CacheDirs::open(root.path()).unwrap();
        let live = dirs.playlist_dir("cafe0001").unwrap();

        // A second open sweeps the stale dir but must leave the live one.
        sweep_stale_dirs(root.path());
        assert!(!stale.exists());
        assert!(unmanaged.exists());
        assert!(live.exists());
    }
}
