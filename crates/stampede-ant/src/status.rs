/// Downloader lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    Started,
    Downloading,
    Completed,
    Aborted,
    Destroyed,
}

impl Status {
    /// Actively fetching (counts against the prefetch concurrency cap).
    pub fn is_started(self) -> bool {
        matches!(self, Status::Started | Status::Downloading)
    }

    /// Reached a terminal state.
    pub fn is_finished(self) -> bool {
        matches!(self, Status::Completed | Status::Aborted | Status::Destroyed)
    }
}
