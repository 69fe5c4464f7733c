#![forbid(unsafe_code)]

//! `stampede-ant`
//!
//! The "ant": a parallel ranged-HTTP downloader that fetches one URL into one
//! sparse file using up to [`MAX_ANTS`] concurrent range requests, while
//! serving blocking positional reads to concurrent consumers before the
//! download has finished.
//!
//! The moving parts:
//! - [`CoveredSpace`] tracks which byte ranges of the backing file hold real
//!   data; it is the authoritative view of what a reader may observe.
//! - [`Watchdog`] cancels a worker whose HTTP body stalls.
//! - [`Downloader`] owns the brain task that schedules range workers, the
//!   probe that discovers the total size, and the single-thread fallback for
//!   servers without range support.

mod downloader;
mod error;
mod space;
mod status;
mod watchdog;

pub use downloader::{AntOptions, Downloader, WaitOutcome, MAX_ANTS};
pub use error::{AntError, AntResult};
pub use space::CoveredSpace;
pub use status::Status;
pub use watchdog::Watchdog;
