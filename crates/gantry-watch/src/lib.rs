//! Stability-gated directory watching.
//!
//! Raw filesystem events are noisy: editors and copy tools write a file
//! in many small bursts. This crate watches a directory and only reports
//! a change once the file's identity (size, mtime) has stopped moving
//! for a configured interval, so a consumer sees exactly one callback
//! per stable change.

mod error;
mod watcher;

pub use error::{Result, WatchError};
pub use watcher::{FileWatcher, WatchCallback, WatchEvent, WatchOptions, WatcherStats};
