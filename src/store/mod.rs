//! Page store contracts.
//!
//! A store is the byte sink/source addressed by page index. The engine only
//! sees the [`PageStore`] trait; [`DirStore`] is the bundled filesystem
//! implementation.

use std::io::{Read, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::spider::Mode;

mod dir;

pub use dir::DirStore;

/// Error types for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pipe is already open")]
    AlreadyOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A readable pipe into a stored page. Opening is exclusive per pipe
/// instance; a second `open` without a `close` in between is an error.
pub trait InputPipe: Send {
    fn open(&mut self) -> StoreResult<&mut dyn Read>;
    fn close(&mut self);
}

/// A writable pipe into a page slot.
pub trait OutputPipe: Send {
    fn open(&mut self) -> StoreResult<&mut dyn Write>;
    fn close(&mut self);
}

/// The store contract. Implementations must be shareable across the queen,
/// worker, and decoder threads.
pub trait PageStore: Send + Sync {
    /// Called when the coordinator's usage mode changes; the store may pick
    /// a different persistence target.
    fn set_mode(&self, mode: Mode);

    /// Whether a complete copy of the page is already present.
    fn contains(&self, index: usize) -> bool;

    /// Open a writable pipe for a page. The extension hint comes from the
    /// image URL. `None` means the store cannot provide a sink.
    fn open_output_pipe(&self, index: usize, extension: &str) -> Option<Box<dyn OutputPipe>>;

    /// Open a readable pipe for a stored page, or `None` if absent.
    fn open_input_pipe(&self, index: usize) -> Option<Box<dyn InputPipe>>;

    /// Remove any stored data for a page. Used to discard partial writes.
    fn remove(&self, index: usize);

    /// The gallery's download directory, when the store persists there.
    /// Hosts the preferred copy of the spider info record.
    fn download_dir(&self) -> Option<PathBuf>;
}
