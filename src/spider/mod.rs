//! The spider engine.
//!
//! One [`SpiderQueen`] coordinates a gallery: a queen thread bootstraps the
//! gallery metadata and services pToken requests, up to
//! [`NUMBER_SPIDER_WORKER`] workers resolve and download pages, and a single
//! decoder thread turns stored pages into in-memory images. Coordinators are
//! handed out by the reference-counted [`SpiderRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};

mod cancel;
mod decoder;
mod info;
mod listener;
mod queen;
mod registry;
mod scheduler;
mod state;
mod worker;

#[cfg(test)]
mod tests;

pub use decoder::{DecodeError, ImageDecoder, StreamDecoder};
pub use info::{InfoError, InfoResult, PToken, SpiderInfo};
pub use listener::SpiderListener;
pub use queen::{PageAnswer, Size, SpiderQueen};
pub use registry::{RegistryError, RegistryResult, SpiderRegistry};
pub use state::PageState;

/// Fixed size of the worker pool.
pub const NUMBER_SPIDER_WORKER: usize = 3;

/// How many consecutive pages are preloaded after an interactive request.
pub const NUMBER_PRELOAD: usize = 5;

/// File name of the spider info record in a gallery's download directory.
pub const SPIDER_INFO_FILENAME: &str = ".ehviewer";

/// Attempts per page before it is marked failed.
pub(crate) const DOWNLOAD_ATTEMPTS: usize = 2;

/// Chunk size for streaming image bodies into the store.
pub(crate) const DOWNLOAD_BUFFER_SIZE: usize = 4 * 1024;

pub const ERROR_UNKNOWN: &str = "unknown error";
pub const ERROR_INVALID_URL: &str = "invalid URL";
pub const ERROR_SOCKET: &str = "socket error";
pub const ERROR_PARSE: &str = "parse error";
pub const ERROR_509: &str = "509 error";
pub const ERROR_WRITE_FAILED: &str = "failed to write file";
pub const ERROR_PTOKEN: &str = "failed to get pToken";
pub const ERROR_OUT_OF_RANGE: &str = "index out of range";
pub const ERROR_NOT_FOUND: &str = "image not found";
pub const ERROR_DECODING_FAILED: &str = "failed to decode image";
pub const ERROR_READING_FAILED: &str = "failed to read image";

/// Usage mode of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Interactive viewing; pages are fetched on request.
    Read,
    /// Bulk download; a cursor walks every page of the gallery.
    Download,
}

/// Identity of a gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryInfo {
    /// Gallery id.
    pub gid: u64,
    /// Gallery token. Must match the persisted spider info record.
    pub token: String,
    /// Human-readable title. Used by stores for directory names.
    pub title: String,
}

impl GalleryInfo {
    pub fn new(gid: u64, token: impl Into<String>, title: impl Into<String>) -> Self {
        GalleryInfo {
            gid,
            token: token.into(),
            title: title.into(),
        }
    }
}

static THREAD_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

/// Process-wide id for thread names and worker slot identity.
pub(crate) fn next_thread_id() -> u64 {
    THREAD_ID_GENERATOR.fetch_add(1, Ordering::Relaxed) + 1
}
