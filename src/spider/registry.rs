//! Process-wide coordinator registry with per-mode reference counts.
//!
//! A coordinator is shared between an interactive reader and a bulk
//! downloader of the same gallery. Each usage mode holds its own reference;
//! when the last one is released the coordinator is stopped and dropped
//! from the registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use super::queen::SpiderQueen;
use super::Mode;

/// Error types for lifecycle misuse
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("download reference can't exceed 1")]
    DownloadRefExceeded,

    #[error("mode reference underflow")]
    RefUnderflow,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

static GLOBAL: Lazy<SpiderRegistry> = Lazy::new(SpiderRegistry::new);

/// Map from gallery id to its live coordinator.
pub struct SpiderRegistry {
    queens: Mutex<HashMap<u64, SpiderQueen>>,
}

impl SpiderRegistry {
    pub fn new() -> Self {
        SpiderRegistry {
            queens: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static SpiderRegistry {
        &GLOBAL
    }

    /// Get the coordinator for a gallery, constructing and starting it on
    /// first acquisition, and take a reference in the given mode.
    ///
    /// `build` runs only when no coordinator is registered for `gid`.
    pub fn acquire<F>(&self, gid: u64, mode: Mode, build: F) -> RegistryResult<SpiderQueen>
    where
        F: FnOnce() -> SpiderQueen,
    {
        let mut queens = self.queens.lock();
        match queens.entry(gid) {
            Entry::Occupied(entry) => {
                let queen = entry.get().clone();
                queen.set_mode(mode)?;
                Ok(queen)
            }
            Entry::Vacant(entry) => {
                debug!("starting spider for gallery {}", gid);
                let queen = build();
                queen.set_mode(mode)?;
                queen.start();
                entry.insert(queen.clone());
                Ok(queen)
            }
        }
    }

    /// Drop one reference. When the last reference goes, the coordinator is
    /// stopped and unregistered.
    pub fn release(&self, queen: &SpiderQueen, mode: Mode) -> RegistryResult<()> {
        queen.clear_mode(mode)?;
        if queen.read_ref() == 0 && queen.download_ref() == 0 {
            debug!("stopping spider for gallery {}", queen.gallery().gid);
            queen.stop();
            self.queens.lock().remove(&queen.gallery().gid);
        }
        Ok(())
    }

    pub fn contains(&self, gid: u64) -> bool {
        self.queens.lock().contains_key(&gid)
    }
}

impl Default for SpiderRegistry {
    fn default() -> Self {
        SpiderRegistry::new()
    }
}
