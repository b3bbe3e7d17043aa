//! Per-page download state.
//!
//! The state vector is guarded by one mutex; the derived counters and the
//! progress/error maps are only touched by the mutation helpers here, so
//! they always match the state vector cardinalities.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::ERROR_UNKNOWN;

/// State of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Nothing has happened to the page yet.
    None,
    /// A worker owns the page and is downloading it.
    Downloading,
    /// The page is in the store.
    Finished,
    /// The last attempt failed; see the page error.
    Failed,
}

/// State table for every page of a gallery. Unallocated until the page count
/// is known.
pub(crate) struct PageTable {
    states: Mutex<Option<Vec<PageState>>>,
    downloaded_pages: AtomicUsize,
    finished_pages: AtomicUsize,
    percent: DashMap<usize, f32>,
    errors: DashMap<usize, String>,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            states: Mutex::new(None),
            downloaded_pages: AtomicUsize::new(0),
            finished_pages: AtomicUsize::new(0),
            percent: DashMap::new(),
            errors: DashMap::new(),
        }
    }

    /// Publish the state vector once the page count is known.
    pub fn allocate(&self, pages: usize) {
        let mut guard = self.states.lock();
        *guard = Some(vec![PageState::None; pages]);
    }

    pub fn len(&self) -> Option<usize> {
        self.states.lock().as_ref().map(|states| states.len())
    }

    pub fn get(&self, index: usize) -> Option<PageState> {
        self.states
            .lock()
            .as_ref()
            .and_then(|states| states.get(index).copied())
    }

    /// Number of pages whose state is not `None`.
    pub fn downloaded_pages(&self) -> usize {
        self.downloaded_pages.load(Ordering::SeqCst)
    }

    /// Number of pages whose state is `Finished`.
    pub fn finished_pages(&self) -> usize {
        self.finished_pages.load(Ordering::SeqCst)
    }

    pub fn percent(&self, index: usize) -> Option<f32> {
        self.percent.get(&index).map(|entry| *entry.value())
    }

    pub fn set_percent(&self, index: usize, percent: f32) {
        self.percent.insert(index, percent);
    }

    pub fn error(&self, index: usize) -> Option<String> {
        self.errors.get(&index).map(|entry| entry.value().clone())
    }

    /// Claim a page for downloading. Fails when another worker owns it, or
    /// when the page is already settled and this is not a forced request.
    pub fn try_begin(&self, index: usize, force: bool) -> bool {
        let mut guard = self.states.lock();
        let Some(states) = guard.as_mut() else {
            return false;
        };
        let Some(&old) = states.get(index) else {
            return false;
        };
        if old == PageState::Downloading
            || (!force && (old == PageState::Finished || old == PageState::Failed))
        {
            return false;
        }
        states[index] = PageState::Downloading;
        self.adjust_counters(old, PageState::Downloading);
        drop(guard);

        self.errors.remove(&index);
        true
    }

    /// The state-mutation helper. Updates counters and the progress/error
    /// maps to match, and returns the previous state.
    pub fn set_state(&self, index: usize, state: PageState, error: Option<&str>) -> PageState {
        let mut guard = self.states.lock();
        let Some(states) = guard.as_mut() else {
            return PageState::None;
        };
        let Some(&old) = states.get(index) else {
            return PageState::None;
        };
        states[index] = state;
        self.adjust_counters(old, state);
        drop(guard);

        match state {
            PageState::Downloading => {
                self.errors.remove(&index);
            }
            PageState::Finished => {
                self.percent.remove(&index);
                self.errors.remove(&index);
            }
            PageState::Failed => {
                self.percent.remove(&index);
                self.errors
                    .insert(index, error.unwrap_or(ERROR_UNKNOWN).to_string());
            }
            PageState::None => {}
        }
        old
    }

    // Caller holds the state mutex.
    fn adjust_counters(&self, old: PageState, new: PageState) {
        if old == PageState::None && new != PageState::None {
            self.downloaded_pages.fetch_add(1, Ordering::SeqCst);
        } else if old != PageState::None && new == PageState::None {
            self.downloaded_pages.fetch_sub(1, Ordering::SeqCst);
        }
        if old != PageState::Finished && new == PageState::Finished {
            self.finished_pages.fetch_add(1, Ordering::SeqCst);
        } else if old == PageState::Finished && new != PageState::Finished {
            self.finished_pages.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Option<Vec<PageState>> {
        self.states.lock().clone()
    }
}
