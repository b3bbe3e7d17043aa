//! Request scheduling.
//!
//! Three request queues plus the bulk download cursor live under one mutex.
//! Dequeue priority is force, then interactive, then preload, then the
//! cursor. The preview-fetch dedupe set also lives here.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use super::NUMBER_PRELOAD;

struct RequestQueues {
    /// Explicit re-requests. Bypass the settled-page guards.
    force: VecDeque<usize>,
    /// Interactive requests. The index may be invalid.
    request: VecDeque<usize>,
    /// Preload requests; rebuilt on every interactive request.
    preload: VecDeque<usize>,
    /// Bulk download cursor; -1 when not in download mode. Done when it
    /// reaches the page count.
    download_cursor: i64,
}

pub(crate) struct Scheduler {
    queues: Mutex<RequestQueues>,
    preview_in_flight: Mutex<HashSet<usize>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            queues: Mutex::new(RequestQueues {
                force: VecDeque::new(),
                request: VecDeque::new(),
                preload: VecDeque::new(),
                download_cursor: -1,
            }),
            preview_in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn push_force(&self, index: usize) {
        self.queues.lock().force.push_back(index);
    }

    /// Queue an interactive request and install the following pages as
    /// preloads, replacing any previous preload batch. `pages` is `None`
    /// while the page count is still unknown.
    pub fn push_request(&self, index: usize, pages: Option<usize>) {
        let mut queues = self.queues.lock();
        queues.request.push_back(index);
        queues.preload.clear();
        let size = pages.unwrap_or(usize::MAX);
        for preload in index + 1..index + 1 + NUMBER_PRELOAD {
            if preload >= size {
                break;
            }
            queues.preload.push_back(preload);
        }
    }

    pub fn set_download_cursor(&self, cursor: i64) {
        self.queues.lock().download_cursor = cursor;
    }

    /// Whether any work is queued. Used once at queen startup to decide if
    /// workers must be spawned for requests that arrived before the page
    /// count was known.
    pub fn has_pending(&self, pages: usize) -> bool {
        let queues = self.queues.lock();
        !queues.force.is_empty()
            || !queues.request.is_empty()
            || !queues.preload.is_empty()
            || (queues.download_cursor >= 0 && (queues.download_cursor as usize) < pages)
    }

    /// Pop the next index by priority. Returns the index and whether it was
    /// forced; `None` means every queue is exhausted and the caller should
    /// exit. The returned index may be out of range.
    pub fn dequeue(&self, pages: usize) -> Option<(usize, bool)> {
        let mut queues = self.queues.lock();
        if let Some(index) = queues.force.pop_front() {
            return Some((index, true));
        }
        if let Some(index) = queues.request.pop_front() {
            return Some((index, false));
        }
        if let Some(index) = queues.preload.pop_front() {
            return Some((index, false));
        }
        if queues.download_cursor >= 0 && (queues.download_cursor as usize) < pages {
            let index = queues.download_cursor as usize;
            queues.download_cursor += 1;
            return Some((index, false));
        }
        None
    }

    /// Claim a preview index page for fetching. Returns `false` when a fetch
    /// of the same preview page is already in flight.
    pub fn begin_preview_fetch(&self, preview_index: usize) -> bool {
        self.preview_in_flight.lock().insert(preview_index)
    }

    pub fn end_preview_fetch(&self, preview_index: usize) {
        self.preview_in_flight.lock().remove(&preview_index);
    }

    #[cfg(test)]
    pub fn preload_snapshot(&self) -> Vec<usize> {
        self.queues.lock().preload.iter().copied().collect()
    }
}
