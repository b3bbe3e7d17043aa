//! Listener surface and broadcast.

use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;

/// Observer of a coordinator's progress. All methods default to no-ops so
/// listeners implement only what they need.
///
/// Callbacks run on engine threads and must not block for long. Listeners
/// may re-enter the coordinator; the list is snapshot-copied before every
/// dispatch so re-entry cannot deadlock the listener mutex.
#[allow(unused_variables)]
pub trait SpiderListener: Send + Sync {
    /// The page count is known.
    fn on_get_pages(&self, pages: usize) {}

    /// The remote rate-limited a page fetch.
    fn on_get_509(&self, index: usize) {}

    /// A chunk of an image body arrived. `content_length` is `None` when
    /// the server did not send one.
    fn on_download(
        &self,
        index: usize,
        content_length: Option<u64>,
        received_size: u64,
        bytes_read: usize,
    ) {
    }

    /// A page finished downloading.
    fn on_success(&self, index: usize) {}

    /// A page failed for good.
    fn on_failure(&self, index: usize, error: &str) {}

    /// A requested page was decoded.
    fn on_get_image_success(&self, index: usize, image: &Arc<DynamicImage>) {}

    /// A requested page could not be decoded.
    fn on_get_image_failure(&self, index: usize, error: &str) {}
}

/// The listener list plus broadcast helpers.
pub(crate) struct Listeners {
    inner: Mutex<Vec<Arc<dyn SpiderListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Listeners {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn SpiderListener>) {
        self.inner.lock().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn SpiderListener>) {
        self.inner
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn snapshot(&self) -> Vec<Arc<dyn SpiderListener>> {
        self.inner.lock().clone()
    }

    pub fn notify_get_pages(&self, pages: usize) {
        for listener in self.snapshot() {
            listener.on_get_pages(pages);
        }
    }

    pub fn notify_get_509(&self, index: usize) {
        for listener in self.snapshot() {
            listener.on_get_509(index);
        }
    }

    pub fn notify_download(
        &self,
        index: usize,
        content_length: Option<u64>,
        received_size: u64,
        bytes_read: usize,
    ) {
        for listener in self.snapshot() {
            listener.on_download(index, content_length, received_size, bytes_read);
        }
    }

    pub fn notify_success(&self, index: usize) {
        for listener in self.snapshot() {
            listener.on_success(index);
        }
    }

    pub fn notify_failure(&self, index: usize, error: &str) {
        for listener in self.snapshot() {
            listener.on_failure(index, error);
        }
    }

    pub fn notify_get_image_success(&self, index: usize, image: &Arc<DynamicImage>) {
        for listener in self.snapshot() {
            listener.on_get_image_success(index, image);
        }
    }

    pub fn notify_get_image_failure(&self, index: usize, error: &str) {
        for listener in self.snapshot() {
            listener.on_get_image_failure(index, error);
        }
    }
}
