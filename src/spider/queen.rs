//! The coordinator and its queen thread.
//!
//! The queen bootstraps a gallery and then services pToken requests:
//! 1. Load the spider info record from disk, or fetch and parse the first
//!    preview index page
//! 2. Publish the page state table and notify listeners of the page count
//! 3. Spawn the decoder, and workers if requests already queued up
//! 4. Loop on the pToken request queue, fetching preview index pages to
//!    resolve tokens workers are waiting for

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::cancel::CancelToken;
use super::decoder::{self, ImageDecoder};
use super::info::{InfoError, PToken, SpiderInfo};
use super::listener::{Listeners, SpiderListener};
use super::registry::{RegistryError, RegistryResult};
use super::scheduler::Scheduler;
use super::state::{PageState, PageTable};
use super::worker;
use super::{
    next_thread_id, GalleryInfo, Mode, ERROR_UNKNOWN, NUMBER_SPIDER_WORKER, SPIDER_INFO_FILENAME,
};
use crate::client::{url, ClientResult, GalleryParser, Transport};
use crate::config::SpiderConfig;
use crate::store::PageStore;

/// What a consumer sees when asking for the gallery size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// The coordinator died during startup or was stopped.
    Error,
    /// The page count is not known yet.
    Wait,
    /// Total page count.
    Pages(usize),
}

/// Immediate answer to a page request. `None` from [`SpiderQueen::request`]
/// means the page is on its way; watch the listener surface.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAnswer {
    /// The page is downloading; fraction of the body received so far.
    Progress(f32),
    /// The page failed with this error text.
    Failed(String),
}

/// A gallery coordinator. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct SpiderQueen {
    inner: Arc<Inner>,
}

pub(super) struct ModeState {
    read_ref: i32,
    download_ref: i32,
    mode: Mode,
}

pub(super) struct TokenState {
    /// Gallery metadata; `None` until bootstrap finishes.
    pub(super) info: Option<SpiderInfo>,
    /// Indices workers need a pToken for.
    pub(super) requests: VecDeque<usize>,
}

/// State shared by the queen, workers, decoder, and consumer calls.
pub(super) struct Inner {
    pub(super) gallery: GalleryInfo,
    pub(super) config: SpiderConfig,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) parser: Arc<dyn GalleryParser>,
    pub(super) decoder: Arc<dyn ImageDecoder>,
    pub(super) store: Arc<dyn PageStore>,

    mode: Mutex<ModeState>,
    /// Cleared when the queen thread exits; consumers treat a dead queen as
    /// a dead coordinator.
    queen_alive: AtomicBool,
    pub(super) cancel: CancelToken,

    /// pToken map and request queue. The queen and worker condvars both
    /// pair with this mutex.
    pub(super) token_state: Mutex<TokenState>,
    pub(super) queen_cond: Condvar,
    pub(super) worker_cond: Condvar,

    pub(super) table: PageTable,
    pub(super) scheduler: Scheduler,

    pub(super) decode_stack: Mutex<Vec<usize>>,
    pub(super) decode_cond: Condvar,

    /// Worker slot table; holds the id of the thread occupying each slot.
    pub(super) workers: Mutex<Option<Vec<Option<u64>>>>,
    pub(super) listeners: Listeners,
}

impl SpiderQueen {
    pub fn new(
        gallery: GalleryInfo,
        config: SpiderConfig,
        store: Arc<dyn PageStore>,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn GalleryParser>,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        SpiderQueen {
            inner: Arc::new(Inner {
                gallery,
                config,
                transport,
                parser,
                decoder,
                store,
                mode: Mutex::new(ModeState {
                    read_ref: 0,
                    download_ref: 0,
                    mode: Mode::Read,
                }),
                queen_alive: AtomicBool::new(false),
                cancel: CancelToken::new(),
                token_state: Mutex::new(TokenState {
                    info: None,
                    requests: VecDeque::new(),
                }),
                queen_cond: Condvar::new(),
                worker_cond: Condvar::new(),
                table: PageTable::new(),
                scheduler: Scheduler::new(),
                decode_stack: Mutex::new(Vec::new()),
                decode_cond: Condvar::new(),
                workers: Mutex::new(None),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn gallery(&self) -> &GalleryInfo {
        &self.inner.gallery
    }

    pub fn add_listener(&self, listener: Arc<dyn SpiderListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SpiderListener>) {
        self.inner.listeners.remove(listener);
    }

    /// Gallery size, or a sentinel while unknown or after a fatal startup
    /// failure.
    pub fn size(&self) -> Size {
        if !self.inner.queen_alive.load(Ordering::SeqCst) {
            Size::Error
        } else if let Some(pages) = self.inner.table.len() {
            Size::Pages(pages)
        } else {
            Size::Wait
        }
    }

    /// Coordinator-level error text, if the coordinator is dead.
    pub fn error(&self) -> Option<String> {
        if self.inner.queen_alive.load(Ordering::SeqCst) {
            None
        } else {
            Some(ERROR_UNKNOWN.to_string())
        }
    }

    /// Number of pages whose download has at least started.
    pub fn downloaded_pages(&self) -> usize {
        self.inner.table.downloaded_pages()
    }

    /// Number of pages fully in the store.
    pub fn finished_pages(&self) -> usize {
        self.inner.table.finished_pages()
    }

    /// Ask for a page. Queues the page (plus preloads) when untouched,
    /// reports progress while downloading, reports the error when failed,
    /// and schedules decoding when finished.
    pub fn request(&self, index: usize) -> Option<PageAnswer> {
        request_page(&self.inner, index, false)
    }

    /// Ask for a page again, bypassing the settled-page guards.
    pub fn force_request(&self, index: usize) -> Option<PageAnswer> {
        request_page(&self.inner, index, true)
    }

    pub(super) fn set_mode(&self, mode: Mode) -> RegistryResult<()> {
        let mut mode_state = self.inner.mode.lock();
        match mode {
            Mode::Read => mode_state.read_ref += 1,
            Mode::Download => {
                if mode_state.download_ref >= 1 {
                    return Err(RegistryError::DownloadRefExceeded);
                }
                mode_state.download_ref += 1;
            }
        }
        self.inner.apply_mode(&mut mode_state);
        Ok(())
    }

    pub(super) fn clear_mode(&self, mode: Mode) -> RegistryResult<()> {
        let mut mode_state = self.inner.mode.lock();
        match mode {
            Mode::Read => {
                if mode_state.read_ref == 0 {
                    return Err(RegistryError::RefUnderflow);
                }
                mode_state.read_ref -= 1;
            }
            Mode::Download => {
                if mode_state.download_ref == 0 {
                    return Err(RegistryError::RefUnderflow);
                }
                mode_state.download_ref -= 1;
            }
        }
        self.inner.apply_mode(&mut mode_state);
        Ok(())
    }

    pub(super) fn read_ref(&self) -> i32 {
        self.inner.mode.lock().read_ref
    }

    pub(super) fn download_ref(&self) -> i32 {
        self.inner.mode.lock().download_ref
    }

    pub(super) fn start(&self) {
        let inner = Arc::clone(&self.inner);
        inner.queen_alive.store(true, Ordering::SeqCst);
        let name = format!("spider-queen-{}", next_thread_id());
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || queen_main(inner));
        if let Err(err) = spawned {
            error!("failed to spawn {}: {}", name, err);
            self.inner.queen_alive.store(false, Ordering::SeqCst);
        }
    }

    pub(super) fn stop(&self) {
        self.inner.queen_alive.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.inner.wake_all();
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

/// Outcome of one pToken resolution round.
enum TokenFetch {
    /// The map now has an entry for the requested index.
    Resolved,
    /// Another fetch of the same preview page is in flight; the requester
    /// stays queued behind it.
    Wait,
    /// The preview page could not be fetched, or did not cover the index.
    Missing,
}

impl Inner {
    pub(super) fn current_mode(&self) -> Mode {
        self.mode.lock().mode
    }

    // Caller holds the mode mutex.
    fn apply_mode(&self, mode_state: &mut ModeState) {
        mode_state.mode = if mode_state.download_ref > 0 {
            Mode::Download
        } else {
            Mode::Read
        };
        self.store.set_mode(mode_state.mode);
        self.scheduler.set_download_cursor(match mode_state.mode {
            Mode::Download => 0,
            Mode::Read => -1,
        });
    }

    /// Wake every condvar. Takes each pairing mutex first so a thread
    /// between its cancellation check and its wait cannot miss the signal.
    pub(super) fn wake_all(&self) {
        drop(self.token_state.lock());
        self.queen_cond.notify_all();
        self.worker_cond.notify_all();
        drop(self.decode_stack.lock());
        self.decode_cond.notify_all();
    }

    pub(super) fn notify_workers(&self) {
        drop(self.token_state.lock());
        self.worker_cond.notify_all();
    }

    /// The only way page state changes. Fires the matching listener event
    /// after the table is updated.
    pub(super) fn update_page_state(&self, index: usize, state: PageState, error: Option<&str>) {
        self.table.set_state(index, state, error);
        match state {
            PageState::Failed => {
                let message = self
                    .table
                    .error(index)
                    .unwrap_or_else(|| ERROR_UNKNOWN.to_string());
                self.listeners.notify_failure(index, &message);
            }
            PageState::Finished => self.listeners.notify_success(index),
            _ => {}
        }
    }

    fn read_info_from_local(&self) -> Option<SpiderInfo> {
        let gid = self.gallery.gid;
        let token = &self.gallery.token;

        if let Some(dir) = self.store.download_dir() {
            match SpiderInfo::read_from(&dir.join(SPIDER_INFO_FILENAME), gid, token) {
                Ok(info) => return Some(info),
                Err(InfoError::Io(_)) => {}
                Err(err) => debug!("discarding download-dir spider info: {}", err),
            }
        }

        match SpiderInfo::read_from(&self.config.info_cache_path(gid), gid, token) {
            Ok(info) => Some(info),
            Err(InfoError::Io(_)) => None,
            Err(err) => {
                debug!("discarding cached spider info: {}", err);
                None
            }
        }
    }

    fn fetch_info_from_network(&self) -> ClientResult<SpiderInfo> {
        let detail = url::detail_url(
            &self.config.base_url,
            self.gallery.gid,
            &self.gallery.token,
            0,
        );
        debug!("{}", detail);
        let body = self.transport.get_string(&detail)?;

        let pages = self.parser.parse_pages(&body)?;
        let preview_pages = self.parser.parse_preview_pages(&body)?;
        let preview_set = self.parser.parse_preview_set(&body)?;

        let mut info = SpiderInfo::new(
            self.gallery.gid,
            self.gallery.token.clone(),
            pages as u32,
            preview_pages as u32,
            preview_set.len() as u32,
        );
        for entry in preview_set.iter() {
            info.set_ptoken(entry.index, PToken::Value(entry.ptoken.clone()));
        }
        Ok(info)
    }

    /// Write-through: serialize under the token mutex, write both copies
    /// after releasing it. Best-effort on both paths.
    pub(super) fn write_info_snapshot(&self) {
        let json = {
            let token_state = self.token_state.lock();
            match token_state.info.as_ref().map(|info| info.to_json()) {
                Some(Ok(json)) => json,
                Some(Err(err)) => {
                    warn!("failed to serialize spider info: {}", err);
                    return;
                }
                None => return,
            }
        };

        if let Some(dir) = self.store.download_dir() {
            let path = dir.join(SPIDER_INFO_FILENAME);
            if let Err(err) = fs::write(&path, &json) {
                warn!("failed to write spider info to {}: {}", path.display(), err);
            }
        }

        let cache_path = self.config.info_cache_path(self.gallery.gid);
        if let Some(parent) = cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&cache_path, &json) {
            warn!(
                "failed to write spider info to {}: {}",
                cache_path.display(),
                err
            );
        }
    }

    /// Service pToken requests until cancelled.
    fn token_loop(&self) {
        loop {
            let index = {
                let mut token_state = self.token_state.lock();
                loop {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    if let Some(index) = token_state.requests.pop_front() {
                        break index;
                    }
                    self.queen_cond.wait(&mut token_state);
                }
            };

            // The map may have been filled while the request sat queued.
            let known = {
                let token_state = self.token_state.lock();
                token_state
                    .info
                    .as_ref()
                    .and_then(|info| info.ptoken(index))
                    .is_some()
            };
            if known {
                self.notify_workers();
                continue;
            }

            match self.fetch_ptoken(index) {
                TokenFetch::Resolved => self.notify_workers(),
                TokenFetch::Wait => {}
                TokenFetch::Missing => {
                    {
                        let mut token_state = self.token_state.lock();
                        if let Some(info) = token_state.info.as_mut() {
                            info.set_ptoken(index, PToken::Failed);
                        }
                    }
                    self.notify_workers();
                }
            }
        }
    }

    /// Resolve a pToken by fetching the preview index page covering it.
    fn fetch_ptoken(&self, index: usize) -> TokenFetch {
        let preview_per_page = {
            let token_state = self.token_state.lock();
            match token_state.info.as_ref() {
                Some(info) if info.preview_per_page > 0 => info.preview_per_page as usize,
                _ => return TokenFetch::Missing,
            }
        };
        let preview_index = index / preview_per_page;

        if !self.scheduler.begin_preview_fetch(preview_index) {
            return TokenFetch::Wait;
        }
        let fetched = self.fetch_preview_page(index, preview_index);
        self.scheduler.end_preview_fetch(preview_index);

        match fetched {
            Ok(fetch) => fetch,
            Err(err) => {
                warn!("preview page {} fetch failed: {}", preview_index, err);
                TokenFetch::Missing
            }
        }
    }

    fn fetch_preview_page(&self, index: usize, preview_index: usize) -> ClientResult<TokenFetch> {
        let detail = url::detail_url(
            &self.config.base_url,
            self.gallery.gid,
            &self.gallery.token,
            preview_index,
        );
        debug!("{}", detail);
        let body = self.transport.get_string(&detail)?;
        let preview_set = self.parser.parse_preview_set(&body)?;

        let fetch = {
            let mut token_state = self.token_state.lock();
            let Some(info) = token_state.info.as_mut() else {
                return Ok(TokenFetch::Missing);
            };
            for entry in preview_set.iter() {
                info.set_ptoken(entry.index, PToken::Value(entry.ptoken.clone()));
            }
            if info.ptoken(index).is_some() {
                TokenFetch::Resolved
            } else {
                // The preview page did not cover the index.
                TokenFetch::Missing
            }
        };
        self.write_info_snapshot();
        Ok(fetch)
    }
}

fn request_page(inner: &Arc<Inner>, index: usize, force: bool) -> Option<PageAnswer> {
    if !inner.queen_alive.load(Ordering::SeqCst) {
        return None;
    }

    let mut state = inner.table.get(index).unwrap_or(PageState::None);
    if force && (state == PageState::Finished || state == PageState::Failed) {
        state = PageState::None;
    }

    match state {
        PageState::None => {
            let pages = inner.table.len();
            if force {
                inner.scheduler.push_force(index);
            } else {
                inner.scheduler.push_request(index, pages);
            }
            // Workers only run once the page count is known; before that the
            // queen spawns them itself after bootstrap.
            if pages.is_some() {
                ensure_workers(inner);
            }
            None
        }
        PageState::Downloading => inner.table.percent(index).map(PageAnswer::Progress),
        PageState::Failed => Some(PageAnswer::Failed(
            inner
                .table
                .error(index)
                .unwrap_or_else(|| ERROR_UNKNOWN.to_string()),
        )),
        PageState::Finished => {
            let mut stack = inner.decode_stack.lock();
            stack.push(index);
            inner.decode_cond.notify_one();
            None
        }
    }
}

/// Fill empty worker slots with fresh threads.
fn ensure_workers(inner: &Arc<Inner>) {
    if inner.cancel.is_cancelled() {
        return;
    }
    let mut pool = inner.workers.lock();
    let slots = pool.get_or_insert_with(|| vec![None; NUMBER_SPIDER_WORKER]);
    for slot in 0..slots.len() {
        if slots[slot].is_none() {
            let id = next_thread_id();
            let name = format!("spider-worker-{}-{}", slot, id);
            let worker_inner = Arc::clone(inner);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker::worker_main(worker_inner, slot, id))
            {
                Ok(_) => slots[slot] = Some(id),
                Err(err) => error!("failed to spawn {}: {}", name, err),
            }
        }
    }
}

fn spawn_decoder(inner: &Arc<Inner>) {
    let name = format!("spider-decoder-{}", next_thread_id());
    let decoder_inner = Arc::clone(inner);
    if let Err(err) = thread::Builder::new()
        .name(name.clone())
        .spawn(move || decoder::decoder_main(decoder_inner))
    {
        error!("failed to spawn {}: {}", name, err);
    }
}

fn queen_main(inner: Arc<Inner>) {
    let name = thread::current()
        .name()
        .unwrap_or("spider-queen")
        .to_string();
    info!("{}: start", name);

    run_queen(&inner);

    // Whoever observes a dead queen must also observe workers and the
    // decoder shutting down.
    inner.queen_alive.store(false, Ordering::SeqCst);
    inner.cancel.cancel();
    *inner.workers.lock() = None;
    inner.wake_all();

    info!("{}: end", name);
}

fn run_queen(inner: &Arc<Inner>) {
    inner.store.set_mode(inner.current_mode());

    let mut info = inner.read_info_from_local();
    if inner.cancel.is_cancelled() {
        return;
    }

    if info.is_none() {
        match inner.fetch_info_from_network() {
            Ok(fetched) => info = Some(fetched),
            Err(err) => warn!(
                "failed to fetch info for gallery {}: {}",
                inner.gallery.gid, err
            ),
        }
    }
    // Startup failure is fatal to the coordinator: consumers see
    // `Size::Error` once the queen is gone.
    let Some(info) = info else {
        return;
    };
    if inner.cancel.is_cancelled() {
        return;
    }

    let pages = info.pages as usize;
    {
        let mut token_state = inner.token_state.lock();
        token_state.info = Some(info);
    }
    inner.write_info_snapshot();
    if inner.cancel.is_cancelled() {
        return;
    }

    inner.table.allocate(pages);
    inner.listeners.notify_get_pages(pages);

    // Requests may have queued up before the page count was known.
    if inner.scheduler.has_pending(pages) {
        ensure_workers(inner);
    }

    spawn_decoder(inner);

    inner.token_loop();
}
