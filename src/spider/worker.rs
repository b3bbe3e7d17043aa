//! Worker threads: turn a page index into a stored image file.
//!
//! A worker repeatedly pops an index off the scheduler, claims the page,
//! waits for its pToken, resolves the image URL, and streams the body into
//! the store. It retires when every queue is dry and is respawned on the
//! next request.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use super::info::PToken;
use super::queen::Inner;
use super::state::PageState;
use super::{
    DOWNLOAD_ATTEMPTS, DOWNLOAD_BUFFER_SIZE, ERROR_509, ERROR_INVALID_URL, ERROR_PARSE,
    ERROR_PTOKEN, ERROR_SOCKET, ERROR_WRITE_FAILED,
};
use crate::client::parser::PageSource;
use crate::client::{url, ClientError, ClientResult};
use crate::store::OutputPipe;

/// Page error text for a failed client call.
fn error_text(error: &ClientError) -> &'static str {
    match error {
        ClientError::InvalidUrl(_) => ERROR_INVALID_URL,
        ClientError::Socket(_) => ERROR_SOCKET,
        ClientError::Parse(_) => ERROR_PARSE,
        ClientError::RateLimited => ERROR_509,
    }
}

pub(super) fn worker_main(inner: Arc<Inner>, slot: usize, id: u64) {
    let name = thread::current()
        .name()
        .unwrap_or("spider-worker")
        .to_string();
    info!("{}: start", name);

    while !inner.cancel.is_cancelled() && run_once(&inner) {}

    // Clear the slot, but only while it still references this worker; the
    // queen may have torn the table down or repopulated the slot.
    {
        let mut pool = inner.workers.lock();
        if let Some(slots) = pool.as_mut() {
            if slots.get(slot).copied().flatten() == Some(id) {
                slots[slot] = None;
            }
        }
    }

    info!("{}: end", name);
}

// false tells the worker loop to stop.
fn run_once(inner: &Arc<Inner>) -> bool {
    let Some(pages) = inner.table.len() else {
        return false;
    };

    let Some((index, force)) = inner.scheduler.dequeue(pages) else {
        // Every queue is dry; this worker retires.
        return false;
    };
    // Consumers may queue invalid indices.
    if index >= pages {
        return true;
    }

    if !inner.table.try_begin(index, force) {
        // Another worker owns the page, or it is already settled.
        return true;
    }

    if !force && inner.store.contains(index) {
        inner.update_page_state(index, PageState::Finished, None);
        return true;
    }

    // A forced request gets a fresh shot at token resolution.
    if force {
        let mut token_state = inner.token_state.lock();
        if let Some(info) = token_state.info.as_mut() {
            if info.ptoken(index) == Some(&PToken::Failed) {
                info.clear_ptoken(index);
            }
        }
    }

    // Wait for a pToken, asking the queen to resolve it when unknown.
    let ptoken = {
        let mut token_state = inner.token_state.lock();
        loop {
            if inner.cancel.is_cancelled() {
                break None;
            }
            let known = token_state
                .info
                .as_ref()
                .and_then(|info| info.ptoken(index))
                .cloned();
            match known {
                Some(ptoken) => break Some(ptoken),
                None => {
                    token_state.requests.push_back(index);
                    inner.queen_cond.notify_one();
                    inner.worker_cond.wait(&mut token_state);
                }
            }
        }
    };

    let ptoken = match ptoken {
        None => {
            // Cancelled while waiting.
            debug!("worker interrupted waiting for pToken of page {}", index);
            inner.update_page_state(index, PageState::Failed, None);
            return false;
        }
        Some(PToken::Failed) => {
            inner.update_page_state(index, PageState::Failed, Some(ERROR_PTOKEN));
            return true;
        }
        Some(PToken::Value(ptoken)) => ptoken,
    };

    download_image(inner, index, &ptoken)
}

// false tells the worker loop to stop.
fn download_image(inner: &Arc<Inner>, index: usize, ptoken: &str) -> bool {
    let mut skip_hath_key: Option<String> = None;
    let mut error: Option<&'static str> = None;
    let mut interrupt = false;

    for _attempt in 0..DOWNLOAD_ATTEMPTS {
        let source = match resolve_image_url(inner, index, ptoken, skip_hath_key.as_deref()) {
            Ok(source) => source,
            Err(err) => {
                error = Some(error_text(&err));
                break;
            }
        };
        if inner.cancel.is_cancelled() {
            interrupt = true;
            break;
        }

        debug!("{}", source.image_url);
        skip_hath_key = source.skip_hath_key.clone();

        let extension = match url::file_extension(&source.image_url) {
            Ok(extension) => extension,
            Err(err) => {
                error = Some(error_text(&err));
                break;
            }
        };

        let Some(mut pipe) = inner.store.open_output_pipe(index, &extension) else {
            error = Some(ERROR_WRITE_FAILED);
            break;
        };

        match stream_body(inner, index, &source.image_url, pipe.as_mut()) {
            StreamOutcome::Done => {
                debug!("downloaded image {}", index);
                inner.update_page_state(index, PageState::Finished, None);
                return true;
            }
            StreamOutcome::Interrupted => {
                interrupt = true;
                break;
            }
            StreamOutcome::Failed(message) => {
                // A broken stream is the one failure worth a second attempt,
                // through the bypass key if the page offered one.
                error = Some(message);
            }
        }
    }

    // Discard whatever made it into the store.
    inner.store.remove(index);
    inner.update_page_state(index, PageState::Failed, error);
    !interrupt
}

/// Resolve a page to its image URL, firing the 509 signal when the remote
/// rate-limited us.
fn resolve_image_url(
    inner: &Arc<Inner>,
    index: usize,
    ptoken: &str,
    skip_hath_key: Option<&str>,
) -> ClientResult<PageSource> {
    let mut page_url = url::page_url(&inner.config.base_url, inner.gallery.gid, index, ptoken);
    if let Some(key) = skip_hath_key {
        page_url.push_str("?nl=");
        page_url.push_str(key);
    }
    debug!("{}", page_url);

    let body = inner.transport.get_string(&page_url)?;
    let source = inner.parser.parse_page(&body)?;
    if url::is_rate_limited(&source.image_url) {
        inner.listeners.notify_get_509(index);
        return Err(ClientError::RateLimited);
    }
    Ok(source)
}

enum StreamOutcome {
    Done,
    Interrupted,
    Failed(&'static str),
}

/// Stream the image body into the pipe, publishing progress per chunk.
fn stream_body(
    inner: &Arc<Inner>,
    index: usize,
    image_url: &str,
    pipe: &mut dyn OutputPipe,
) -> StreamOutcome {
    let response = match inner.transport.get(image_url) {
        Ok(response) => response,
        Err(err) => {
            pipe.close();
            return StreamOutcome::Failed(error_text(&err));
        }
    };
    let content_length = response.content_length;
    let mut body = response.body;

    let outcome = match pipe.open() {
        Err(err) => {
            warn!("failed to open output pipe for page {}: {}", index, err);
            StreamOutcome::Failed(ERROR_WRITE_FAILED)
        }
        Ok(sink) => {
            let mut buffer = [0u8; DOWNLOAD_BUFFER_SIZE];
            let mut received: u64 = 0;
            loop {
                if inner.cancel.is_cancelled() {
                    break StreamOutcome::Interrupted;
                }
                let bytes_read = match body.read(&mut buffer) {
                    Ok(0) => {
                        if let Err(err) = sink.flush() {
                            warn!("flush failed for page {}: {}", index, err);
                            break StreamOutcome::Failed(ERROR_SOCKET);
                        }
                        if inner.cancel.is_cancelled() {
                            break StreamOutcome::Interrupted;
                        }
                        break StreamOutcome::Done;
                    }
                    Ok(bytes_read) => bytes_read,
                    Err(_) => break StreamOutcome::Failed(ERROR_SOCKET),
                };
                if sink.write_all(&buffer[..bytes_read]).is_err() {
                    break StreamOutcome::Failed(ERROR_SOCKET);
                }
                received += bytes_read as u64;
                if let Some(total) = content_length {
                    if total > 0 {
                        inner.table.set_percent(index, received as f32 / total as f32);
                    }
                }
                inner
                    .listeners
                    .notify_download(index, content_length, received, bytes_read);
            }
        }
    };
    pipe.close();
    outcome
}
