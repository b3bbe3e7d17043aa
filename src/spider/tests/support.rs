//! Scripted collaborators for engine tests.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use image::DynamicImage;
use parking_lot::Mutex;

use crate::client::parser::{GalleryParser, PageSource, PreviewEntry, PreviewSet};
use crate::client::{url, ClientError, ClientResult, StreamedResponse, Transport};
use crate::config::SpiderConfig;
use crate::spider::{
    DecodeError, GalleryInfo, ImageDecoder, Mode, SpiderListener, SpiderQueen,
};
use crate::store::{InputPipe, OutputPipe, PageStore, StoreError, StoreResult};

pub const BASE_URL: &str = "http://gallery.test";

/// Poll a predicate until it holds, or fail the test.
pub fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

/// Scripted response for one URL.
#[derive(Clone)]
pub enum MockBody {
    Text(String),
    Bytes(Vec<u8>),
    /// Endless trickle of bytes; parks a worker mid-stream.
    Slow,
    SocketError,
}

/// Transport serving scripted bodies and counting hits per URL.
pub struct MockTransport {
    routes: Mutex<HashMap<String, MockBody>>,
    hits: DashMap<String, usize>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            routes: Mutex::new(HashMap::new()),
            hits: DashMap::new(),
        })
    }

    pub fn route(&self, url: impl Into<String>, body: MockBody) {
        self.routes.lock().insert(url.into(), body);
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.get(url).map(|count| *count.value()).unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str) -> ClientResult<StreamedResponse> {
        *self.hits.entry(url.to_string()).or_insert(0) += 1;
        let body = self.routes.lock().get(url).cloned();
        match body {
            None => Err(ClientError::Socket(format!("no route for {}", url))),
            Some(MockBody::Text(text)) => Ok(StreamedResponse {
                content_length: Some(text.len() as u64),
                body: Box::new(Cursor::new(text.into_bytes())),
            }),
            Some(MockBody::Bytes(bytes)) => Ok(StreamedResponse {
                content_length: Some(bytes.len() as u64),
                body: Box::new(Cursor::new(bytes)),
            }),
            Some(MockBody::Slow) => Ok(StreamedResponse {
                content_length: None,
                body: Box::new(SlowReader),
            }),
            Some(MockBody::SocketError) => Err(ClientError::Socket("scripted failure".into())),
        }
    }
}

struct SlowReader;

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(5));
        let len = buf.len().min(64);
        buf[..len].fill(0xAB);
        Ok(len)
    }
}

/// Parser over a trivial line format:
///
/// ```text
/// pages=10
/// preview_pages=1
/// previews=0:tok0,1:tok1
/// ```
pub struct MockParser;

fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
}

impl GalleryParser for MockParser {
    fn parse_pages(&self, body: &str) -> ClientResult<usize> {
        field(body, "pages")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| ClientError::Parse("pages".into()))
    }

    fn parse_preview_pages(&self, body: &str) -> ClientResult<usize> {
        field(body, "preview_pages")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| ClientError::Parse("preview_pages".into()))
    }

    fn parse_preview_set(&self, body: &str) -> ClientResult<PreviewSet> {
        let raw = field(body, "previews").ok_or_else(|| ClientError::Parse("previews".into()))?;
        let mut entries = Vec::new();
        for part in raw.split(',').filter(|part| !part.is_empty()) {
            let (index, ptoken) = part
                .split_once(':')
                .ok_or_else(|| ClientError::Parse("preview entry".into()))?;
            entries.push(PreviewEntry {
                index: index
                    .parse()
                    .map_err(|_| ClientError::Parse("preview index".into()))?,
                ptoken: ptoken.to_string(),
            });
        }
        Ok(PreviewSet::new(entries))
    }

    fn parse_page(&self, body: &str) -> ClientResult<PageSource> {
        let image_url = field(body, "image").ok_or_else(|| ClientError::Parse("image".into()))?;
        Ok(PageSource {
            image_url: image_url.to_string(),
            skip_hath_key: field(body, "skip").map(String::from),
        })
    }
}

pub fn detail_body(pages: usize, preview_pages: usize, entries: &[(usize, String)]) -> String {
    let previews = entries
        .iter()
        .map(|(index, ptoken)| format!("{}:{}", index, ptoken))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "pages={}\npreview_pages={}\npreviews={}\n",
        pages, preview_pages, previews
    )
}

pub fn page_body(image_url: &str, skip: Option<&str>) -> String {
    match skip {
        Some(key) => format!("image={}\nskip={}\n", image_url, key),
        None => format!("image={}\n", image_url),
    }
}

/// In-memory page store recording removals.
pub struct MemStore {
    pages: Arc<DashMap<usize, Vec<u8>>>,
    removed: Arc<Mutex<Vec<usize>>>,
    mode: Mutex<Option<Mode>>,
    fail_output: AtomicBool,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore {
            pages: Arc::new(DashMap::new()),
            removed: Arc::new(Mutex::new(Vec::new())),
            mode: Mutex::new(None),
            fail_output: AtomicBool::new(false),
        })
    }

    pub fn insert_page(&self, index: usize, data: Vec<u8>) {
        self.pages.insert(index, data);
    }

    pub fn removed_contains(&self, index: usize) -> bool {
        self.removed.lock().contains(&index)
    }

    pub fn set_fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    pub fn last_mode(&self) -> Option<Mode> {
        *self.mode.lock()
    }
}

impl PageStore for MemStore {
    fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = Some(mode);
    }

    fn contains(&self, index: usize) -> bool {
        self.pages.contains_key(&index)
    }

    fn open_output_pipe(&self, index: usize, _extension: &str) -> Option<Box<dyn OutputPipe>> {
        if self.fail_output.load(Ordering::SeqCst) {
            return None;
        }
        Some(Box::new(MemOutputPipe {
            pages: Arc::clone(&self.pages),
            index,
            buffer: None,
        }))
    }

    fn open_input_pipe(&self, index: usize) -> Option<Box<dyn InputPipe>> {
        self.pages.get(&index).map(|data| {
            Box::new(MemInputPipe {
                data: data.value().clone(),
                reader: None,
            }) as Box<dyn InputPipe>
        })
    }

    fn remove(&self, index: usize) {
        self.pages.remove(&index);
        self.removed.lock().push(index);
    }

    fn download_dir(&self) -> Option<PathBuf> {
        None
    }
}

struct MemOutputPipe {
    pages: Arc<DashMap<usize, Vec<u8>>>,
    index: usize,
    buffer: Option<Vec<u8>>,
}

impl OutputPipe for MemOutputPipe {
    fn open(&mut self) -> StoreResult<&mut dyn Write> {
        if self.buffer.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        Ok(self.buffer.insert(Vec::new()))
    }

    fn close(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pages.insert(self.index, buffer);
        }
    }
}

struct MemInputPipe {
    data: Vec<u8>,
    reader: Option<Cursor<Vec<u8>>>,
}

impl InputPipe for MemInputPipe {
    fn open(&mut self) -> StoreResult<&mut dyn Read> {
        if self.reader.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        Ok(self.reader.insert(Cursor::new(self.data.clone())))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Decoder that treats any non-empty buffer except `garbage` as a 1x1 image.
pub struct TestDecoder;

impl ImageDecoder for TestDecoder {
    fn decode(&self, reader: &mut dyn Read) -> Result<DynamicImage, DecodeError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        if bytes.is_empty() || bytes.as_slice() == b"garbage" {
            return Err(DecodeError::Decode("unrecognized image data".into()));
        }
        Ok(DynamicImage::new_rgba8(1, 1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Pages(usize),
    Rate509(usize),
    Success(usize),
    Failure(usize, String),
    ImageSuccess(usize),
    ImageFailure(usize, String),
}

/// Listener recording every event.
#[derive(Default)]
pub struct CollectingListener {
    events: Mutex<Vec<Event>>,
    downloads: Mutex<Vec<(usize, u64)>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(CollectingListener::default())
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn has(&self, event: &Event) -> bool {
        self.events.lock().contains(event)
    }

    pub fn download_count(&self, index: usize) -> usize {
        self.downloads
            .lock()
            .iter()
            .filter(|(event_index, _)| *event_index == index)
            .count()
    }
}

impl SpiderListener for CollectingListener {
    fn on_get_pages(&self, pages: usize) {
        self.events.lock().push(Event::Pages(pages));
    }

    fn on_get_509(&self, index: usize) {
        self.events.lock().push(Event::Rate509(index));
    }

    fn on_download(
        &self,
        index: usize,
        _content_length: Option<u64>,
        received_size: u64,
        _bytes_read: usize,
    ) {
        self.downloads.lock().push((index, received_size));
    }

    fn on_success(&self, index: usize) {
        self.events.lock().push(Event::Success(index));
    }

    fn on_failure(&self, index: usize, error: &str) {
        self.events.lock().push(Event::Failure(index, error.to_string()));
    }

    fn on_get_image_success(&self, index: usize, _image: &Arc<DynamicImage>) {
        self.events.lock().push(Event::ImageSuccess(index));
    }

    fn on_get_image_failure(&self, index: usize, error: &str) {
        self.events
            .lock()
            .push(Event::ImageFailure(index, error.to_string()));
    }
}

/// One gallery's worth of scripted collaborators.
pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemStore>,
    pub listener: Arc<CollectingListener>,
    pub config: SpiderConfig,
    pub gallery: GalleryInfo,
    _tmp: tempfile::TempDir,
}

pub fn ptoken(index: usize) -> String {
    format!("tok{}", index)
}

pub fn image_url(index: usize) -> String {
    format!("http://img.test/{:08}.png", index + 1)
}

pub fn page_bytes(index: usize) -> Vec<u8> {
    vec![index as u8 + 1; 64]
}

impl Harness {
    pub fn new(gid: u64) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = tempfile::tempdir().unwrap();
        let config = SpiderConfig::new(
            tmp.path().join("downloads"),
            tmp.path().join("cache"),
            BASE_URL,
        );
        Harness {
            transport: MockTransport::new(),
            store: MemStore::new(),
            listener: CollectingListener::new(),
            config,
            gallery: GalleryInfo::new(gid, format!("token{}", gid), "Test Gallery"),
            _tmp: tmp,
        }
    }

    pub fn build_queen(&self) -> SpiderQueen {
        let queen = SpiderQueen::new(
            self.gallery.clone(),
            self.config.clone(),
            Arc::clone(&self.store) as Arc<dyn PageStore>,
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::new(MockParser),
            Arc::new(TestDecoder),
        );
        queen.add_listener(Arc::clone(&self.listener) as Arc<dyn SpiderListener>);
        queen
    }

    pub fn detail_url(&self, preview_index: usize) -> String {
        url::detail_url(BASE_URL, self.gallery.gid, &self.gallery.token, preview_index)
    }

    pub fn page_url(&self, index: usize) -> String {
        url::page_url(BASE_URL, self.gallery.gid, index, &ptoken(index))
    }

    pub fn route_detail(
        &self,
        preview_index: usize,
        pages: usize,
        preview_pages: usize,
        entries: &[(usize, String)],
    ) {
        self.transport.route(
            self.detail_url(preview_index),
            MockBody::Text(detail_body(pages, preview_pages, entries)),
        );
    }

    pub fn route_page(&self, index: usize, image: &str, skip: Option<&str>) {
        self.transport.route(
            self.page_url(index),
            MockBody::Text(page_body(image, skip)),
        );
    }

    pub fn route_image(&self, image: &str, bytes: Vec<u8>) {
        self.transport.route(image, MockBody::Bytes(bytes));
    }

    /// Script a whole gallery: one preview page covering every index, one
    /// image per page.
    pub fn route_simple_gallery(&self, pages: usize) {
        let entries: Vec<(usize, String)> = (0..pages).map(|index| (index, ptoken(index))).collect();
        self.route_detail(0, pages, 1, &entries);
        for index in 0..pages {
            self.route_page(index, &image_url(index), None);
            self.route_image(&image_url(index), page_bytes(index));
        }
    }
}
