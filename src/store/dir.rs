//! Directory-backed page store.
//!
//! Pages are files named `<index+1, zero-padded to 8>.<ext>`. Download mode
//! targets a per-gallery directory under the download root; read mode targets
//! a per-gallery directory under the cache root. Lookups search the download
//! tier first so already-downloaded pages are found while reading.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::RwLock;

use super::{InputPipe, OutputPipe, PageStore, StoreError, StoreResult};
use crate::config::SpiderConfig;
use crate::spider::{GalleryInfo, Mode};

/// Filesystem [`PageStore`] with a download tier and a cache tier.
pub struct DirStore {
    download_dir: PathBuf,
    cache_dir: PathBuf,
    mode: RwLock<Mode>,
}

impl DirStore {
    pub fn new(gallery: &GalleryInfo, config: &SpiderConfig, mode: Mode) -> Self {
        let dir_name = if gallery.title.is_empty() {
            format!("{}-{}", gallery.gid, gallery.token)
        } else {
            format!("{}-{}", gallery.gid, sanitize(&gallery.title))
        };
        DirStore {
            download_dir: config.download_dir.join(dir_name),
            cache_dir: config
                .cache_dir
                .join(format!("{}-{}", gallery.gid, gallery.token)),
            mode: RwLock::new(mode),
        }
    }

    /// Directory writes currently land in.
    fn active_dir(&self) -> &Path {
        match *self.mode.read() {
            Mode::Download => &self.download_dir,
            Mode::Read => &self.cache_dir,
        }
    }

    /// Find the stored file for a page in one tier, whatever its extension.
    fn find_in(dir: &Path, index: usize) -> Option<PathBuf> {
        let stem = page_stem(index);
        let entries = fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str())
                && path.is_file()
            {
                return Some(path);
            }
        }
        None
    }

    fn find(&self, index: usize) -> Option<PathBuf> {
        Self::find_in(&self.download_dir, index).or_else(|| Self::find_in(&self.cache_dir, index))
    }
}

fn page_stem(index: usize) -> String {
    format!("{:08}", index + 1)
}

fn sanitize(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

impl PageStore for DirStore {
    fn set_mode(&self, mode: Mode) {
        *self.mode.write() = mode;
    }

    fn contains(&self, index: usize) -> bool {
        self.find(index).is_some()
    }

    fn open_output_pipe(&self, index: usize, extension: &str) -> Option<Box<dyn OutputPipe>> {
        let dir = self.active_dir();
        if let Err(err) = fs::create_dir_all(dir) {
            warn!("failed to create page directory {}: {}", dir.display(), err);
            return None;
        }
        let extension = if extension.is_empty() { "jpg" } else { extension };
        let path = dir.join(format!("{}.{}", page_stem(index), extension));
        Some(Box::new(FileOutputPipe::new(path)))
    }

    fn open_input_pipe(&self, index: usize) -> Option<Box<dyn InputPipe>> {
        self.find(index)
            .map(|path| Box::new(FileInputPipe::new(path)) as Box<dyn InputPipe>)
    }

    fn remove(&self, index: usize) {
        for dir in [&self.download_dir, &self.cache_dir] {
            if let Some(path) = Self::find_in(dir, index) {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("failed to remove {}: {}", path.display(), err);
                }
            }
        }
    }

    fn download_dir(&self) -> Option<PathBuf> {
        if *self.mode.read() != Mode::Download {
            return None;
        }
        if let Err(err) = fs::create_dir_all(&self.download_dir) {
            warn!(
                "failed to create download directory {}: {}",
                self.download_dir.display(),
                err
            );
            return None;
        }
        Some(self.download_dir.clone())
    }
}

/// Pipe reading a stored page file.
pub struct FileInputPipe {
    path: PathBuf,
    file: Option<File>,
}

impl FileInputPipe {
    fn new(path: PathBuf) -> Self {
        FileInputPipe { path, file: None }
    }
}

impl InputPipe for FileInputPipe {
    fn open(&mut self) -> StoreResult<&mut dyn Read> {
        if self.file.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        let file = File::open(&self.path)?;
        Ok(self.file.insert(file))
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Pipe writing a page file.
pub struct FileOutputPipe {
    path: PathBuf,
    file: Option<File>,
}

impl FileOutputPipe {
    fn new(path: PathBuf) -> Self {
        FileOutputPipe { path, file: None }
    }
}

impl OutputPipe for FileOutputPipe {
    fn open(&mut self) -> StoreResult<&mut dyn Write> {
        if self.file.is_some() {
            return Err(StoreError::AlreadyOpen);
        }
        let file = File::create(&self.path)?;
        Ok(self.file.insert(file))
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store(mode: Mode) -> (tempfile::TempDir, DirStore) {
        let root = tempdir().unwrap();
        let config = SpiderConfig::new(
            root.path().join("downloads"),
            root.path().join("cache"),
            "http://gallery.test",
        );
        let gallery = GalleryInfo::new(42, "deadbeef", "A Test Gallery");
        let store = DirStore::new(&gallery, &config, mode);
        (root, store)
    }

    fn write_page(store: &DirStore, index: usize, data: &[u8]) {
        let mut pipe = store.open_output_pipe(index, "png").unwrap();
        pipe.open().unwrap().write_all(data).unwrap();
        pipe.close();
    }

    #[test]
    fn test_write_then_read_back() {
        let (_root, store) = test_store(Mode::Download);
        assert!(!store.contains(0));

        write_page(&store, 0, b"image bytes");
        assert!(store.contains(0));

        let mut pipe = store.open_input_pipe(0).unwrap();
        let mut data = Vec::new();
        pipe.open().unwrap().read_to_end(&mut data).unwrap();
        pipe.close();
        assert_eq!(data, b"image bytes");
    }

    #[test]
    fn test_downloaded_page_visible_in_read_mode() {
        let (_root, store) = test_store(Mode::Download);
        write_page(&store, 3, b"x");

        store.set_mode(Mode::Read);
        assert!(store.contains(3));
        assert!(store.open_input_pipe(3).is_some());
    }

    #[test]
    fn test_remove_discards_page() {
        let (_root, store) = test_store(Mode::Download);
        write_page(&store, 1, b"partial");
        store.remove(1);
        assert!(!store.contains(1));
        assert!(store.open_input_pipe(1).is_none());
    }

    #[test]
    fn test_double_open_fails() {
        let (_root, store) = test_store(Mode::Download);
        write_page(&store, 0, b"x");

        let mut pipe = store.open_input_pipe(0).unwrap();
        pipe.open().unwrap();
        assert!(matches!(pipe.open(), Err(StoreError::AlreadyOpen)));
        pipe.close();
        assert!(pipe.open().is_ok());
    }

    #[test]
    fn test_download_dir_only_in_download_mode() {
        let (_root, store) = test_store(Mode::Read);
        assert!(store.download_dir().is_none());
        store.set_mode(Mode::Download);
        assert!(store.download_dir().is_some());
    }
}
