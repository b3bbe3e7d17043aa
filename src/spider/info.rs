//! Persistent per-gallery metadata.
//!
//! A `SpiderInfo` record remembers the page count, the preview pagination,
//! and every pToken seen so far. It is persisted identically at two
//! locations: `<download_dir>/.ehviewer` and `<cache_dir>/<gid>`, with the
//! download-dir copy preferred on read.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted form of an exhausted pToken.
const TOKEN_FAILED: &str = "failed";

/// Error types for spider info persistence
#[derive(Error, Debug)]
pub enum InfoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed spider info: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("gallery identity mismatch")]
    IdentityMismatch,
}

/// Result type for spider info operations
pub type InfoResult<T> = Result<T, InfoError>;

/// A pToken slot. `Failed` marks an index the token resolver has given up
/// on; a forced request clears it before retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PToken {
    Value(String),
    Failed,
}

/// Per-gallery metadata. The pToken map is kept dense in memory, sized by
/// the page count, and serialized sparsely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderInfo {
    pub gid: u64,
    pub token: String,
    /// Total image count.
    pub pages: u32,
    /// Number of preview index pages.
    pub preview_pages: u32,
    /// Entries per preview index page.
    pub preview_per_page: u32,
    tokens: Vec<Option<PToken>>,
}

#[derive(Serialize, Deserialize)]
struct InfoRecord {
    gid: u64,
    token: String,
    pages: u32,
    preview_pages: u32,
    preview_per_page: u32,
    ptoken_map: BTreeMap<u32, String>,
}

impl SpiderInfo {
    pub fn new(
        gid: u64,
        token: impl Into<String>,
        pages: u32,
        preview_pages: u32,
        preview_per_page: u32,
    ) -> Self {
        SpiderInfo {
            gid,
            token: token.into(),
            pages,
            preview_pages,
            preview_per_page,
            tokens: vec![None; pages as usize],
        }
    }

    pub fn ptoken(&self, index: usize) -> Option<&PToken> {
        self.tokens.get(index).and_then(|slot| slot.as_ref())
    }

    /// Record a pToken. Out-of-range indices are dropped; every valid map
    /// key is below the page count.
    pub fn set_ptoken(&mut self, index: usize, ptoken: PToken) {
        if let Some(slot) = self.tokens.get_mut(index) {
            *slot = Some(ptoken);
        }
    }

    pub fn clear_ptoken(&mut self, index: usize) {
        if let Some(slot) = self.tokens.get_mut(index) {
            *slot = None;
        }
    }

    /// Serialize the record. The transient `WAIT` marker is not a map value
    /// and never reaches disk.
    pub fn to_json(&self) -> InfoResult<String> {
        let mut ptoken_map = BTreeMap::new();
        for (index, slot) in self.tokens.iter().enumerate() {
            let value = match slot {
                Some(PToken::Value(value)) => value.clone(),
                Some(PToken::Failed) => TOKEN_FAILED.to_string(),
                None => continue,
            };
            ptoken_map.insert(index as u32, value);
        }
        let record = InfoRecord {
            gid: self.gid,
            token: self.token.clone(),
            pages: self.pages,
            preview_pages: self.preview_pages,
            preview_per_page: self.preview_per_page,
            ptoken_map,
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn from_json(json: &str) -> InfoResult<Self> {
        let record: InfoRecord = serde_json::from_str(json)?;
        let mut info = SpiderInfo::new(
            record.gid,
            record.token,
            record.pages,
            record.preview_pages,
            record.preview_per_page,
        );
        for (index, value) in record.ptoken_map {
            let ptoken = if value == TOKEN_FAILED {
                PToken::Failed
            } else {
                PToken::Value(value)
            };
            info.set_ptoken(index as usize, ptoken);
        }
        Ok(info)
    }

    /// Read a record and verify it belongs to the expected gallery.
    pub fn read_from(path: &Path, gid: u64, token: &str) -> InfoResult<Self> {
        let json = fs::read_to_string(path)?;
        let info = SpiderInfo::from_json(&json)?;
        if info.gid != gid || info.token != token {
            return Err(InfoError::IdentityMismatch);
        }
        Ok(info)
    }

    pub fn write_to(&self, path: &Path) -> InfoResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
