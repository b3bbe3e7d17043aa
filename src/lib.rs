//! Gallery page fetch coordinator.
//!
//! Given a gallery identifier and token, the coordinator discovers how many
//! pages the gallery has, acquires per-page secret tokens (pTokens), resolves
//! each page to an image URL, downloads images concurrently to a page store,
//! and hands decoded images to consumers on demand.
//!
//! The entry point is [`SpiderRegistry`], which hands out reference-counted
//! [`SpiderQueen`] coordinators keyed by gallery id. Consumers post per-page
//! requests through [`SpiderQueen::request`] and observe results through the
//! [`SpiderListener`] surface.

pub mod client;
pub mod config;
pub mod spider;
pub mod store;

pub use client::{ClientError, GalleryParser, HttpTransport, Transport};
pub use config::SpiderConfig;
pub use spider::{
    GalleryInfo, ImageDecoder, Mode, PageAnswer, PageState, Size, SpiderListener, SpiderQueen,
    SpiderRegistry,
};
pub use store::{DirStore, PageStore};
