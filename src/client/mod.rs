//! HTTP client contracts for the spider engine.
//!
//! This module provides:
//! 1. The [`Transport`] trait the engine downloads through
//! 2. [`HttpTransport`], the default `reqwest` implementation
//! 3. The [`GalleryParser`] trait for site-specific HTML parsing
//! 4. The client-side error taxonomy

use std::io::Read;

use log::debug;
use reqwest::blocking::Client;
use thiserror::Error;

use crate::config::SpiderConfig;

pub mod parser;
pub mod url;

pub use parser::{GalleryParser, PageSource, PreviewEntry, PreviewSet};

/// Error types for client operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] ::url::ParseError),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited")]
    RateLimited,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Socket(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Socket(err.to_string())
    }
}

/// A response with its body left as a stream, so image bodies can be copied
/// to the store chunk by chunk.
pub struct StreamedResponse {
    /// Value of the `Content-Length` header, if the server sent one.
    pub content_length: Option<u64>,
    /// The response body.
    pub body: Box<dyn Read + Send>,
}

/// Executes requests for the engine. Implementations must be shareable
/// across the queen and worker threads.
pub trait Transport: Send + Sync {
    /// Execute a GET request and return the response with a streaming body.
    fn get(&self, url: &str) -> ClientResult<StreamedResponse>;

    /// Execute a GET request and buffer the whole body as a string.
    /// Used for HTML pages, which are small.
    fn get_string(&self, url: &str) -> ClientResult<String> {
        let mut response = self.get(url)?;
        let mut body = String::new();
        response.body.read_to_string(&mut body)?;
        Ok(body)
    }
}

/// Default transport over a pooled `reqwest` blocking client.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport from the engine config.
    pub fn new(config: &SpiderConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> ClientResult<StreamedResponse> {
        debug!("GET {}", url);
        let response = self.client.get(url).send()?.error_for_status()?;
        let content_length = response.content_length();
        Ok(StreamedResponse {
            content_length,
            body: Box::new(response),
        })
    }
}
