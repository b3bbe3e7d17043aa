//! The decoder thread and the image decoding contract.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use image::DynamicImage;
use log::info;
use thiserror::Error;

use super::queen::Inner;
use super::{ERROR_DECODING_FAILED, ERROR_NOT_FOUND, ERROR_OUT_OF_RANGE, ERROR_READING_FAILED};

/// Error types for image decoding
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Read(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Decodes a raw byte stream into an in-memory image.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, reader: &mut dyn Read) -> Result<DynamicImage, DecodeError>;
}

/// Default decoder over the `image` crate. Buffers the stream, then lets
/// the crate sniff the format.
pub struct StreamDecoder;

impl ImageDecoder for StreamDecoder {
    fn decode(&self, reader: &mut dyn Read) -> Result<DynamicImage, DecodeError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        image::load_from_memory(&bytes).map_err(|err| DecodeError::Decode(err.to_string()))
    }
}

/// Single consumer of the decode request stack. The stack is LIFO by
/// design: a user scrolling rapidly should see the newest request decoded
/// first.
pub(super) fn decoder_main(inner: Arc<Inner>) {
    let name = thread::current()
        .name()
        .unwrap_or("spider-decoder")
        .to_string();
    info!("{}: start", name);

    'main: loop {
        let index = {
            let mut stack = inner.decode_stack.lock();
            loop {
                if inner.cancel.is_cancelled() {
                    break 'main;
                }
                if let Some(index) = stack.pop() {
                    break index;
                }
                inner.decode_cond.wait(&mut stack);
            }
        };

        if inner.table.len().map_or(true, |pages| index >= pages) {
            inner
                .listeners
                .notify_get_image_failure(index, ERROR_OUT_OF_RANGE);
            continue;
        }

        let Some(mut pipe) = inner.store.open_input_pipe(index) else {
            inner
                .listeners
                .notify_get_image_failure(index, ERROR_NOT_FOUND);
            continue;
        };

        let result = match pipe.open() {
            Ok(reader) => inner.decoder.decode(reader),
            Err(err) => Err(DecodeError::Read(std::io::Error::other(err.to_string()))),
        };
        pipe.close();

        match result {
            Ok(image) => {
                let image = Arc::new(image);
                inner.listeners.notify_get_image_success(index, &image);
            }
            Err(DecodeError::Read(_)) => {
                inner
                    .listeners
                    .notify_get_image_failure(index, ERROR_READING_FAILED);
            }
            Err(DecodeError::Decode(_)) => {
                inner
                    .listeners
                    .notify_get_image_failure(index, ERROR_DECODING_FAILED);
            }
        }
    }

    info!("{}: end", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_decoder_accepts_png() {
        // Smallest valid 1x1 PNG.
        let mut png = Vec::new();
        image::DynamicImage::new_rgba8(1, 1)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let decoded = StreamDecoder.decode(&mut Cursor::new(png)).unwrap();
        assert_eq!(decoded.width(), 1);
        assert_eq!(decoded.height(), 1);
    }

    #[test]
    fn test_stream_decoder_rejects_garbage() {
        let result = StreamDecoder.decode(&mut Cursor::new(b"not an image".to_vec()));
        assert!(matches!(result, Err(DecodeError::Decode(_))));
    }
}
