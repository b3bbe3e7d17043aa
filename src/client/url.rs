//! URL construction and classification for gallery sites.

use url::Url;

use super::{ClientError, ClientResult};

/// Image URL suffixes the site serves when the caller is rate limited.
pub const URL_509_SUFFIX_ARRAY: [&str; 2] = ["/509.gif", "/509s.gif"];

/// URL of a gallery detail page. Page `preview_index` of the preview index
/// is selected with the `p` query parameter.
pub fn detail_url(base: &str, gid: u64, token: &str, preview_index: usize) -> String {
    format!("{}/g/{}/{}/?p={}", base, gid, token, preview_index)
}

/// URL of a single gallery page. Pages are addressed one-based on the wire.
pub fn page_url(base: &str, gid: u64, index: usize, ptoken: &str) -> String {
    format!("{}/s/{}/{}-{}", base, ptoken, gid, index + 1)
}

/// File extension of an image URL, without the dot. Falls back to `jpg`
/// when the URL path carries no extension.
pub fn file_extension(image_url: &str) -> ClientResult<String> {
    let parsed = Url::parse(image_url)?;
    let path = parsed.path();
    let name = path.rsplit('/').next().unwrap_or("");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 => {
            Ok(ext.to_ascii_lowercase())
        }
        _ => Ok("jpg".to_string()),
    }
}

/// Whether an image URL is the rate-limit sentinel.
pub fn is_rate_limited(image_url: &str) -> bool {
    URL_509_SUFFIX_ARRAY
        .iter()
        .any(|suffix| image_url.ends_with(suffix))
}
