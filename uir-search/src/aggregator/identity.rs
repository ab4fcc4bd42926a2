//! Cross-provider result identity.
//!
//! Provider ids are only unique inside one provider, so fusion keys results
//! on a computed identity instead:
//!
//! 1. `url:` + the canonical URL, when the result has a non-empty URL;
//! 2. otherwise `content:` + a SHA-256 of the lower-cased,
//!    whitespace-collapsed title and content prefix;
//! 3. otherwise `id:` + the provider-qualified id.
//!
//! The content hash is a heuristic. Two distinct documents with the same
//! leading text will merge.

use sha2::{Digest, Sha256};

use crate::types::SearchResult;

use super::url_normalize::normalize_url;

/// Characters of normalised title and content that feed the content hash.
pub const CONTENT_PREFIX_CHARS: usize = 512;

/// Compute the identity key for `result`.
pub fn identity_key(result: &SearchResult) -> String {
    if let Some(url) = result.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return format!("url:{}", normalize_url(url));
    }

    let text = normalized_text(result);
    if !text.is_empty() {
        let digest = Sha256::digest(text.as_bytes());
        return format!("content:{digest:x}");
    }

    format!("id:{}:{}", result.provider, result.id)
}

/// Lower-cased title and content with whitespace runs collapsed, cut to
/// [`CONTENT_PREFIX_CHARS`] characters.
fn normalized_text(result: &SearchResult) -> String {
    let title = result.title.as_deref().unwrap_or_default();
    let content = result.content.as_deref().unwrap_or_default();
    title
        .split_whitespace()
        .chain(content.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(CONTENT_PREFIX_CHARS)
        .collect()
}
