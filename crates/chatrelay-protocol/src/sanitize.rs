//! Content sanitization and validation.
//!
//! Content is stripped of markup before any length rule applies, so a message
//! that is only markup counts as empty.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::message::ErrorCode;

/// `<script>` and `<style>` elements including their bodies. An element that
/// never closes swallows the rest of the input.
static RAW_TEXT_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?(?:</(?:script|style)\s*>|$)")
        .expect("raw text element pattern")
});

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?(?:-->|$)").expect("comment pattern"));

/// Any start, end or declaration tag, attributes included. A tag cut off at the
/// end of the input is removed too.
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[/!?]?[a-zA-Z][^>]*(?:>|$)").expect("tag pattern"));

/// Strip markup from `content` and trim surrounding whitespace.
///
/// Removal repeats until nothing matches, so tags assembled from the pieces of
/// other tags (`<<b>script>`) do not survive.
pub fn sanitize(content: &str) -> String {
    let mut current = content.to_string();
    loop {
        let stripped = RAW_TEXT_ELEMENT.replace_all(&current, "");
        let stripped = COMMENT.replace_all(&stripped, "");
        let stripped = TAG.replace_all(&stripped, "").into_owned();
        if stripped == current {
            break;
        }
        current = stripped;
    }
    current.trim().to_string()
}

/// Content rejected by [`validate_content`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("content is empty")]
    Empty,

    #[error("content is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
}

impl ContentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Empty => ErrorCode::EmptyContent,
            Self::TooLong { .. } => ErrorCode::ContentTooLong,
        }
    }
}

/// Sanitize `raw` and check it against the content ceiling (in bytes).
pub fn validate_content(raw: &str, max_bytes: usize) -> Result<String, ContentError> {
    let content = sanitize(raw);
    if content.is_empty() {
        return Err(ContentError::Empty);
    }
    if content.len() > max_bytes {
        return Err(ContentError::TooLong {
            len: content.len(),
            max: max_bytes,
        });
    }
    Ok(content)
}
