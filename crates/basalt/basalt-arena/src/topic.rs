//! Topic-to-path mapping.
//!
//! A logical topic maps to a file path by substituting `{topic}` into a
//! template (see `basalt_core::env` for the configured templates).
//! Substitution is purely textual.

use basalt_core::{Error, Result};

/// Validate `topic` and substitute it into `tmpl`.
///
/// A topic must be nonempty and must not start with `/`.
pub fn resolve(tmpl: &str, topic: &str) -> Result<String> {
    if topic.is_empty() {
        return Err(Error::BadTopic(topic.to_string()));
    }
    if topic.starts_with('/') {
        return Err(Error::BadTopic(topic.to_string()));
    }
    Ok(tmpl.replace("{topic}", topic))
}
