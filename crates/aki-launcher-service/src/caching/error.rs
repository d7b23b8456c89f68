use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// An error that happens while storing or loading a cache payload.
///
/// Apart from [`EmptyKey`](Self::EmptyKey), these errors never reach the caller of a
/// [`CachingProvider`](super::CachingProvider). They are logged and folded into a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache key was empty.
    #[error("cache key must not be empty")]
    EmptyKey,
    /// Reading or writing the payload failed.
    #[error("failed to access cache payload")]
    Io(#[from] io::Error),
    /// The payload could not be converted from or to JSON.
    #[error("failed to (de)serialize cache payload")]
    Serialization(#[from] serde_json::Error),
    /// The payload is not valid UTF-8 text.
    #[error("cached text is not valid UTF-8")]
    InvalidUtf8(#[from] FromUtf8Error),
    /// The stored value has a different type than the requested one.
    #[error("cached value is not a `{0}`")]
    TypeMismatch(&'static str),
}

pub(super) fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::EmptyKey);
    }
    Ok(())
}
