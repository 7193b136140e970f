use thiserror::Error;

/// Errors produced while decoding bencode data.
///
/// Encoding cannot fail: [`Value`](super::Value) only admits the four bencode
/// kinds, so every value has a canonical wire form. Decoding reports a single
/// error kind carrying the byte offset at which the grammar broke down.
///
/// # Examples
///
/// ```
/// use dhtscout::bencode::{decode, BencodeError};
///
/// let err = decode(b"i42").unwrap_err();
/// assert!(matches!(err, BencodeError::Malformed { .. }));
///
/// let err = decode(b"i007e").unwrap_err();
/// assert!(matches!(err, BencodeError::Malformed { offset: 1, .. }));
/// ```
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Grammar violation, truncation, or unterminated container.
    #[error("malformed bencode at offset {offset}: {reason}")]
    Malformed {
        /// Byte position where the violation was detected.
        offset: usize,
        /// Short description of the violation.
        reason: &'static str,
    },
}

impl BencodeError {
    pub(crate) fn at(offset: usize, reason: &'static str) -> Self {
        BencodeError::Malformed { offset, reason }
    }
}
