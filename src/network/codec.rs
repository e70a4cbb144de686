//! Binary codec for peer-to-peer messages and input rows.
//!
//! Everything that crosses the wire between peers goes through here so that
//! every call site agrees on one bincode configuration: standard with fixed-size
//! integers, which keeps the layout identical on every platform.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::NetplayError;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Errors produced while encoding or decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    EncodeError {
        /// The underlying bincode message.
        message: String,
    },
    /// Deserialization failed.
    DecodeError {
        /// The underlying bincode message.
        message: String,
    },
    /// The output buffer cannot hold the encoded value.
    BufferTooSmall {
        /// Size of the provided buffer.
        provided: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message } => write!(f, "encoding failed: {message}"),
            Self::DecodeError { message } => write!(f, "decoding failed: {message}"),
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::DecodeError { .. } => NetplayError::MalformedMessage {
                context: err.to_string(),
            },
            _ => NetplayError::SerializationError {
                context: err.to_string(),
            },
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a fresh buffer.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::EncodeError {
        message: e.to_string(),
    })
}

/// Encodes a value into `buffer`, returning the number of bytes written.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| {
        let message = e.to_string();
        if message.contains("UnexpectedEnd") || message.contains("not enough") {
            CodecError::BufferTooSmall {
                provided: buffer.len(),
            }
        } else {
            CodecError::EncodeError { message }
        }
    })
}

/// Decodes a value, returning it together with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::DecodeError {
        message: e.to_string(),
    })
}

/// Decodes a value, ignoring trailing bytes.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}
