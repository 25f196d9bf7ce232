// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR encoding for persisted session state, ratchet payloads and data-channel frames.
use std::io::Read;

use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

pub fn decode_cbor<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T, DecodeError> {
    Ok(ciborium::from_reader::<T, R>(reader)?)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("could not write cbor bytes: {0}")]
    Io(std::io::Error),

    #[error("value can not be encoded as cbor: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not read cbor bytes: {0}")]
    Io(std::io::Error),

    #[error("invalid cbor at position {0}")]
    Syntax(usize),

    #[error("unexpected cbor value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    #[error("cbor nesting too deep")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_cbor, encode_cbor};

    #[test]
    fn invalid_input() {
        let bytes = encode_cbor(&(42u64, "murmur".to_string())).unwrap();
        let result: Result<(u64, String), _> = decode_cbor(&bytes[..bytes.len() - 2]);
        assert!(result.is_err());

        let bytes = encode_cbor(&"not a number").unwrap();
        let result: Result<u64, _> = decode_cbor(&bytes[..]);
        assert!(result.is_err());
    }
}
