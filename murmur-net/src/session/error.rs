// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use murmur_encryption::GroupId;
use murmur_encryption::cbor::{DecodeError, EncodeError};
use murmur_encryption::crypto::RngError;
use murmur_encryption::key_store::KeyStoreError;
use thiserror::Error;

use crate::PeerId;
use crate::connection::{ConnectionError, ConnectionFailure};

/// Errors of outgoing session operations.
///
/// Cryptographic failures carry no details, their cause is only logged at trace level.
#[derive(Debug, Error)]
pub enum SendError {
    /// No direct connection could be established. The failure names the state the attempt got
    /// stuck in.
    #[error("could not connect to {peer}: {failure}")]
    ConnectionFailed {
        peer: PeerId,
        failure: ConnectionFailure,
    },

    /// The peer could not be authenticated.
    #[error("connection to {peer} denied: {reason}")]
    ConnectionDenied { peer: PeerId, reason: String },

    #[error(transparent)]
    Connection(ConnectionError),

    #[error("no pre-key bundle published by {0}")]
    NoBundle(PeerId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("message could not be delivered to {0:?}")]
    PartialDelivery(Vec<PeerId>),

    #[error("encryption failed")]
    Crypto,

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync>),

    #[error("bundle directory error: {0}")]
    Directory(Box<dyn Error + Send + Sync>),
}

impl SendError {
    pub(crate) fn connection(peer: PeerId, err: ConnectionError) -> Self {
        match err {
            ConnectionError::Failed(failure) => Self::ConnectionFailed { peer, failure },
            err => Self::Connection(err),
        }
    }

    pub(crate) fn store<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Store(Box::new(err))
    }
}

/// Reasons an incoming message was dropped.
#[derive(Debug, Error)]
pub(crate) enum ReceiveError {
    #[error("peer authenticated as {actual} instead of {expected}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("no session with {0}")]
    NoSession(PeerId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("decryption failed")]
    Crypto,

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync>),
}

impl ReceiveError {
    pub(crate) fn store<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Store(Box::new(err))
    }
}
