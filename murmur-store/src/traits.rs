// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Interface for persisting the ratchet state of 1:1 sessions.
///
/// **Important:** The session layer saves a state _before_ it emits the ciphertext or delivers
/// the plaintext derived from it. Implementations must only return from `save_session` once the
/// state is durably written, otherwise a crash could lead to message key re-use.
pub trait SessionStore<ID, S> {
    type Error: Error + Send + Sync + 'static;

    /// Returns the session state for a peer or `None` if we never talked to them.
    fn load_session(&self, id: &ID)
    -> impl Future<Output = Result<Option<S>, Self::Error>> + Send;

    /// Inserts or replaces the session state of a peer.
    fn save_session(
        &self,
        id: &ID,
        state: S,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Interface for persisting the local key material.
pub trait KeyStorage<K> {
    type Error: Error + Send + Sync + 'static;

    /// Returns the stored key material or `None` if no identity was generated yet.
    fn load_keys(&self) -> impl Future<Output = Result<Option<K>, Self::Error>> + Send;

    fn save_keys(&self, keys: K) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Interface for persisting the sender-key state of groups.
pub trait GroupStore<GID, G> {
    type Error: Error + Send + Sync + 'static;

    fn load_group(&self, id: &GID)
    -> impl Future<Output = Result<Option<G>, Self::Error>> + Send;

    fn save_group(
        &self,
        id: &GID,
        state: G,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Append-only log of messages which passed through a session.
pub trait MessageLog<ID> {
    type Error: Error + Send + Sync + 'static;

    /// Appends an entry for a sent or received message.
    fn record_message(
        &self,
        id: &ID,
        direction: Direction,
        counter: u64,
        ciphertext_ref: CiphertextRef,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns all entries of a peer in the order they were recorded.
    fn messages(
        &self,
        id: &ID,
    ) -> impl Future<Output = Result<Vec<MessageRecord<ID>>, Self::Error>> + Send;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Content address (SHA-256) of a ciphertext.
///
/// The log only stores this reference, the ciphertext itself stays with whatever layer keeps the
/// message history.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CiphertextRef(#[serde(with = "serde_bytes")] [u8; 32]);

impl CiphertextRef {
    pub fn from_ciphertext(ciphertext: &[u8]) -> Self {
        Self(Sha256::digest(ciphertext).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CiphertextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CiphertextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CiphertextRef({})", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord<ID> {
    pub id: ID,
    pub direction: Direction,
    pub counter: u64,
    pub ciphertext_ref: CiphertextRef,
}
