// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-term identities of peers.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};

/// Long-term key material of the local user.
///
/// Consists of a signing key pair (Ed25519) to authenticate pre-keys and a Diffie-Hellman key pair
/// (X25519) taking part in every X3DH handshake. It is immutable once generated; the secret halves
/// are wiped from memory on drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    dh_secret: SecretKey,
}

impl IdentityKeyPair {
    /// Generates a fresh identity.
    ///
    /// Fails only if the entropy source is broken, which should be treated as fatal.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self {
            signing_key: SigningKey::generate(rng)?,
            dh_secret: SecretKey::generate(rng)?,
        })
    }

    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            verifying_key: self.signing_key.verifying_key(),
            dh_key: self.dh_secret.public_key(),
        }
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    pub(crate) fn dh_secret(&self) -> &SecretKey {
        &self.dh_secret
    }
}

/// Public identity of a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    verifying_key: VerifyingKey,
    dh_key: PublicKey,
}

impl IdentityKey {
    pub fn new(verifying_key: VerifyingKey, dh_key: PublicKey) -> Self {
        Self {
            verifying_key,
            dh_key,
        }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn dh_key(&self) -> &PublicKey {
        &self.dh_key
    }

    /// Bytes identifying this peer, used as associated data in handshakes.
    pub fn to_bytes(self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.verifying_key.as_bytes());
        bytes[32..].copy_from_slice(self.dh_key.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        let mut verifying_key = [0u8; 32];
        let mut dh_key = [0u8; 32];
        verifying_key.copy_from_slice(&bytes[..32]);
        dh_key.copy_from_slice(&bytes[32..]);
        Self {
            verifying_key: VerifyingKey::from_bytes(verifying_key),
            dh_key: PublicKey::from_bytes(dh_key),
        }
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self, IdentityError> {
        let bytes: [u8; 64] = hex::decode(value)?
            .try_into()
            .map_err(|bytes: Vec<u8>| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Short, human-readable fingerprint.
    pub fn fingerprint(&self) -> String {
        self.verifying_key.to_hex()[..16].to_string()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verifying_key)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("identity key has {0} bytes, expected 64")]
    InvalidLength(usize),
}
