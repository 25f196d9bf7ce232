// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 signatures, used for long-term identities and sender-key chains.
use std::fmt;

use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::secret::Secret;
use crate::crypto::{Rng, RngError};

pub const SIGNING_KEY_SIZE: usize = 32;

pub const VERIFYING_KEY_SIZE: usize = 32;

pub const SIGNATURE_SIZE: usize = 64;

/// Secret Ed25519 key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey(Secret<SIGNING_KEY_SIZE>);

impl SigningKey {
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::from_bytes(rng.random_array()?)))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        VerifyingKey(signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.0.as_bytes());
        Signature(signing_key.sign(bytes).to_bytes())
    }
}

/// Public Ed25519 key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde(with = "serde_bytes")] [u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verifies a signature, rejecting malleable and small-order encodings.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(bytes, &signature)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl fmt::Display for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 512-bit Ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid ed25519 public key")]
    InvalidKey,

    #[error("signature does not match public key and bytes")]
    VerificationFailed,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{SignatureError, SigningKey};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);
        let signing_key = SigningKey::generate(&rng).unwrap();
        let signature = signing_key.sign(b"Hello, Murmur!");

        assert!(
            signing_key
                .verifying_key()
                .verify(b"Hello, Murmur!", &signature)
                .is_ok()
        );
    }

    #[test]
    fn failed_verify() {
        let rng = Rng::from_seed([1; 32]);
        let signing_key = SigningKey::generate(&rng).unwrap();
        let other_key = SigningKey::generate(&rng).unwrap();
        let signature = signing_key.sign(b"Hello, Murmur!");

        assert!(matches!(
            signing_key
                .verifying_key()
                .verify(b"Invalid Data", &signature),
            Err(SignatureError::VerificationFailed)
        ));
        assert!(matches!(
            other_key.verifying_key().verify(b"Hello, Murmur!", &signature),
            Err(SignatureError::VerificationFailed)
        ));
    }
}
