// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public pre-key bundles which allow peers to start a session with us while we are offline.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::ed25519::{Signature, SignatureError};
use crate::crypto::x25519::PublicKey;
use crate::identity::{IdentityKey, IdentityKeyPair};

/// Domain separator for pre-key signatures.
const PREKEY_SIGNATURE_CONTEXT: &[u8] = b"murmur-signed-prekey-v1";

/// Identifier of a signed pre-key.
pub type SignedPreKeyId = u32;

/// Identifier of a one-time pre-key. Ids are never re-used by a key store.
pub type OneTimePreKeyId = u64;

/// Identifier of a published bundle, increments whenever its contents change.
pub type BundleId = u64;

/// Returns the current UNIX timestamp in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

/// Validity window of a signed pre-key in UNIX seconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    not_before: u64,
    not_after: u64,
}

impl Lifetime {
    /// Lifetime starting now and lasting for the given duration.
    pub fn new(duration: Duration) -> Self {
        let now = now();
        Self {
            not_before: now,
            not_after: now.saturating_add(duration.as_secs()),
        }
    }

    pub fn from_range(not_before: u64, not_after: u64) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    pub fn not_after(&self) -> u64 {
        self.not_after
    }

    /// Checks if the lifetime is valid at the current time.
    pub fn verify(&self) -> Result<(), LifetimeError> {
        self.verify_at(now(), Duration::ZERO)
    }

    /// Checks if the lifetime is valid at the given time, tolerating an expiry which happened less
    /// than `grace` ago.
    pub fn verify_at(&self, now: u64, grace: Duration) -> Result<(), LifetimeError> {
        if self.not_before > self.not_after {
            return Err(LifetimeError::InvalidRange);
        }

        if now < self.not_before {
            return Err(LifetimeError::TooEarly(self.not_before));
        }

        if now > self.not_after.saturating_add(grace.as_secs()) {
            return Err(LifetimeError::Expired(self.not_after));
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LifetimeError {
    #[error("lifetime ends before it begins")]
    InvalidRange,

    #[error("key is not valid before {0}")]
    TooEarly(u64),

    #[error("key expired at {0}")]
    Expired(u64),
}

/// Medium-term pre-key, signed by the identity of its owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    id: SignedPreKeyId,
    key: PublicKey,
    lifetime: Lifetime,
}

impl SignedPreKey {
    pub fn new(id: SignedPreKeyId, key: PublicKey, lifetime: Lifetime) -> Self {
        Self { id, key, lifetime }
    }

    pub fn id(&self) -> SignedPreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Bytes covered by the identity signature: the key itself, but also its id and lifetime, so
    /// nobody can extend the validity of an old pre-key.
    pub fn signature_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PREKEY_SIGNATURE_CONTEXT.len() + 4 + 32 + 16);
        payload.extend_from_slice(PREKEY_SIGNATURE_CONTEXT);
        payload.extend_from_slice(&self.id.to_be_bytes());
        payload.extend_from_slice(self.key.as_bytes());
        payload.extend_from_slice(&self.lifetime.not_before.to_be_bytes());
        payload.extend_from_slice(&self.lifetime.not_after.to_be_bytes());
        payload
    }

    pub fn sign(&self, identity: &IdentityKeyPair) -> Signature {
        identity.sign(&self.signature_payload())
    }
}

/// Pre-key to be used exactly _once_.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    id: OneTimePreKeyId,
    key: PublicKey,
}

impl OneTimePreKey {
    pub fn new(id: OneTimePreKeyId, key: PublicKey) -> Self {
        Self { id, key }
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}

/// Public keys a peer publishes so others can initiate a session with them.
///
/// The signed pre-key signature is the sole authentication anchor of a bundle: whoever relays it
/// (signaling server, directory) can withhold one-time pre-keys but can not swap in their own
/// signed pre-key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    bundle_id: BundleId,
    identity_key: IdentityKey,
    signed_prekey: SignedPreKey,
    prekey_signature: Signature,
    onetime_prekeys: Vec<OneTimePreKey>,
}

impl PrekeyBundle {
    pub fn new(
        bundle_id: BundleId,
        identity_key: IdentityKey,
        signed_prekey: SignedPreKey,
        prekey_signature: Signature,
        onetime_prekeys: Vec<OneTimePreKey>,
    ) -> Self {
        Self {
            bundle_id,
            identity_key,
            signed_prekey,
            prekey_signature,
            onetime_prekeys,
        }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    pub fn onetime_prekeys(&self) -> &[OneTimePreKey] {
        &self.onetime_prekeys
    }

    /// Returns a copy of this bundle carrying at most the given one-time pre-key.
    ///
    /// Directories hand out every one-time pre-key to only one initiator.
    pub fn with_onetime_prekey(&self, onetime_prekey: Option<OneTimePreKey>) -> Self {
        Self {
            onetime_prekeys: onetime_prekey.into_iter().collect(),
            ..self.clone()
        }
    }

    /// Checks the signature of the signed pre-key and its lifetime.
    pub fn verify(&self) -> Result<(), KeyBundleError> {
        self.signed_prekey.lifetime.verify()?;
        self.identity_key
            .verifying_key()
            .verify(&self.signed_prekey.signature_payload(), &self.prekey_signature)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
}
