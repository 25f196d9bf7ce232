// SPDX-License-Identifier: MIT OR Apache-2.0

//! Store for our own secret key material.
//!
//! The key store owns the long-term identity, the rotating signed pre-keys and the pool of
//! one-time pre-keys. Signed pre-keys should be rotated regularly and well before they expire, so
//! that peers who are offline for a while still find a valid bundle. Replaced pre-keys remain
//! usable for inbound handshakes until their lifetime plus a grace period has passed.
//!
//! All pre-key state sits behind one mutex. It is the only lock shared between sessions: two
//! handshakes arriving at the same time for the same one-time pre-key will never both succeed.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::crypto::ed25519::Signature;
use crate::crypto::x25519::SecretKey;
use crate::crypto::{Rng, RngError};
use crate::identity::IdentityKeyPair;
use crate::key_bundle::{
    BundleId, Lifetime, LifetimeError, OneTimePreKey, OneTimePreKeyId, PrekeyBundle, SignedPreKey,
    SignedPreKeyId, now,
};

/// Configuration of pre-key lifetimes and pool sizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreConfig {
    /// How long a newly generated signed pre-key is valid.
    ///
    /// Defaults to 7 days.
    pub signed_prekey_lifetime: Duration,

    /// How long an expired signed pre-key is still accepted for inbound handshakes, to tolerate
    /// clock skew and bundles travelling through the network.
    ///
    /// Defaults to 2 days.
    pub signed_prekey_grace: Duration,

    /// Number of one-time pre-keys generated when the store is created.
    ///
    /// Defaults to 100.
    pub onetime_prekeys: usize,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            signed_prekey_lifetime: Duration::from_secs(7 * 24 * 60 * 60),
            signed_prekey_grace: Duration::from_secs(2 * 24 * 60 * 60),
            onetime_prekeys: 100,
        }
    }
}

/// Serializable snapshot of a key store (for persistence).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyStoreState {
    identity: IdentityKeyPair,
    prekeys: PreKeys,
}

impl KeyStoreState {
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignedPreKeyState {
    prekey: SignedPreKey,
    signature: Signature,
    secret: SecretKey,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PreKeys {
    bundle_id: BundleId,
    signed: BTreeMap<SignedPreKeyId, SignedPreKeyState>,
    signed_next_id: SignedPreKeyId,
    onetime: BTreeMap<OneTimePreKeyId, SecretKey>,
    onetime_next_id: OneTimePreKeyId,
}

impl PreKeys {
    /// Valid signed pre-key with the latest expiry date.
    fn latest_signed(&self, now: u64) -> Option<&SignedPreKeyState> {
        self.signed
            .values()
            .filter(|state| {
                state
                    .prekey
                    .lifetime()
                    .verify_at(now, Duration::ZERO)
                    .is_ok()
            })
            .max_by_key(|state| (state.prekey.lifetime().not_after(), state.prekey.id()))
    }
}

/// Owner of our identity and pre-key secrets.
#[derive(Debug)]
pub struct KeyStore {
    identity: IdentityKeyPair,
    config: KeyStoreConfig,
    prekeys: Mutex<PreKeys>,
    rng: Rng,
}

impl KeyStore {
    /// Generates a new long-term identity.
    pub fn generate_identity(rng: &Rng) -> Result<IdentityKeyPair, KeyStoreError> {
        Ok(IdentityKeyPair::generate(rng)?)
    }

    /// Returns a key store for the given identity with one signed pre-key and a pool of one-time
    /// pre-keys.
    pub fn new(
        identity: IdentityKeyPair,
        config: KeyStoreConfig,
        rng: Rng,
    ) -> Result<Self, KeyStoreError> {
        let onetime_prekeys = config.onetime_prekeys;
        let store = Self {
            identity,
            config,
            prekeys: Mutex::new(PreKeys::default()),
            rng,
        };
        store.rotate_signed_prekey()?;
        store.generate_one_time_prekeys(onetime_prekeys)?;
        Ok(store)
    }

    /// Restores a key store from a persisted snapshot.
    pub fn from_state(state: KeyStoreState, config: KeyStoreConfig, rng: Rng) -> Self {
        Self {
            identity: state.identity,
            config,
            prekeys: Mutex::new(state.prekeys),
            rng,
        }
    }

    /// Snapshot of all key material for persistence.
    pub fn state(&self) -> Result<KeyStoreState, KeyStoreError> {
        Ok(KeyStoreState {
            identity: self.identity.clone(),
            prekeys: self.lock()?.clone(),
        })
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn config(&self) -> &KeyStoreConfig {
        &self.config
    }

    /// Generates a new signed pre-key which will be published from now on.
    ///
    /// Previous pre-keys stay valid for inbound handshakes until they expired and their grace
    /// period passed.
    pub fn rotate_signed_prekey(&self) -> Result<SignedPreKey, KeyStoreError> {
        let secret = SecretKey::generate(&self.rng)?;

        let mut prekeys = self.lock()?;
        let prekey = SignedPreKey::new(
            prekeys.signed_next_id,
            secret.public_key(),
            Lifetime::new(self.config.signed_prekey_lifetime),
        );
        let signature = prekey.sign(&self.identity);

        prekeys.signed.insert(
            prekey.id(),
            SignedPreKeyState {
                prekey,
                signature,
                secret,
            },
        );
        prekeys.signed_next_id = prekeys.signed_next_id.wrapping_add(1);
        prekeys.bundle_id += 1;

        debug!(id = prekey.id(), "rotated signed pre-key");
        Ok(prekey)
    }

    /// Adds `n` fresh one-time pre-keys to the pool.
    pub fn generate_one_time_prekeys(
        &self,
        n: usize,
    ) -> Result<Vec<OneTimePreKey>, KeyStoreError> {
        let secrets = (0..n)
            .map(|_| SecretKey::generate(&self.rng))
            .collect::<Result<Vec<_>, _>>()?;

        let mut prekeys = self.lock()?;
        let mut public = Vec::with_capacity(n);
        for secret in secrets {
            let id = prekeys.onetime_next_id;
            public.push(OneTimePreKey::new(id, secret.public_key()));
            prekeys.onetime.insert(id, secret);
            prekeys.onetime_next_id += 1;
        }
        if n > 0 {
            prekeys.bundle_id += 1;
        }

        trace!(count = n, "generated one-time pre-keys");
        Ok(public)
    }

    /// Returns and permanently deletes the secret of a one-time pre-key.
    ///
    /// Fails with `KeyExhausted` when the key is unknown, which usually means it was already used.
    /// The initiator needs to fetch a fresh bundle in that case.
    pub fn consume_one_time_prekey(&self, id: OneTimePreKeyId) -> Result<SecretKey, KeyStoreError> {
        let mut prekeys = self.lock()?;
        let secret = prekeys
            .onetime
            .remove(&id)
            .ok_or(KeyStoreError::KeyExhausted(id))?;
        prekeys.bundle_id += 1;

        debug!(id, remaining = prekeys.onetime.len(), "consumed one-time pre-key");
        Ok(secret)
    }

    /// Returns the secret of a one-time pre-key without removing it from the pool.
    ///
    /// Inbound handshakes use this until the first message authenticated, only then the key gets
    /// consumed.
    pub fn one_time_prekey_secret(&self, id: OneTimePreKeyId) -> Result<SecretKey, KeyStoreError> {
        let prekeys = self.lock()?;
        prekeys
            .onetime
            .get(&id)
            .cloned()
            .ok_or(KeyStoreError::KeyExhausted(id))
    }

    /// Returns the secret of a signed pre-key for an inbound handshake.
    ///
    /// Expired pre-keys are accepted during the configured grace period.
    pub fn signed_prekey_secret(&self, id: SignedPreKeyId) -> Result<SecretKey, KeyStoreError> {
        let prekeys = self.lock()?;
        let state = prekeys
            .signed
            .get(&id)
            .ok_or(KeyStoreError::UnknownSignedPreKey(id))?;
        state
            .prekey
            .lifetime()
            .verify_at(now(), self.config.signed_prekey_grace)
            .map_err(|err| KeyStoreError::SignedPreKeyExpired(id, err))?;
        Ok(state.secret.clone())
    }

    /// Public bundle with the latest signed pre-key and all remaining one-time pre-keys.
    pub fn publish_bundle(&self) -> Result<PrekeyBundle, KeyStoreError> {
        let prekeys = self.lock()?;
        let latest = prekeys
            .latest_signed(now())
            .ok_or(KeyStoreError::NoValidSignedPreKey)?;
        let onetime_prekeys = prekeys
            .onetime
            .iter()
            .map(|(id, secret)| OneTimePreKey::new(*id, secret.public_key()))
            .collect();

        Ok(PrekeyBundle::new(
            prekeys.bundle_id,
            self.identity.public(),
            latest.prekey,
            latest.signature,
            onetime_prekeys,
        ))
    }

    /// Number of one-time pre-keys left in the pool.
    pub fn remaining_one_time_prekeys(&self) -> Result<usize, KeyStoreError> {
        Ok(self.lock()?.onetime.len())
    }

    /// Removes signed pre-keys whose lifetime and grace period passed. Returns the number of
    /// removed pre-keys.
    pub fn remove_expired(&self) -> Result<usize, KeyStoreError> {
        let now = now();
        let grace = self.config.signed_prekey_grace;
        let mut prekeys = self.lock()?;
        let before = prekeys.signed.len();
        prekeys
            .signed
            .retain(|_, state| state.prekey.lifetime().verify_at(now, grace).is_ok());
        let removed = before - prekeys.signed.len();
        if removed > 0 {
            prekeys.bundle_id += 1;
            debug!(removed, "removed expired signed pre-keys");
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PreKeys>, KeyStoreError> {
        self.prekeys.lock().map_err(|_| KeyStoreError::LockPoisoned)
    }

    #[cfg(test)]
    fn insert_signed_prekey(&self, lifetime: Lifetime) -> SignedPreKey {
        let secret = SecretKey::generate(&self.rng).unwrap();
        let mut prekeys = self.lock().unwrap();
        let prekey = SignedPreKey::new(prekeys.signed_next_id, secret.public_key(), lifetime);
        let signature = prekey.sign(&self.identity);
        prekeys.signed.insert(
            prekey.id(),
            SignedPreKeyState {
                prekey,
                signature,
                secret,
            },
        );
        prekeys.signed_next_id += 1;
        prekey
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("key store lock is poisoned")]
    LockPoisoned,

    #[error("one-time pre-key {0} does not exist or was already used")]
    KeyExhausted(OneTimePreKeyId),

    #[error("unknown signed pre-key {0}")]
    UnknownSignedPreKey(SignedPreKeyId),

    #[error("signed pre-key {0} can not be used anymore: {1}")]
    SignedPreKeyExpired(SignedPreKeyId, LifetimeError),

    #[error("no valid signed pre-key available, they are either expired or too early")]
    NoValidSignedPreKey,
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::key_bundle::{Lifetime, now};

    use super::{KeyStore, KeyStoreConfig, KeyStoreError};

    fn key_store(seed: u8, onetime_prekeys: usize) -> KeyStore {
        let rng = Rng::from_seed([seed; 32]);
        let identity = KeyStore::generate_identity(&rng).unwrap();
        let config = KeyStoreConfig {
            onetime_prekeys,
            ..Default::default()
        };
        KeyStore::new(identity, config, rng).unwrap()
    }

    #[test]
    fn publish_bundle() {
        let store = key_store(1, 3);
        let bundle = store.publish_bundle().unwrap();

        assert!(bundle.verify().is_ok());
        assert_eq!(bundle.identity_key(), &store.identity().public());
        assert_eq!(bundle.onetime_prekeys().len(), 3);

        // Public keys match the secrets we keep.
        let signed_secret = store
            .signed_prekey_secret(bundle.signed_prekey().id())
            .unwrap();
        assert_eq!(&signed_secret.public_key(), bundle.signed_prekey().key());
        let onetime = bundle.onetime_prekeys()[1];
        let onetime_secret = store.consume_one_time_prekey(onetime.id()).unwrap();
        assert_eq!(&onetime_secret.public_key(), onetime.key());

        // Bundle changed after consumption.
        let bundle_i = store.publish_bundle().unwrap();
        assert_eq!(bundle_i.onetime_prekeys().len(), 2);
        assert!(bundle_i.bundle_id() > bundle.bundle_id());
    }

    #[test]
    fn consume_one_time_prekey_once() {
        let store = key_store(1, 2);
        let bundle = store.publish_bundle().unwrap();
        let id = bundle.onetime_prekeys()[0].id();

        assert!(store.consume_one_time_prekey(id).is_ok());
        assert_matches!(
            store.consume_one_time_prekey(id),
            Err(KeyStoreError::KeyExhausted(exhausted)) if exhausted == id
        );
        assert_matches!(
            store.consume_one_time_prekey(42),
            Err(KeyStoreError::KeyExhausted(42))
        );
        assert_eq!(store.remaining_one_time_prekeys().unwrap(), 1);
    }

    #[test]
    fn lookup_keeps_one_time_prekey() {
        let store = key_store(1, 1);
        let onetime = store.publish_bundle().unwrap().onetime_prekeys()[0];

        let secret = store.one_time_prekey_secret(onetime.id()).unwrap();
        assert_eq!(&secret.public_key(), onetime.key());
        assert_eq!(store.remaining_one_time_prekeys().unwrap(), 1);

        store.consume_one_time_prekey(onetime.id()).unwrap();
        assert_matches!(
            store.one_time_prekey_secret(onetime.id()),
            Err(KeyStoreError::KeyExhausted(_))
        );
    }

    #[test]
    fn concurrent_consumption_returns_key_exactly_once() {
        for round in 0..16 {
            let store = key_store(round, 1);
            let id = store.publish_bundle().unwrap().onetime_prekeys()[0].id();
            let barrier = Barrier::new(2);

            let results: Vec<_> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            store.consume_one_time_prekey(id)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .collect()
            });

            assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
            assert_eq!(
                results
                    .iter()
                    .filter(|result| matches!(result, Err(KeyStoreError::KeyExhausted(_))))
                    .count(),
                1
            );
        }
    }

    #[test]
    fn rotation_keeps_previous_prekey_usable() {
        let store = key_store(2, 0);
        let first = store.publish_bundle().unwrap().signed_prekey().id();

        let rotated = store.rotate_signed_prekey().unwrap();
        assert_ne!(rotated.id(), first);

        // New bundles advertise the rotated pre-key, the old one still works for late handshakes.
        assert_eq!(store.publish_bundle().unwrap().signed_prekey().id(), rotated.id());
        assert!(store.signed_prekey_secret(first).is_ok());
        assert!(store.signed_prekey_secret(rotated.id()).is_ok());
        assert_matches!(
            store.signed_prekey_secret(99),
            Err(KeyStoreError::UnknownSignedPreKey(99))
        );
    }

    #[test]
    fn expired_prekeys_and_grace_period() {
        let store = key_store(3, 0);
        let grace = store.config().signed_prekey_grace.as_secs();
        let now = now();

        // Expired recently: still accepted, but never published.
        let recent = store.insert_signed_prekey(Lifetime::from_range(now - 120, now - 60));
        assert!(store.signed_prekey_secret(recent.id()).is_ok());

        // Expired longer ago than the grace period.
        let old = store.insert_signed_prekey(Lifetime::from_range(
            now - grace - 7200,
            now - grace - 3600,
        ));
        assert_matches!(
            store.signed_prekey_secret(old.id()),
            Err(KeyStoreError::SignedPreKeyExpired(_, _))
        );

        assert_ne!(store.publish_bundle().unwrap().signed_prekey().id(), recent.id());

        // Garbage collection only removes the one past its grace period.
        assert_eq!(store.remove_expired().unwrap(), 1);
        assert!(store.signed_prekey_secret(recent.id()).is_ok());
    }

    #[test]
    fn no_valid_signed_prekey() {
        let rng = Rng::from_seed([4; 32]);
        let identity = KeyStore::generate_identity(&rng).unwrap();
        let config = KeyStoreConfig {
            signed_prekey_lifetime: Duration::ZERO,
            signed_prekey_grace: Duration::ZERO,
            onetime_prekeys: 0,
        };
        let store = KeyStore::new(identity, config, rng).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_matches!(store.publish_bundle(), Err(KeyStoreError::NoValidSignedPreKey));
    }

    #[test]
    fn restore_from_state() {
        let store = key_store(5, 4);
        let bundle = store.publish_bundle().unwrap();
        store
            .consume_one_time_prekey(bundle.onetime_prekeys()[0].id())
            .unwrap();

        let restored = KeyStore::from_state(
            store.state().unwrap(),
            KeyStoreConfig::default(),
            Rng::from_seed([6; 32]),
        );
        assert_eq!(restored.identity(), store.identity());
        assert_eq!(restored.publish_bundle().unwrap(), store.publish_bundle().unwrap());
        assert_eq!(restored.remaining_one_time_prekeys().unwrap(), 3);
    }
}
