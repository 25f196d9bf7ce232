// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lookup of published pre-key bundles.
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;

use murmur_encryption::PrekeyBundle;
use murmur_encryption::key_bundle::OneTimePreKey;
use tokio::sync::RwLock;

use crate::PeerId;

/// Place where peers publish their pre-key bundles for others to fetch.
///
/// Directories are not trusted. Bundles are verified against the identity key of their owner
/// before they are used.
pub trait BundleDirectory: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    fn publish(&self, bundle: PrekeyBundle) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns a bundle of the peer carrying at most one one-time pre-key.
    ///
    /// Every one-time pre-key must be handed out to one initiator only.
    fn fetch(
        &self,
        peer: &PeerId,
    ) -> impl Future<Output = Result<Option<PrekeyBundle>, Self::Error>> + Send;
}

#[derive(Debug)]
struct Entry {
    bundle: PrekeyBundle,
    onetime_prekeys: VecDeque<OneTimePreKey>,
}

/// Directory keeping bundles in memory, shared between all clones.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    entries: Arc<RwLock<HashMap<PeerId, Entry>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of one-time pre-keys of a peer which were not handed out yet.
    pub async fn remaining_onetime_prekeys(&self, peer: &PeerId) -> usize {
        let entries = self.entries.read().await;
        entries
            .get(peer)
            .map_or(0, |entry| entry.onetime_prekeys.len())
    }
}

impl BundleDirectory for MemoryDirectory {
    type Error = Infallible;

    async fn publish(&self, bundle: PrekeyBundle) -> Result<(), Self::Error> {
        let mut entries = self.entries.write().await;
        entries.insert(
            *bundle.identity_key(),
            Entry {
                onetime_prekeys: bundle.onetime_prekeys().iter().cloned().collect(),
                bundle: bundle.with_onetime_prekey(None),
            },
        );
        Ok(())
    }

    async fn fetch(&self, peer: &PeerId) -> Result<Option<PrekeyBundle>, Self::Error> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(peer) else {
            return Ok(None);
        };

        let onetime_prekey = entry.onetime_prekeys.pop_front();
        Ok(Some(entry.bundle.with_onetime_prekey(onetime_prekey)))
    }
}

#[cfg(test)]
mod tests {
    use murmur_encryption::crypto::Rng;
    use murmur_encryption::{KeyStore, KeyStoreConfig};

    use super::{BundleDirectory, MemoryDirectory};

    #[tokio::test]
    async fn hands_out_onetime_prekeys_once() {
        let rng = Rng::from_seed([1; 32]);
        let config = KeyStoreConfig {
            onetime_prekeys: 2,
            ..Default::default()
        };
        let bob = KeyStore::new(
            KeyStore::generate_identity(&rng).unwrap(),
            config,
            Rng::from_seed([2; 32]),
        )
        .unwrap();
        let bob_id = bob.identity().public();

        let directory = MemoryDirectory::new();
        assert!(directory.fetch(&bob_id).await.unwrap().is_none());

        directory.publish(bob.publish_bundle().unwrap()).await.unwrap();
        assert_eq!(directory.remaining_onetime_prekeys(&bob_id).await, 2);

        let first = directory.fetch(&bob_id).await.unwrap().unwrap();
        let second = directory.fetch(&bob_id).await.unwrap().unwrap();
        let third = directory.fetch(&bob_id).await.unwrap().unwrap();

        assert_eq!(first.onetime_prekeys().len(), 1);
        assert_eq!(second.onetime_prekeys().len(), 1);
        assert_ne!(first.onetime_prekeys()[0].id(), second.onetime_prekeys()[0].id());

        // Without one-time pre-keys left the bundle is still usable.
        assert!(third.onetime_prekeys().is_empty());
        assert!(third.verify().is_ok());
        assert_eq!(directory.remaining_onetime_prekeys(&bob_id).await, 0);
    }
}
