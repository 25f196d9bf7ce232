// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::traits::{
    CiphertextRef, Direction, GroupStore, KeyStorage, MessageLog, MessageRecord, SessionStore,
};

/// In-memory store.
///
/// This does not persist data permanently, all changes are lost when the process ends. Use this
/// only in development or test contexts.
#[derive(Debug)]
pub struct MemoryStore<ID, S, K, GID, G> {
    inner: Arc<RwLock<InnerMemoryStore<ID, S, K, GID, G>>>,
}

#[derive(Debug)]
struct InnerMemoryStore<ID, S, K, GID, G> {
    sessions: HashMap<ID, S>,
    keys: Option<K>,
    groups: HashMap<GID, G>,
    messages: Vec<MessageRecord<ID>>,
}

impl<ID, S, K, GID, G> MemoryStore<ID, S, K, GID, G> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(InnerMemoryStore {
                sessions: HashMap::new(),
                keys: None,
                groups: HashMap::new(),
                messages: Vec::new(),
            })),
        }
    }
}

impl<ID, S, K, GID, G> Default for MemoryStore<ID, S, K, GID, G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<ID, S, K, GID, G> Clone for MemoryStore<ID, S, K, GID, G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<ID, S, K, GID, G> SessionStore<ID, S> for MemoryStore<ID, S, K, GID, G>
where
    ID: Clone + Eq + Hash + Send + Sync,
    S: Clone + Send + Sync,
    K: Send + Sync,
    GID: Send + Sync,
    G: Send + Sync,
{
    type Error = Infallible;

    async fn load_session(&self, id: &ID) -> Result<Option<S>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(id).cloned())
    }

    async fn save_session(&self, id: &ID, state: S) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(id.clone(), state);
        Ok(())
    }
}

impl<ID, S, K, GID, G> KeyStorage<K> for MemoryStore<ID, S, K, GID, G>
where
    ID: Send + Sync,
    S: Send + Sync,
    K: Clone + Send + Sync,
    GID: Send + Sync,
    G: Send + Sync,
{
    type Error = Infallible;

    async fn load_keys(&self) -> Result<Option<K>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.keys.clone())
    }

    async fn save_keys(&self, keys: K) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.keys = Some(keys);
        Ok(())
    }
}

impl<ID, S, K, GID, G> GroupStore<GID, G> for MemoryStore<ID, S, K, GID, G>
where
    ID: Send + Sync,
    S: Send + Sync,
    K: Send + Sync,
    GID: Clone + Eq + Hash + Send + Sync,
    G: Clone + Send + Sync,
{
    type Error = Infallible;

    async fn load_group(&self, id: &GID) -> Result<Option<G>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.groups.get(id).cloned())
    }

    async fn save_group(&self, id: &GID, state: G) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.groups.insert(id.clone(), state);
        Ok(())
    }
}

impl<ID, S, K, GID, G> MessageLog<ID> for MemoryStore<ID, S, K, GID, G>
where
    ID: Clone + Eq + Send + Sync,
    S: Send + Sync,
    K: Send + Sync,
    GID: Send + Sync,
    G: Send + Sync,
{
    type Error = Infallible;

    async fn record_message(
        &self,
        id: &ID,
        direction: Direction,
        counter: u64,
        ciphertext_ref: CiphertextRef,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.messages.push(MessageRecord {
            id: id.clone(),
            direction,
            counter,
            ciphertext_ref,
        });
        Ok(())
    }

    async fn messages(&self, id: &ID) -> Result<Vec<MessageRecord<ID>>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|record| &record.id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::traits::{
        CiphertextRef, Direction, GroupStore, KeyStorage, MessageLog, SessionStore,
    };

    use super::MemoryStore;

    type TestStore = MemoryStore<u8, String, Vec<u8>, u32, String>;

    #[tokio::test]
    async fn sessions() {
        let store = TestStore::new();
        assert_eq!(store.load_session(&1).await.unwrap(), None);

        store.save_session(&1, "first".into()).await.unwrap();
        store.save_session(&1, "second".into()).await.unwrap();
        store.save_session(&2, "other".into()).await.unwrap();

        assert_eq!(store.load_session(&1).await.unwrap(), Some("second".into()));
        assert_eq!(store.load_session(&2).await.unwrap(), Some("other".into()));
    }

    #[tokio::test]
    async fn keys_and_groups() {
        let store = TestStore::new();
        assert_eq!(store.load_keys().await.unwrap(), None);
        store.save_keys(vec![1, 2, 3]).await.unwrap();

        // Clones share the same data.
        let clone = store.clone();
        assert_eq!(clone.load_keys().await.unwrap(), Some(vec![1, 2, 3]));

        store.save_group(&7, "group".into()).await.unwrap();
        assert_eq!(clone.load_group(&7).await.unwrap(), Some("group".into()));
        assert_eq!(clone.load_group(&8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn message_log_is_append_only() {
        let store = TestStore::new();
        let ciphertext_ref = CiphertextRef::from_ciphertext(b"ciphertext");

        store
            .record_message(&1, Direction::Outbound, 0, ciphertext_ref)
            .await
            .unwrap();
        store
            .record_message(&2, Direction::Inbound, 0, ciphertext_ref)
            .await
            .unwrap();
        store
            .record_message(&1, Direction::Inbound, 0, ciphertext_ref)
            .await
            .unwrap();
        store
            .record_message(&1, Direction::Outbound, 1, ciphertext_ref)
            .await
            .unwrap();

        let records = store.messages(&1).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records
                .iter()
                .map(|record| (record.direction, record.counter))
                .collect::<Vec<_>>(),
            vec![
                (Direction::Outbound, 0),
                (Direction::Inbound, 0),
                (Direction::Outbound, 1)
            ]
        );
        assert_eq!(store.messages(&2).await.unwrap().len(), 1);
    }

    #[test]
    fn ciphertext_refs() {
        assert_eq!(
            CiphertextRef::from_ciphertext(b"a"),
            CiphertextRef::from_ciphertext(b"a")
        );
        assert_ne!(
            CiphertextRef::from_ciphertext(b"a"),
            CiphertextRef::from_ciphertext(b"b")
        );
    }
}
