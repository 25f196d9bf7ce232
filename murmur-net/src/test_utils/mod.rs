// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory relay and network for tests, plus fixtures.
mod network;
mod relay;

use murmur_encryption::crypto::Rng;
use murmur_encryption::{
    GroupId, GroupState, IdentityKeyPair, KeyStore, KeyStoreConfig, KeyStoreState, SessionState,
};
use murmur_store::{KeyStorage, MemoryStore};
use tokio::sync::{broadcast, mpsc};

pub use network::{MemoryChannel, MemoryNetwork, MemoryTransport, MemoryTransportFactory};
pub use relay::{MemoryRelay, MemoryRelayConnection, MemoryRelayConnector};

use crate::PeerId;
use crate::config::{Config, ConnectionConfig, SignalingConfig};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::directory::MemoryDirectory;
use crate::session::{SessionEvent, SessionOrchestrator};
use crate::signaling::SignalingClient;

/// Configures a global tracing subscriber when `RUST_LOG` is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Deterministic identity derived from a seed.
pub fn generate_identity(seed: u8) -> IdentityKeyPair {
    IdentityKeyPair::generate(&Rng::from_seed([seed; 32])).expect("seeded rng never fails")
}

pub fn generate_peer(seed: u8) -> PeerId {
    generate_identity(seed).public()
}

/// In-memory store holding everything a session persists.
pub type TestStore = MemoryStore<PeerId, SessionState, KeyStoreState, GroupId, GroupState>;

/// Store which already contains the key material of a seeded identity.
///
/// A session started with it announces itself under the returned peer id.
pub async fn seeded_store(seed: u8, config: KeyStoreConfig) -> (PeerId, TestStore) {
    let identity = generate_identity(seed);
    let peer = identity.public();
    let keys = KeyStore::new(identity, config, Rng::from_seed([seed; 32]))
        .expect("seeded rng never fails");

    let store = TestStore::new();
    let state = keys.state().expect("key store lock is not poisoned");
    store
        .save_keys(state)
        .await
        .expect("memory store never fails");
    (peer, store)
}

/// Spawns signaling client and connection manager of a peer on a simulated host.
pub fn spawn_connection_manager(
    peer: PeerId,
    relay: &MemoryRelay,
    factory: MemoryTransportFactory,
    config: ConnectionConfig,
) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (signaling, negotiation_rx) =
        SignalingClient::spawn(peer, relay.connector(peer), SignalingConfig::default());
    ConnectionManager::spawn(factory, signaling, negotiation_rx, config)
}

/// Waits for the first event matching the predicate, skipping all others.
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    mut predicate: F,
) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    loop {
        let event = events.recv().await.expect("connection manager is alive");
        if predicate(&event) {
            return event;
        }
    }
}

pub type TestSession = SessionOrchestrator<TestStore, MemoryDirectory>;

/// Peer running a full session on the in-memory relay and network.
#[derive(Debug)]
pub struct TestPeer {
    pub id: PeerId,
    pub session: TestSession,
    pub store: TestStore,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl TestPeer {
    pub async fn spawn(
        seed: u8,
        relay: &MemoryRelay,
        directory: &MemoryDirectory,
        factory: MemoryTransportFactory,
    ) -> Self {
        let mut config = Config::default();
        config.key_store.onetime_prekeys = 10;

        let (id, store) = seeded_store(seed, config.key_store.clone()).await;
        let session = SessionOrchestrator::start(
            config,
            store.clone(),
            directory.clone(),
            relay.connector(id),
            factory,
        )
        .await
        .expect("session starts");
        let events = session.subscribe();

        Self {
            id,
            session,
            store,
            events,
        }
    }

    /// Waits for the next session event matching the predicate.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            match self.events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session stopped"),
            }
        }
    }

    /// Waits for the next decrypted direct message.
    pub async fn next_message(&mut self) -> (PeerId, Vec<u8>) {
        match self
            .wait_for(|event| matches!(event, SessionEvent::Message { .. }))
            .await
        {
            SessionEvent::Message { peer, plaintext } => (peer, plaintext),
            _ => unreachable!(),
        }
    }
}
