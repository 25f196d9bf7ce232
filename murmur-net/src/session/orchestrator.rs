// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use murmur_encryption::cbor::{decode_cbor, encode_cbor};
use murmur_encryption::crypto::Rng;
use murmur_encryption::group::{Epoch, SenderKeyDistribution};
use murmur_encryption::key_bundle::now;
use murmur_encryption::key_store::{KeyStore, KeyStoreError};
use murmur_encryption::{
    DoubleRatchet, GroupId, GroupMessage, GroupSession, GroupState, KeyStoreState, RatchetMessage,
    SessionState, X3dhError, x3dh,
};
use murmur_store::{CiphertextRef, Direction, GroupStore, KeyStorage, MessageLog, SessionStore};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::PeerId;
use crate::config::Config;
use crate::connection::{
    ConnectionEvent, ConnectionFailure, ConnectionManager, ConnectionState, PeerChannel,
    TransportFactory,
};
use crate::directory::BundleDirectory;
use crate::session::error::{ReceiveError, SendError};
use crate::session::payload::{SessionPayload, WireMessage};
use crate::signaling::{RelayConnector, SignalingClient};

const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Persistence required by a session.
pub trait SessionStorage:
    SessionStore<PeerId, SessionState>
    + KeyStorage<KeyStoreState>
    + GroupStore<GroupId, GroupState>
    + MessageLog<PeerId>
    + Send
    + Sync
    + 'static
{
}

impl<T> SessionStorage for T where
    T: SessionStore<PeerId, SessionState>
        + KeyStorage<KeyStoreState>
        + GroupStore<GroupId, GroupState>
        + MessageLog<PeerId>
        + Send
        + Sync
        + 'static
{
}

/// Events of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Decrypted application message of a peer.
    Message { peer: PeerId, plaintext: Vec<u8> },
    GroupMessage {
        group_id: GroupId,
        sender: PeerId,
        plaintext: Vec<u8>,
    },
    /// We joined a group or its membership changed.
    GroupUpdated {
        group_id: GroupId,
        epoch: Epoch,
        members: Vec<PeerId>,
    },
    /// A peer failed to authenticate.
    ConnectionDenied { peer: PeerId, reason: String },
    ConnectionFailed {
        peer: PeerId,
        failure: ConnectionFailure,
    },
    Disconnected { peer: PeerId },
}

/// End-to-end encrypted sessions over direct peer connections.
///
/// The session establishes a connection before it touches any ratchet state, so messages are
/// only encrypted once they can actually be delivered. Every state change is persisted before its
/// ciphertext is transmitted or its plaintext is handed out.
#[derive(Debug)]
pub struct SessionOrchestrator<S, D> {
    inner: Arc<SessionInner<S, D>>,
}

impl<S, D> Clone for SessionOrchestrator<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct SessionInner<S, D> {
    local_peer: PeerId,
    keys: KeyStore,
    store: S,
    directory: D,
    signaling: SignalingClient,
    connections: ConnectionManager,
    config: Config,
    rng: Rng,
    peer_locks: LockMap<PeerId>,
    /// Sessions peers started while ours was still unanswered. Kept in memory only.
    superseded: Mutex<HashMap<PeerId, SessionState>>,
    group_locks: LockMap<GroupId>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl<S, D> SessionOrchestrator<S, D>
where
    S: SessionStorage,
    D: BundleDirectory,
{
    /// Loads or creates our key material, publishes our pre-key bundle and starts the signaling
    /// and connection actors.
    pub async fn start<C, F>(
        config: Config,
        store: S,
        directory: D,
        connector: C,
        factory: F,
    ) -> Result<Self, SendError>
    where
        C: RelayConnector,
        F: TransportFactory,
    {
        let keys = match store.load_keys().await.map_err(SendError::store)? {
            Some(state) => KeyStore::from_state(state, config.key_store.clone(), Rng::default()),
            None => KeyStore::new(
                KeyStore::generate_identity(&Rng::default())?,
                config.key_store.clone(),
                Rng::default(),
            )?,
        };
        let local_peer = keys.identity().public();

        let (signaling, negotiation_rx) =
            SignalingClient::spawn(local_peer, connector, config.signaling.clone());
        let (connections, connection_events) = ConnectionManager::spawn(
            factory,
            signaling.clone(),
            negotiation_rx,
            config.connection.clone(),
        );
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);

        let inner = Arc::new(SessionInner {
            local_peer,
            keys,
            store,
            directory,
            signaling,
            connections,
            config,
            rng: Rng::default(),
            peer_locks: LockMap::default(),
            superseded: Mutex::new(HashMap::new()),
            group_locks: LockMap::default(),
            events_tx,
        });

        inner.refresh_prekeys().await?;
        tokio::spawn(inbound_loop(inner.clone(), connection_events));

        debug!(peer = %local_peer, "session started");
        Ok(Self { inner })
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.inner.signaling
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Subscribes to incoming messages and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Encrypts and sends an application message to a peer.
    ///
    /// The first message to a peer starts a new session with their published pre-key bundle.
    pub async fn send(&self, peer: PeerId, plaintext: &[u8]) -> Result<(), SendError> {
        self.inner
            .send_payload(peer, &SessionPayload::Application(plaintext.to_vec()))
            .await
    }

    /// Cancels a pending connection attempt to a peer or closes the connection.
    pub async fn close(&self, peer: PeerId) -> Result<(), SendError> {
        self.inner
            .connections
            .cancel(peer)
            .await
            .map_err(|err| SendError::connection(peer, err))
    }

    pub async fn connection_state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.inner.connections.state(peer).await.ok().flatten()
    }

    /// Removes expired signed pre-keys, rotates the signed pre-key when needed, refills the pool
    /// of one-time pre-keys and publishes the resulting bundle.
    pub async fn refresh_prekeys(&self) -> Result<(), SendError> {
        self.inner.refresh_prekeys().await
    }

    /// Creates a group with the given members and sends them our sender chain.
    pub async fn create_group(
        &self,
        members: impl IntoIterator<Item = PeerId>,
    ) -> Result<GroupId, SendError> {
        let inner = &self.inner;
        let group_id = GroupId::random(&inner.rng)?;

        let lock = inner.group_locks.get(group_id);
        let guard = lock.lock().await;
        let (state, distribution) =
            GroupSession::init(group_id, inner.local_peer, members, &inner.rng)
                .map_err(|err| crypto_failure("create group", err))?;
        inner
            .store
            .save_group(&group_id, state.clone())
            .await
            .map_err(SendError::store)?;
        drop(guard);

        inner.emit_group_updated(&state);
        inner
            .distribute(distribution, state.recipients())
            .await?;

        Ok(group_id)
    }

    /// Moves the group into a new epoch with the given members.
    ///
    /// All remaining members receive our new sender chain. Removed members can not decrypt
    /// messages of the new epoch.
    pub async fn update_group_members(
        &self,
        group_id: GroupId,
        members: impl IntoIterator<Item = PeerId>,
    ) -> Result<Epoch, SendError> {
        let inner = &self.inner;

        let lock = inner.group_locks.get(group_id);
        let guard = lock.lock().await;
        let state = inner
            .store
            .load_group(&group_id)
            .await
            .map_err(SendError::store)?
            .ok_or(SendError::UnknownGroup(group_id))?;
        let (state, distribution) = GroupSession::update_members(state, members, now(), &inner.rng)
            .map_err(|err| crypto_failure("update group", err))?;
        let state = GroupSession::purge_retired(state, now(), &inner.config.group);
        inner
            .store
            .save_group(&group_id, state.clone())
            .await
            .map_err(SendError::store)?;
        drop(guard);

        inner.emit_group_updated(&state);
        inner
            .distribute(distribution, state.recipients())
            .await?;

        Ok(state.epoch())
    }

    /// Encrypts a message once and sends it to all members of the group.
    pub async fn send_group(&self, group_id: GroupId, plaintext: &[u8]) -> Result<(), SendError> {
        let inner = &self.inner;

        let lock = inner.group_locks.get(group_id);
        let guard = lock.lock().await;
        let state = inner
            .store
            .load_group(&group_id)
            .await
            .map_err(SendError::store)?
            .ok_or(SendError::UnknownGroup(group_id))?;
        let (state, message) = GroupSession::encrypt(state, plaintext)
            .map_err(|err| crypto_failure("encrypt group message", err))?;
        let recipients = state.recipients();
        inner
            .store
            .save_group(&group_id, state)
            .await
            .map_err(SendError::store)?;
        drop(guard);

        let counter = message.counter;
        let bytes = encode_cbor(&WireMessage::Group(message))?;

        let mut deliveries = JoinSet::new();
        for peer in recipients {
            let inner = inner.clone();
            let bytes = bytes.clone();
            deliveries.spawn(async move {
                let result = inner.deliver(peer, counter, bytes).await;
                (peer, result)
            });
        }

        collect_deliveries(deliveries).await
    }

    /// Closes all connections and stops the background actors.
    pub async fn shutdown(&self) {
        self.inner.connections.shutdown().await;
        self.inner.signaling.shutdown().await;
    }
}

impl<S, D> SessionInner<S, D>
where
    S: SessionStorage,
    D: BundleDirectory,
{
    async fn refresh_prekeys(&self) -> Result<(), SendError> {
        let removed = self.keys.remove_expired()?;
        if removed > 0 {
            debug!("removed {removed} expired signed pre-keys");
        }

        let bundle = match self.keys.publish_bundle() {
            Ok(bundle) => bundle,
            Err(KeyStoreError::NoValidSignedPreKey) => {
                self.keys.rotate_signed_prekey()?;
                self.keys.publish_bundle()?
            }
            Err(err) => return Err(err.into()),
        };

        let target = self.config.key_store.onetime_prekeys;
        let remaining = self.keys.remaining_one_time_prekeys()?;
        let bundle = if remaining < target / 2 {
            self.keys.generate_one_time_prekeys(target - remaining)?;
            self.keys.publish_bundle()?
        } else {
            bundle
        };

        self.store
            .save_keys(self.keys.state()?)
            .await
            .map_err(SendError::store)?;
        self.directory
            .publish(bundle)
            .await
            .map_err(|err| SendError::Directory(Box::new(err)))?;

        Ok(())
    }

    /// Encrypts a payload for a peer and transmits it.
    async fn send_payload(&self, peer: PeerId, payload: &SessionPayload) -> Result<(), SendError> {
        let channel = self
            .connections
            .connect(peer)
            .await
            .map_err(|err| SendError::connection(peer, err))?;
        let plaintext = encode_cbor(payload)?;

        let lock = self.peer_locks.get(peer);
        let _guard = lock.lock().await;

        let state = match self
            .store
            .load_session(&peer)
            .await
            .map_err(SendError::store)?
        {
            Some(state) => state,
            None => self.initiate(peer).await?,
        };

        let (state, message) = DoubleRatchet::encrypt(state, &plaintext, &self.rng)
            .map_err(|err| crypto_failure("encrypt message", err))?;
        let counter = message.header.counter;
        let bytes = encode_cbor(&WireMessage::Direct(message))?;

        self.store
            .save_session(&peer, state)
            .await
            .map_err(SendError::store)?;
        self.store
            .record_message(
                &peer,
                Direction::Outbound,
                counter,
                CiphertextRef::from_ciphertext(&bytes),
            )
            .await
            .map_err(SendError::store)?;

        transmit(&channel, bytes).await
    }

    /// Starts a new session with the published bundle of a peer.
    async fn initiate(&self, peer: PeerId) -> Result<SessionState, SendError> {
        let bundle = self
            .directory
            .fetch(&peer)
            .await
            .map_err(|err| SendError::Directory(Box::new(err)))?
            .ok_or(SendError::NoBundle(peer))?;

        if bundle.identity_key() != &peer {
            return Err(SendError::ConnectionDenied {
                peer,
                reason: "pre-key bundle belongs to another identity".into(),
            });
        }

        match x3dh::initiate(self.keys.identity(), &bundle, &self.rng) {
            Ok(initiated) => {
                debug!(%peer, "initiated session");
                Ok(DoubleRatchet::init_initiator(initiated))
            }
            Err(X3dhError::InvalidBundle(err)) => {
                trace!(%peer, "invalid pre-key bundle: {err}");
                Err(SendError::ConnectionDenied {
                    peer,
                    reason: "pre-key bundle failed verification".into(),
                })
            }
            Err(err) => Err(crypto_failure("initiate session", err)),
        }
    }

    /// Sends our sender chain to the given members over the pairwise sessions.
    async fn distribute(
        self: &Arc<Self>,
        distribution: SenderKeyDistribution,
        recipients: Vec<PeerId>,
    ) -> Result<(), SendError> {
        let mut deliveries = JoinSet::new();
        for peer in recipients {
            let inner = self.clone();
            let payload = SessionPayload::SenderKey(distribution.clone());
            deliveries.spawn(async move {
                let result = inner.send_payload(peer, &payload).await;
                (peer, result)
            });
        }

        collect_deliveries(deliveries).await
    }

    /// Transmits an already encrypted group message to one member.
    async fn deliver(&self, peer: PeerId, counter: u64, bytes: Vec<u8>) -> Result<(), SendError> {
        let channel = self
            .connections
            .connect(peer)
            .await
            .map_err(|err| SendError::connection(peer, err))?;
        self.store
            .record_message(
                &peer,
                Direction::Outbound,
                counter,
                CiphertextRef::from_ciphertext(&bytes),
            )
            .await
            .map_err(SendError::store)?;
        transmit(&channel, bytes).await
    }

    async fn on_frame(self: &Arc<Self>, peer: PeerId, bytes: Vec<u8>) -> Result<(), ReceiveError> {
        let ciphertext_ref = CiphertextRef::from_ciphertext(&bytes);
        match decode_cbor(&bytes[..])? {
            WireMessage::Direct(message) => {
                let payload = self.receive_direct(peer, &message, ciphertext_ref).await?;
                match payload {
                    SessionPayload::Application(plaintext) => {
                        self.emit(SessionEvent::Message { peer, plaintext });
                    }
                    SessionPayload::SenderKey(distribution) => {
                        self.receive_distribution(peer, distribution).await?;
                    }
                }
            }
            WireMessage::Group(message) => {
                self.receive_group(peer, message, ciphertext_ref).await?;
            }
        }
        Ok(())
    }

    async fn receive_direct(
        &self,
        peer: PeerId,
        message: &RatchetMessage,
        ciphertext_ref: CiphertextRef,
    ) -> Result<SessionPayload, ReceiveError> {
        let lock = self.peer_locks.get(peer);
        let _guard = lock.lock().await;

        let existing = self
            .store
            .load_session(&peer)
            .await
            .map_err(ReceiveError::store)?;
        let (state, plaintext) = self.open(peer, existing, message).await?;

        self.store
            .save_session(&peer, state)
            .await
            .map_err(ReceiveError::store)?;
        self.store
            .record_message(
                &peer,
                Direction::Inbound,
                message.header.counter,
                ciphertext_ref,
            )
            .await
            .map_err(ReceiveError::store)?;

        Ok(decode_cbor(&plaintext[..])?)
    }

    /// Decrypts with the existing session, or builds a new one from the attached handshake.
    async fn open(
        &self,
        peer: PeerId,
        existing: Option<SessionState>,
        message: &RatchetMessage,
    ) -> Result<(SessionState, Vec<u8>), ReceiveError> {
        if let Some(state) = existing.clone() {
            match DoubleRatchet::decrypt(state, message, &self.config.ratchet) {
                Ok(result) => return Ok(result),
                Err(err) if message.handshake.is_none() => {
                    trace!(%peer, "decryption failed: {err}");
                    return Err(ReceiveError::Crypto);
                }
                Err(err) => trace!(%peer, "existing session failed, trying handshake: {err}"),
            }
        }

        let Some(handshake) = &message.handshake else {
            return Err(ReceiveError::NoSession(peer));
        };

        if handshake.identity_key != peer {
            let err = ReceiveError::IdentityMismatch {
                expected: peer,
                actual: handshake.identity_key,
            };
            self.emit(SessionEvent::ConnectionDenied {
                peer,
                reason: err.to_string(),
            });
            return Err(err);
        }

        let replayed = existing
            .as_ref()
            .is_some_and(|state| state.has_accepted(handshake));

        // Both sides started a session at the same time. The peer with the lower id keeps its own,
        // messages of the other session are still decrypted until the peer switched over.
        let keep_ours = match existing {
            Some(ours) if ours.pending_handshake().is_some() && self.local_peer < peer => {
                Some(ours)
            }
            _ => None,
        };

        if let Some(ours) = &keep_ours {
            if let Some(superseded) = self.take_superseded(peer) {
                if superseded.has_accepted(handshake) {
                    let result =
                        DoubleRatchet::decrypt(superseded.clone(), message, &self.config.ratchet);
                    return match result {
                        Ok((superseded, plaintext)) => {
                            self.put_superseded(peer, superseded);
                            Ok((ours.clone(), plaintext))
                        }
                        Err(err) => {
                            trace!(%peer, "superseded session failed: {err}");
                            self.put_superseded(peer, superseded);
                            Err(ReceiveError::Crypto)
                        }
                    };
                }
                self.put_superseded(peer, superseded);
            }
        }

        if replayed {
            trace!(%peer, "handshake was already answered");
            return Err(ReceiveError::Crypto);
        }

        let prekey_secret = self.keys.signed_prekey_secret(handshake.signed_prekey_id)?;
        let onetime_secret = handshake
            .onetime_prekey_id
            .map(|id| self.keys.one_time_prekey_secret(id))
            .transpose()?;

        let (secret, associated_data) = x3dh::respond(
            self.keys.identity(),
            handshake,
            &prekey_secret,
            onetime_secret.as_ref(),
        )
        .map_err(|err| {
            trace!(%peer, "handshake failed: {err}");
            ReceiveError::Crypto
        })?;

        let state = DoubleRatchet::init_responder(secret, associated_data, handshake);
        let (state, plaintext) =
            DoubleRatchet::decrypt(state, message, &self.config.ratchet).map_err(|err| {
                trace!(%peer, "decryption of first message failed: {err}");
                ReceiveError::Crypto
            })?;

        // The handshake is authentic, its one-time pre-key is gone from now on.
        if let Some(id) = handshake.onetime_prekey_id {
            self.keys.consume_one_time_prekey(id)?;
            self.store
                .save_keys(self.keys.state()?)
                .await
                .map_err(ReceiveError::store)?;
        }

        match keep_ours {
            Some(mut ours) => {
                debug!(%peer, "both sides started a session, keeping ours");
                ours.accept_handshake(handshake);
                self.put_superseded(peer, state);
                Ok((ours, plaintext))
            }
            None => {
                debug!(%peer, "accepted session");
                self.take_superseded(peer);
                Ok((state, plaintext))
            }
        }
    }

    fn take_superseded(&self, peer: PeerId) -> Option<SessionState> {
        self.superseded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer)
    }

    fn put_superseded(&self, peer: PeerId, state: SessionState) {
        self.superseded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, state);
    }

    async fn receive_distribution(
        self: &Arc<Self>,
        peer: PeerId,
        distribution: SenderKeyDistribution,
    ) -> Result<(), ReceiveError> {
        let group_id = distribution.group_id;
        let lock = self.group_locks.get(group_id);
        let guard = lock.lock().await;

        let existing = self
            .store
            .load_group(&group_id)
            .await
            .map_err(ReceiveError::store)?;
        let previous_epoch = existing.as_ref().map(|state| state.epoch());

        let result = match existing {
            None => GroupSession::join(self.local_peer, &peer, &distribution, now(), &self.rng)
                .map(|(state, own)| (state, Some(own))),
            Some(state) => {
                GroupSession::process_distribution(state, &peer, &distribution, now(), &self.rng)
            }
        };
        let (state, own) = result.map_err(|err| {
            trace!(%peer, "rejected sender key: {err}");
            ReceiveError::Crypto
        })?;
        let state = GroupSession::purge_retired(state, now(), &self.config.group);

        self.store
            .save_group(&group_id, state.clone())
            .await
            .map_err(ReceiveError::store)?;
        drop(guard);

        if previous_epoch != Some(state.epoch()) {
            self.emit_group_updated(&state);
        }

        // Our own chain for this epoch goes out to everyone else in the background.
        if let Some(own) = own {
            let inner = self.clone();
            let recipients = state.recipients();
            tokio::spawn(async move {
                if let Err(err) = inner.distribute(own, recipients).await {
                    warn!(%group_id, "could not distribute sender key: {err}");
                }
            });
        }

        Ok(())
    }

    async fn receive_group(
        &self,
        peer: PeerId,
        message: GroupMessage,
        ciphertext_ref: CiphertextRef,
    ) -> Result<(), ReceiveError> {
        let group_id = message.group_id;
        let lock = self.group_locks.get(group_id);
        let guard = lock.lock().await;

        let state = self
            .store
            .load_group(&group_id)
            .await
            .map_err(ReceiveError::store)?
            .ok_or(ReceiveError::UnknownGroup(group_id))?;
        let (state, plaintext) = GroupSession::decrypt(state, &message, &self.config.group)
            .map_err(|err| {
                trace!(%peer, %group_id, "group decryption failed: {err}");
                ReceiveError::Crypto
            })?;

        self.store
            .save_group(&group_id, state)
            .await
            .map_err(ReceiveError::store)?;
        self.store
            .record_message(&peer, Direction::Inbound, message.counter, ciphertext_ref)
            .await
            .map_err(ReceiveError::store)?;
        drop(guard);

        self.emit(SessionEvent::GroupMessage {
            group_id,
            sender: message.sender,
            plaintext,
        });
        Ok(())
    }

    fn emit_group_updated(&self, state: &GroupState) {
        self.emit(SessionEvent::GroupUpdated {
            group_id: *state.group_id(),
            epoch: state.epoch(),
            members: state.members().copied().collect(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody subscribed is fine.
        let _ = self.events_tx.send(event);
    }
}

async fn inbound_loop<S, D>(
    inner: Arc<SessionInner<S, D>>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) where
    S: SessionStorage,
    D: BundleDirectory,
{
    // Frames of one peer are processed in order by its own worker, a slow peer does not hold up
    // the others.
    let mut workers: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message { peer, bytes } => {
                let worker = workers
                    .entry(peer)
                    .or_insert_with(|| spawn_peer_worker(inner.clone(), peer));
                if worker.send(bytes).is_err() {
                    warn!(%peer, "inbound worker stopped, dropping message");
                    workers.remove(&peer);
                }
            }
            ConnectionEvent::Failed { peer, failure } => {
                workers.remove(&peer);
                inner.emit(SessionEvent::ConnectionFailed { peer, failure });
            }
            ConnectionEvent::Closed { peer } => {
                workers.remove(&peer);
                inner.emit(SessionEvent::Disconnected { peer });
            }
            ConnectionEvent::StateChanged { peer, state } => {
                trace!(%peer, "connection {state}");
            }
            ConnectionEvent::Connected { peer } => debug!(%peer, "connected"),
        }
    }

    debug!("connection manager stopped, session inbound loop ends");
}

/// Spawns a task decrypting the frames of one peer. It ends once its sender is dropped and all
/// queued frames are processed.
fn spawn_peer_worker<S, D>(
    inner: Arc<SessionInner<S, D>>,
    peer: PeerId,
) -> mpsc::UnboundedSender<Vec<u8>>
where
    S: SessionStorage,
    D: BundleDirectory,
{
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = frames_rx.recv().await {
            if let Err(err) = inner.on_frame(peer, bytes).await {
                warn!(%peer, "dropping incoming message: {err}");
            }
        }
        trace!(%peer, "inbound worker stopped");
    });
    frames_tx
}

async fn transmit(channel: &PeerChannel, bytes: Vec<u8>) -> Result<(), SendError> {
    channel
        .send(bytes)
        .await
        .map_err(|err| SendError::connection(channel.peer(), err))
}

async fn collect_deliveries(
    mut deliveries: JoinSet<(PeerId, Result<(), SendError>)>,
) -> Result<(), SendError> {
    let mut failed = Vec::new();
    while let Some(result) = deliveries.join_next().await {
        match result {
            Ok((_, Ok(()))) => (),
            Ok((peer, Err(err))) => {
                warn!(%peer, "delivery failed: {err}");
                failed.push(peer);
            }
            Err(err) => warn!("delivery task failed: {err}"),
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        failed.sort();
        Err(SendError::PartialDelivery(failed))
    }
}

fn crypto_failure(operation: &str, err: impl std::error::Error) -> SendError {
    trace!("{operation} failed: {err}");
    SendError::Crypto
}

/// Lazily created async mutexes, one per key.
#[derive(Debug)]
struct LockMap<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for LockMap<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> LockMap<K> {
    fn get(&self, key: K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }
}
