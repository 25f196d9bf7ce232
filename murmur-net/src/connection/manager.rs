// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::PeerId;
use crate::config::ConnectionConfig;
use crate::connection::driver::{Driver, DriverEvent, Role};
use crate::connection::negotiation::{ConnectionId, Negotiation};
use crate::connection::state::{ConnectionFailure, ConnectionState};
use crate::connection::transport::{SessionDescription, TransportError, TransportFactory};
use crate::signaling::{SignalingClient, SignalingEnvelope};

const INBOX_CAPACITY: usize = 256;

const DRIVER_EVENTS_CAPACITY: usize = 256;

const NEGOTIATION_QUEUE_CAPACITY: usize = 64;

/// Events of all connections handled by the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    Connected {
        peer: PeerId,
    },
    /// Frame received over the data channel of a connected peer.
    Message {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    Failed {
        peer: PeerId,
        failure: ConnectionFailure,
    },
    Closed {
        peer: PeerId,
    },
}

#[derive(Debug)]
pub enum ToConnectionActor {
    /// Establish a connection with a peer or join the attempt which is already underway.
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<PeerChannel, ConnectionError>>,
    },
    /// Cancel a pending attempt or close an established connection.
    Cancel { peer: PeerId },
    /// Current state of the connection with a peer.
    State {
        peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
    /// Close all connections and terminate the actor.
    Shutdown,
}

impl Display for ToConnectionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToConnectionActor::Connect { peer, .. } => write!(f, "connect to peer {peer}"),
            ToConnectionActor::Cancel { peer } => write!(f, "cancel connection with peer {peer}"),
            ToConnectionActor::State { peer, .. } => {
                write!(f, "query connection state of peer {peer}")
            }
            ToConnectionActor::Shutdown => write!(f, "shutdown the actor"),
        }
    }
}

/// Sending side of an established data channel.
#[derive(Clone, Debug)]
pub struct PeerChannel {
    peer: PeerId,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl PeerChannel {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queues a frame. Waits if the channel is congested.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.outbound_tx
            .send(bytes)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound_tx.is_closed()
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Failed(#[from] ConnectionFailure),

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,

    #[error("connection manager stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handle to the connection actor.
///
/// The actor owns all connections to remote peers. Every connection attempt runs in its own task,
/// moving through the states of [`ConnectionState`]. Offers of remote peers are answered
/// automatically. When both peers offer at the same time, the peer with the lower id stays the
/// offering side.
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    local_peer: PeerId,
    actor_tx: mpsc::Sender<ToConnectionActor>,
}

impl ConnectionManager {
    pub fn spawn<F: TransportFactory>(
        factory: F,
        signaling: SignalingClient,
        negotiation_rx: mpsc::Receiver<SignalingEnvelope>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let local_peer = signaling.local_peer();
        let (actor_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (driver_tx, driver_rx) = mpsc::channel(DRIVER_EVENTS_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = ConnectionActor {
            local_peer,
            factory,
            signaling,
            config,
            inbox,
            negotiation_rx,
            driver_tx,
            driver_rx,
            events_tx,
            peers: HashMap::new(),
            rng: ChaCha20Rng::from_os_rng(),
        };
        tokio::spawn(actor.run());

        (
            Self {
                local_peer,
                actor_tx,
            },
            events_rx,
        )
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Returns a channel to the peer once the connection is established.
    pub async fn connect(&self, peer: PeerId) -> Result<PeerChannel, ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToConnectionActor::Connect { peer, reply })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        reply_rx.await.map_err(|_| ConnectionError::Stopped)?
    }

    /// Cancels the attempt to connect to a peer or closes the connection.
    ///
    /// Pending [`ConnectionManager::connect`] calls for this peer return
    /// [`ConnectionError::Cancelled`].
    pub async fn cancel(&self, peer: PeerId) -> Result<(), ConnectionError> {
        self.actor_tx
            .send(ToConnectionActor::Cancel { peer })
            .await
            .map_err(|_| ConnectionError::Stopped)
    }

    pub async fn state(&self, peer: PeerId) -> Result<Option<ConnectionState>, ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToConnectionActor::State { peer, reply })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        reply_rx.await.map_err(|_| ConnectionError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.actor_tx.send(ToConnectionActor::Shutdown).await;
    }
}

#[derive(Debug)]
struct PeerEntry {
    connection: ConnectionId,
    controlling: bool,
    state: ConnectionState,
    cancel: CancellationToken,
    negotiation_tx: mpsc::Sender<Negotiation>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    waiters: Vec<oneshot::Sender<Result<PeerChannel, ConnectionError>>>,
}

struct ConnectionActor<F: TransportFactory> {
    local_peer: PeerId,
    factory: F,
    signaling: SignalingClient,
    config: ConnectionConfig,
    inbox: mpsc::Receiver<ToConnectionActor>,
    negotiation_rx: mpsc::Receiver<SignalingEnvelope>,
    driver_tx: mpsc::Sender<DriverEvent>,
    driver_rx: mpsc::Receiver<DriverEvent>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    peers: HashMap<PeerId, PeerEntry>,
    rng: ChaCha20Rng,
}

impl<F: TransportFactory> ConnectionActor<F> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    if !self.on_actor_message(msg) {
                        break;
                    }
                },
                Some(envelope) = self.negotiation_rx.recv() => self.on_negotiation(envelope),
                Some(event) = self.driver_rx.recv() => self.on_driver_event(event),
            }
        }

        for entry in self.peers.values() {
            entry.cancel.cancel();
        }
    }

    fn on_actor_message(&mut self, msg: ToConnectionActor) -> bool {
        trace!("{msg}");

        match msg {
            ToConnectionActor::Connect { peer, reply } => self.handle_connect(peer, reply),
            ToConnectionActor::Cancel { peer } => self.handle_cancel(peer),
            ToConnectionActor::State { peer, reply } => {
                let _ = reply.send(self.peers.get(&peer).map(|entry| entry.state));
            }
            ToConnectionActor::Shutdown => return false,
        }

        true
    }

    fn handle_connect(
        &mut self,
        peer: PeerId,
        reply: oneshot::Sender<Result<PeerChannel, ConnectionError>>,
    ) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            if entry.state == ConnectionState::Connected {
                let _ = reply.send(Ok(PeerChannel {
                    peer,
                    outbound_tx: entry.outbound_tx.clone(),
                }));
            } else {
                entry.waiters.push(reply);
            }
            return;
        }

        let connection = self.rng.random();
        match self.start_driver(peer, connection, Role::Controlling) {
            Ok(mut entry) => {
                entry.waiters.push(reply);
                self.peers.insert(peer, entry);
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    fn handle_cancel(&mut self, peer: PeerId) {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return;
        };

        entry.cancel.cancel();
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Err(ConnectionError::Cancelled));
        }
    }

    fn on_negotiation(&mut self, envelope: SignalingEnvelope) {
        let peer = envelope.from;
        let negotiation = match Negotiation::from_envelope(&envelope) {
            Ok(negotiation) => negotiation,
            Err(err) => {
                warn!(%peer, "invalid negotiation message: {err}");
                return;
            }
        };

        match negotiation {
            Negotiation::Offer {
                connection,
                description,
            } => self.handle_offer(peer, connection, description),
            negotiation => {
                let Some(entry) = self.peers.get(&peer) else {
                    debug!(%peer, "no connection for {}, dropping it", negotiation.kind());
                    return;
                };
                if entry.connection != negotiation.connection() {
                    debug!(%peer, "dropping {} of stale connection", negotiation.kind());
                    return;
                }
                forward(entry, negotiation);
            }
        }
    }

    fn handle_offer(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        description: SessionDescription,
    ) {
        let mut waiters = Vec::new();

        if let Some(entry) = self.peers.get_mut(&peer) {
            if entry.connection == connection {
                // Retransmitted offer, the answer might have been lost.
                forward(
                    entry,
                    Negotiation::Offer {
                        connection,
                        description,
                    },
                );
                return;
            }

            let pending = !entry.state.is_terminal() && entry.state != ConnectionState::Connected;
            if entry.controlling && pending && self.local_peer < peer {
                debug!(%peer, "both sides offered, keeping our offer");
                return;
            }

            // Either the peer wins the tie-break or it started over.
            debug!(%peer, "replacing connection {} with offered {}", entry.connection, connection);
            entry.cancel.cancel();
            waiters = std::mem::take(&mut entry.waiters);
        }

        match self.start_driver(
            peer,
            connection,
            Role::Controlled {
                offer: description,
            },
        ) {
            Ok(mut entry) => {
                entry.waiters = waiters;
                self.peers.insert(peer, entry);
            }
            Err(err) => {
                warn!(%peer, "could not answer offer: {err}");
                self.peers.remove(&peer);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone().into()));
                }
            }
        }
    }

    fn on_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::State {
                peer,
                connection,
                state,
            } => {
                let Some(entry) = self.current(peer, connection) else {
                    return;
                };
                entry.state = state;
                self.emit(ConnectionEvent::StateChanged { peer, state });
            }
            DriverEvent::Connected { peer, connection } => {
                let Some(entry) = self.current(peer, connection) else {
                    return;
                };
                for waiter in entry.waiters.drain(..) {
                    let _ = waiter.send(Ok(PeerChannel {
                        peer,
                        outbound_tx: entry.outbound_tx.clone(),
                    }));
                }
                self.emit(ConnectionEvent::Connected { peer });
            }
            DriverEvent::Frame {
                peer,
                connection,
                bytes,
            } => {
                if self.current(peer, connection).is_some() {
                    self.emit(ConnectionEvent::Message { peer, bytes });
                }
            }
            DriverEvent::Failed {
                peer,
                connection,
                failure,
            } => {
                let Some(entry) = self.remove(peer, connection) else {
                    return;
                };
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(failure.clone().into()));
                }
                self.emit(ConnectionEvent::Failed { peer, failure });
            }
            DriverEvent::Closed { peer, connection } => {
                let Some(entry) = self.remove(peer, connection) else {
                    return;
                };
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(ConnectionError::Closed));
                }
                self.emit(ConnectionEvent::Closed { peer });
            }
        }
    }

    fn start_driver(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        role: Role,
    ) -> Result<PeerEntry, TransportError> {
        let transport = Arc::new(self.factory.create(&peer)?);
        let (negotiation_tx, negotiation_rx) = mpsc::channel(NEGOTIATION_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let controlling = matches!(role, Role::Controlling);

        debug!(%peer, connection, controlling, "start connection attempt");

        let driver = Driver {
            peer,
            connection,
            role,
            transport,
            signaling: self.signaling.clone(),
            config: self.config.clone(),
            negotiation_rx,
            outbound_rx,
            events_tx: self.driver_tx.clone(),
            cancel: cancel.clone(),
            state: ConnectionState::Idle,
            deadline: Instant::now() + self.config.connect_timeout,
        };
        tokio::spawn(driver.run());

        Ok(PeerEntry {
            connection,
            controlling,
            state: ConnectionState::Idle,
            cancel,
            negotiation_tx,
            outbound_tx,
            waiters: Vec::new(),
        })
    }

    /// Returns the entry of a peer if it belongs to the given connection attempt.
    fn current(&mut self, peer: PeerId, connection: ConnectionId) -> Option<&mut PeerEntry> {
        self.peers
            .get_mut(&peer)
            .filter(|entry| entry.connection == connection)
    }

    fn remove(&mut self, peer: PeerId, connection: ConnectionId) -> Option<PeerEntry> {
        self.current(peer, connection)?;
        self.peers.remove(&peer)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }
}

fn forward(entry: &PeerEntry, negotiation: Negotiation) {
    if entry.negotiation_tx.try_send(negotiation).is_err() {
        debug!("negotiation queue of connection {} is full", entry.connection);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionState;
    use crate::signaling::EnvelopeKind;
    use crate::test_utils::{
        MemoryNetwork, MemoryRelay, generate_peer, setup_logging, spawn_connection_manager,
        wait_for_event,
    };

    use super::ConnectionEvent;

    fn addr(value: &str) -> SocketAddr {
        value.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_exchanges_frames() {
        setup_logging();

        let relay = MemoryRelay::new();
        let network = MemoryNetwork::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);
        let alice_addr = addr("10.0.0.1:4000");
        let bob_addr = addr("10.0.0.2:4000");
        network.link(alice_addr, bob_addr, Duration::from_millis(10));

        let (alice_manager, mut alice_events) = spawn_connection_manager(
            alice,
            &relay,
            network.transport_factory(alice_addr, None),
            ConnectionConfig::default(),
        );
        let (bob_manager, mut bob_events) = spawn_connection_manager(
            bob,
            &relay,
            network.transport_factory(bob_addr, None),
            ConnectionConfig::default(),
        );

        let channel = alice_manager.connect(bob).await.unwrap();
        assert_eq!(channel.peer(), bob);
        assert_eq!(
            alice_manager.state(bob).await.unwrap(),
            Some(ConnectionState::Connected)
        );

        channel.send(b"ping".to_vec()).await.unwrap();
        let event = wait_for_event(&mut bob_events, |event| {
            matches!(event, ConnectionEvent::Message { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Message {
                peer: alice,
                bytes: b"ping".to_vec(),
            }
        );

        // The answering side uses the connection which is already established.
        let reply = bob_manager.connect(alice).await.unwrap();
        reply.send(b"pong".to_vec()).await.unwrap();
        let event = wait_for_event(&mut alice_events, |event| {
            matches!(event, ConnectionEvent::Message { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Message {
                peer: bob,
                bytes: b"pong".to_vec(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_connects_agree_on_one_connection() {
        let relay = MemoryRelay::new();
        let network = MemoryNetwork::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);
        let alice_addr = addr("10.0.0.1:4000");
        let bob_addr = addr("10.0.0.2:4000");
        network.link(alice_addr, bob_addr, Duration::from_millis(10));

        let (alice_manager, _alice_events) = spawn_connection_manager(
            alice,
            &relay,
            network.transport_factory(alice_addr, None),
            ConnectionConfig::default(),
        );
        let (bob_manager, mut bob_events) = spawn_connection_manager(
            bob,
            &relay,
            network.transport_factory(bob_addr, None),
            ConnectionConfig::default(),
        );

        let (alice_channel, bob_channel) =
            tokio::join!(alice_manager.connect(bob), bob_manager.connect(alice));
        let alice_channel = alice_channel.unwrap();
        let bob_channel = bob_channel.unwrap();
        assert!(!alice_channel.is_closed());
        assert!(!bob_channel.is_closed());

        alice_channel.send(b"hello".to_vec()).await.unwrap();
        let event = wait_for_event(&mut bob_events, |event| {
            matches!(event, ConnectionEvent::Message { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Message {
                peer: alice,
                bytes: b"hello".to_vec(),
            }
        );

        // The losing attempt got released, one transport per side is left.
        assert_eq!(network.active_transports(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_notifies_remote_peer() {
        let relay = MemoryRelay::new();
        let network = MemoryNetwork::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);
        let alice_addr = addr("10.0.0.1:4000");
        let bob_addr = addr("10.0.0.2:4000");
        network.link(alice_addr, bob_addr, Duration::from_millis(10));

        let (alice_manager, mut alice_events) = spawn_connection_manager(
            alice,
            &relay,
            network.transport_factory(alice_addr, None),
            ConnectionConfig::default(),
        );
        let (bob_manager, mut bob_events) = spawn_connection_manager(
            bob,
            &relay,
            network.transport_factory(bob_addr, None),
            ConnectionConfig::default(),
        );

        let channel = alice_manager.connect(bob).await.unwrap();
        wait_for_event(&mut bob_events, |event| {
            matches!(event, ConnectionEvent::Connected { .. })
        })
        .await;

        alice_manager.cancel(bob).await.unwrap();

        let event = wait_for_event(&mut alice_events, |event| {
            matches!(event, ConnectionEvent::Closed { .. })
        })
        .await;
        assert_eq!(event, ConnectionEvent::Closed { peer: bob });
        let event = wait_for_event(&mut bob_events, |event| {
            matches!(event, ConnectionEvent::Closed { .. })
        })
        .await;
        assert_eq!(event, ConnectionEvent::Closed { peer: alice });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.is_closed());
        assert_eq!(alice_manager.state(bob).await.unwrap(), None);
        assert_eq!(bob_manager.state(alice).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_lost_offer() {
        let relay = MemoryRelay::new();
        let network = MemoryNetwork::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);
        let alice_addr = addr("10.0.0.1:4000");
        let bob_addr = addr("10.0.0.2:4000");
        network.link(alice_addr, bob_addr, Duration::from_millis(10));

        let (alice_manager, _alice_events) = spawn_connection_manager(
            alice,
            &relay,
            network.transport_factory(alice_addr, None),
            ConnectionConfig::default(),
        );
        let (_bob_manager, _bob_events) = spawn_connection_manager(
            bob,
            &relay,
            network.transport_factory(bob_addr, None),
            ConnectionConfig::default(),
        );

        relay.drop_next(EnvelopeKind::Offer, 1);

        let started = tokio::time::Instant::now();
        alice_manager.connect(bob).await.unwrap();

        // First offer after gathering is lost, the retransmission two seconds later is answered.
        let config = ConnectionConfig::default();
        assert!(started.elapsed() >= config.min_gathering_time + config.retransmit_interval);
        assert!(started.elapsed() < config.connect_timeout);
    }
}
