// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::PeerId;
use crate::config::SignalingConfig;
use crate::signaling::backoff::Backoff;
use crate::signaling::relay::{RelayConnection, RelayConnector};
use crate::signaling::{EnvelopeKind, Presence, PresenceStatus, SignalingEnvelope};

const PRESENCE_CHANNEL_CAPACITY: usize = 64;

const NEGOTIATION_CHANNEL_CAPACITY: usize = 256;

/// Connection state of the client towards the relay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignalingStatus {
    Connecting,
    Connected,
    /// The relay could not be reached after the given number of attempts in a row. The client
    /// does not try again.
    Failed { attempts: u32 },
    Stopped,
}

#[derive(Debug)]
pub enum ToSignalingActor {
    /// Forward an envelope to the relay.
    Send { envelope: SignalingEnvelope },
    /// Terminate the actor.
    Shutdown,
}

impl Display for ToSignalingActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToSignalingActor::Send { envelope } => {
                write!(f, "send {} envelope to peer {}", envelope.kind, envelope.to)
            }
            ToSignalingActor::Shutdown => write!(f, "shutdown the actor"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PresencePayload {
    status: PresenceStatus,
}

/// Handle to the signaling actor.
///
/// The actor keeps a connection to the relay alive, reconnecting with exponential backoff when it
/// drops. Outgoing envelopes are delivered at most once: they are queued without waiting and
/// dropped if the queue is full or the relay is currently unreachable.
///
/// Negotiation envelopes addressed to us are forwarded in arrival order to the receiver returned
/// by [`SignalingClient::spawn`]. Presence announcements can be observed with
/// [`SignalingClient::subscribe_presence`].
#[derive(Clone, Debug)]
pub struct SignalingClient {
    local_peer: PeerId,
    actor_tx: mpsc::Sender<ToSignalingActor>,
    presence_tx: broadcast::Sender<Presence>,
    status_rx: watch::Receiver<SignalingStatus>,
}

impl SignalingClient {
    /// Launches the signaling actor on the current tokio runtime.
    pub fn spawn<C: RelayConnector>(
        local_peer: PeerId,
        connector: C,
        config: SignalingConfig,
    ) -> (Self, mpsc::Receiver<SignalingEnvelope>) {
        let (actor_tx, inbox) = mpsc::channel(config.queue_capacity.max(1));
        let (negotiation_tx, negotiation_rx) = mpsc::channel(NEGOTIATION_CHANNEL_CAPACITY);
        let (presence_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SignalingStatus::Connecting);

        let actor = SignalingActor {
            local_peer,
            connector,
            backoff: Backoff::new(config.backoff.clone(), ChaCha20Rng::from_os_rng()),
            config,
            inbox,
            negotiation_tx,
            presence_tx: presence_tx.clone(),
            status_tx,
        };
        tokio::spawn(actor.run());

        let client = Self {
            local_peer,
            actor_tx,
            presence_tx,
            status_rx,
        };

        (client, negotiation_rx)
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Queues an envelope for the relay without waiting.
    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.actor_tx
            .try_send(ToSignalingActor::Send { envelope })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SignalingError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SignalingError::Stopped,
            })
    }

    /// Wraps a payload into an envelope from us to the given peer and queues it.
    pub fn send_to(
        &self,
        to: PeerId,
        kind: EnvelopeKind,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        self.send(SignalingEnvelope {
            from: self.local_peer,
            to,
            kind,
            payload,
        })
    }

    /// Tells the given peers about our availability.
    pub fn announce_presence(
        &self,
        peers: impl IntoIterator<Item = PeerId>,
        status: PresenceStatus,
    ) -> Result<(), SignalingError> {
        let payload = serde_json::to_value(PresencePayload { status })?;
        for peer in peers {
            self.send_to(peer, EnvelopeKind::Presence, payload.clone())?;
        }
        Ok(())
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<Presence> {
        self.presence_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SignalingStatus> {
        self.status_rx.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.actor_tx.send(ToSignalingActor::Shutdown).await;
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("outgoing signaling queue is full")]
    QueueFull,

    #[error("signaling client stopped")]
    Stopped,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

struct SignalingActor<C: RelayConnector> {
    local_peer: PeerId,
    connector: C,
    config: SignalingConfig,
    backoff: Backoff,
    inbox: mpsc::Receiver<ToSignalingActor>,
    negotiation_tx: mpsc::Sender<SignalingEnvelope>,
    presence_tx: broadcast::Sender<Presence>,
    status_tx: watch::Sender<SignalingStatus>,
}

impl<C: RelayConnector> SignalingActor<C> {
    async fn run(mut self) {
        loop {
            let Some(connection) = self.connect().await else {
                break;
            };

            self.backoff.reset();
            self.status_tx.send_replace(SignalingStatus::Connected);
            debug!(peer = %self.local_peer, "signaling relay connected");

            if !self.serve(connection).await {
                break;
            }
        }

        if !matches!(*self.status_tx.borrow(), SignalingStatus::Failed { .. }) {
            self.status_tx.send_replace(SignalingStatus::Stopped);
        }
    }

    /// Tries to connect until it succeeds, gives up or the actor is shut down.
    async fn connect(&mut self) -> Option<C::Connection> {
        let mut failures = 0;

        loop {
            self.status_tx.send_replace(SignalingStatus::Connecting);

            let connect = self.connector.connect();
            tokio::pin!(connect);

            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    msg = self.inbox.recv() => {
                        if !on_disconnected_message(msg) {
                            return None;
                        }
                    }
                }
            };

            match result {
                Ok(connection) => return Some(connection),
                Err(err) => {
                    failures += 1;
                    warn!(attempt = failures, "could not connect to signaling relay: {err}");

                    if failures >= self.config.max_attempts {
                        self.status_tx
                            .send_replace(SignalingStatus::Failed { attempts: failures });
                        return None;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            trace!("reconnect to signaling relay in {} ms", delay.as_millis());
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    msg = self.inbox.recv() => {
                        if !on_disconnected_message(msg) {
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Serves an established connection. Returns true if we should reconnect.
    async fn serve(&mut self, mut connection: C::Connection) -> bool {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        return false;
                    };
                    trace!("{msg}");

                    match msg {
                        ToSignalingActor::Send { envelope } => {
                            if let Err(err) = connection.send(&envelope).await {
                                warn!("lost {} envelope to {}: {err}", envelope.kind, envelope.to);
                                return true;
                            }
                        }
                        ToSignalingActor::Shutdown => return false,
                    }
                },
                result = connection.recv() => {
                    match result {
                        Some(Ok(envelope)) => self.dispatch(envelope).await,
                        Some(Err(err)) => {
                            warn!("signaling relay connection failed: {err}");
                            return true;
                        }
                        None => {
                            debug!("signaling relay closed the connection");
                            return true;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, envelope: SignalingEnvelope) {
        if envelope.to != self.local_peer {
            debug!(
                "dropping {} envelope addressed to {}",
                envelope.kind, envelope.to
            );
            return;
        }

        if envelope.from == self.local_peer {
            return;
        }

        match envelope.kind {
            EnvelopeKind::Presence => {
                match serde_json::from_value::<PresencePayload>(envelope.payload) {
                    Ok(payload) => {
                        // No subscribers is fine.
                        let _ = self.presence_tx.send(Presence {
                            peer: envelope.from,
                            status: payload.status,
                        });
                    }
                    Err(err) => warn!("invalid presence from {}: {err}", envelope.from),
                }
            }
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::Candidate => {
                if self.negotiation_tx.send(envelope).await.is_err() {
                    debug!("no negotiation subscriber left, dropping envelope");
                }
            }
        }
    }
}

/// Handles actor messages while there is no relay connection. Returns false if the actor should
/// stop.
fn on_disconnected_message(msg: Option<ToSignalingActor>) -> bool {
    match msg {
        Some(ToSignalingActor::Send { envelope }) => {
            debug!(
                "dropping {} envelope to {}, relay is not connected",
                envelope.kind, envelope.to
            );
            true
        }
        Some(ToSignalingActor::Shutdown) | None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::config::SignalingConfig;
    use crate::signaling::{EnvelopeKind, PresenceStatus, SignalingEnvelope};
    use crate::test_utils::{MemoryRelay, generate_peer};

    use super::{SignalingClient, SignalingStatus};

    async fn wait_for_status(client: &SignalingClient, expected: SignalingStatus) {
        let mut status = client.status();
        status
            .wait_for(|status| *status == expected)
            .await
            .expect("actor is alive");
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_negotiation_envelopes() {
        let relay = MemoryRelay::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);

        let (alice_client, _alice_rx) =
            SignalingClient::spawn(alice, relay.connector(alice), SignalingConfig::default());
        let (bob_client, mut bob_rx) =
            SignalingClient::spawn(bob, relay.connector(bob), SignalingConfig::default());
        wait_for_status(&alice_client, SignalingStatus::Connected).await;
        wait_for_status(&bob_client, SignalingStatus::Connected).await;

        alice_client
            .send_to(bob, EnvelopeKind::Offer, json!({ "session": 1 }))
            .unwrap();
        alice_client
            .send_to(bob, EnvelopeKind::Candidate, json!({ "session": 1 }))
            .unwrap();

        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.from, alice);
        assert_eq!(envelope.kind, EnvelopeKind::Offer);
        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_envelopes_for_other_peers() {
        let relay = MemoryRelay::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);
        let carol = generate_peer(3);

        let (bob_client, mut bob_rx) =
            SignalingClient::spawn(bob, relay.connector(bob), SignalingConfig::default());
        wait_for_status(&bob_client, SignalingStatus::Connected).await;

        // A misbehaving relay delivers an envelope meant for carol to bob.
        relay.inject(
            bob,
            SignalingEnvelope {
                from: alice,
                to: carol,
                kind: EnvelopeKind::Offer,
                payload: json!(null),
            },
        );
        relay.inject(
            bob,
            SignalingEnvelope {
                from: alice,
                to: bob,
                kind: EnvelopeKind::Answer,
                payload: json!(null),
            },
        );

        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.to, bob);
        assert_eq!(envelope.kind, EnvelopeKind::Answer);
    }

    #[tokio::test(start_paused = true)]
    async fn presence() {
        let relay = MemoryRelay::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);

        let (alice_client, _) =
            SignalingClient::spawn(alice, relay.connector(alice), SignalingConfig::default());
        let (bob_client, _) =
            SignalingClient::spawn(bob, relay.connector(bob), SignalingConfig::default());
        let mut presence = bob_client.subscribe_presence();
        wait_for_status(&alice_client, SignalingStatus::Connected).await;
        wait_for_status(&bob_client, SignalingStatus::Connected).await;

        alice_client
            .announce_presence([bob], PresenceStatus::Online)
            .unwrap();

        let announcement = presence.recv().await.unwrap();
        assert_eq!(announcement.peer, alice);
        assert_eq!(announcement.status, PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_relay_outage() {
        let relay = MemoryRelay::new();
        let alice = generate_peer(1);
        let bob = generate_peer(2);

        let (alice_client, _) =
            SignalingClient::spawn(alice, relay.connector(alice), SignalingConfig::default());
        let (bob_client, mut bob_rx) =
            SignalingClient::spawn(bob, relay.connector(bob), SignalingConfig::default());
        wait_for_status(&alice_client, SignalingStatus::Connected).await;
        wait_for_status(&bob_client, SignalingStatus::Connected).await;

        relay.set_online(false);
        wait_for_status(&alice_client, SignalingStatus::Connecting).await;

        // Envelopes sent while disconnected are lost.
        alice_client
            .send_to(bob, EnvelopeKind::Offer, json!("lost"))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        relay.set_online(true);
        wait_for_status(&alice_client, SignalingStatus::Connected).await;
        wait_for_status(&bob_client, SignalingStatus::Connected).await;

        alice_client
            .send_to(bob, EnvelopeKind::Offer, json!("delivered"))
            .unwrap();
        let envelope = bob_rx.recv().await.unwrap();
        assert_eq!(envelope.payload, json!("delivered"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let relay = MemoryRelay::new();
        relay.set_online(false);
        let alice = generate_peer(1);

        let config = SignalingConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let (alice_client, _) = SignalingClient::spawn(alice, relay.connector(alice), config);

        wait_for_status(&alice_client, SignalingStatus::Failed { attempts: 3 }).await;
        assert_eq!(relay.connect_attempts(alice), 3);

        // The client stays failed, even when the relay comes back.
        relay.set_online(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_matches!(
            *alice_client.status().borrow(),
            SignalingStatus::Failed { attempts: 3 }
        );
        assert_eq!(relay.connect_attempts(alice), 3);
    }
}
