// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::PeerId;
use crate::signaling::relay::{RelayConnection, RelayConnector, RelayError};
use crate::signaling::{EnvelopeKind, SignalingEnvelope};

/// Signaling relay routing envelopes between in-process clients.
#[derive(Clone, Debug)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

#[derive(Debug)]
struct RelayState {
    online: bool,
    clients: HashMap<PeerId, mpsc::UnboundedSender<SignalingEnvelope>>,
    attempts: HashMap<PeerId, u32>,
    drop_rules: HashMap<EnvelopeKind, usize>,
    routed: usize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayState {
                online: true,
                clients: HashMap::new(),
                attempts: HashMap::new(),
                drop_rules: HashMap::new(),
                routed: 0,
            })),
        }
    }

    pub fn connector(&self, peer: PeerId) -> MemoryRelayConnector {
        MemoryRelayConnector {
            relay: self.clone(),
            peer,
        }
    }

    /// Taking the relay offline closes all client connections and refuses new ones.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            state.clients.clear();
        }
    }

    /// Silently drops the next `count` envelopes of the given kind.
    pub fn drop_next(&self, kind: EnvelopeKind, count: usize) {
        self.lock().drop_rules.insert(kind, count);
    }

    /// Delivers an envelope to a client, no matter whom it is addressed to.
    pub fn inject(&self, peer: PeerId, envelope: SignalingEnvelope) {
        if let Some(client) = self.lock().clients.get(&peer) {
            let _ = client.send(envelope);
        }
    }

    pub fn connect_attempts(&self, peer: PeerId) -> u32 {
        self.lock().attempts.get(&peer).copied().unwrap_or_default()
    }

    /// Number of envelopes delivered so far.
    pub fn routed(&self) -> usize {
        self.lock().routed
    }

    fn route(&self, envelope: SignalingEnvelope) -> Result<(), RelayError> {
        let mut state = self.lock();
        if !state.online {
            return Err(RelayError::Closed);
        }

        if let Some(count) = state.drop_rules.get_mut(&envelope.kind) {
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
        }

        // Envelopes for peers which are not connected get lost.
        if let Some(client) = state.clients.get(&envelope.to) {
            if client.send(envelope).is_ok() {
                state.routed += 1;
            }
        }

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug)]
pub struct MemoryRelayConnector {
    relay: MemoryRelay,
    peer: PeerId,
}

impl RelayConnector for MemoryRelayConnector {
    type Connection = MemoryRelayConnection;

    async fn connect(&self) -> Result<Self::Connection, RelayError> {
        let mut state = self.relay.lock();
        *state.attempts.entry(self.peer).or_default() += 1;
        if !state.online {
            return Err(RelayError::Unreachable("relay is offline".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(self.peer, tx);

        Ok(MemoryRelayConnection {
            relay: self.relay.clone(),
            rx,
        })
    }
}

#[derive(Debug)]
pub struct MemoryRelayConnection {
    relay: MemoryRelay,
    rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
}

impl RelayConnection for MemoryRelayConnection {
    async fn send(&mut self, envelope: &SignalingEnvelope) -> Result<(), RelayError> {
        self.relay.route(envelope.clone())
    }

    async fn recv(&mut self) -> Option<Result<SignalingEnvelope, RelayError>> {
        self.rx.recv().await.map(Ok)
    }
}
