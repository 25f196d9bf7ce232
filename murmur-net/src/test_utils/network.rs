// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::PeerId;
use crate::connection::transport::{
    Candidate, CandidatePair, DataChannel, IceTransport, SessionDescription, TransportError,
    TransportFactory,
};

/// Time until a connectivity check over an unreachable pair gives up.
const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Simulated network with configurable links between addresses.
///
/// Addresses can reach each other only if a link between them was added. Transports register
/// themselves under their ufrag and are removed when dropped.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<String, mpsc::UnboundedSender<MemoryChannel>>,
    links: HashMap<(SocketAddr, SocketAddr), Duration>,
    next_ufrag: u64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects two addresses with the given one-way latency.
    pub fn link(&self, a: SocketAddr, b: SocketAddr, latency: Duration) {
        self.lock().links.insert(ordered(a, b), latency);
    }

    pub fn unlink(&self, a: SocketAddr, b: SocketAddr) {
        self.lock().links.remove(&ordered(a, b));
    }

    /// Number of transports which were not released yet.
    pub fn active_transports(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn transport_factory(
        &self,
        host: SocketAddr,
        reflexive: Option<SocketAddr>,
    ) -> MemoryTransportFactory {
        MemoryTransportFactory {
            network: self.clone(),
            host,
            reflexive,
            reflexive_delay: Duration::from_millis(100),
        }
    }

    fn latency(&self, a: SocketAddr, b: SocketAddr) -> Option<Duration> {
        self.lock().links.get(&ordered(a, b)).copied()
    }

    fn endpoint(&self, ufrag: &str) -> Option<mpsc::UnboundedSender<MemoryChannel>> {
        self.lock().endpoints.get(ufrag).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ordered(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Creates transports of one simulated host.
#[derive(Clone, Debug)]
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
    host: SocketAddr,
    reflexive: Option<SocketAddr>,
    reflexive_delay: Duration,
}

impl MemoryTransportFactory {
    /// Time the simulated STUN lookup takes.
    ///
    /// Defaults to 100 milliseconds.
    pub fn with_reflexive_delay(mut self, delay: Duration) -> Self {
        self.reflexive_delay = delay;
        self
    }
}

impl TransportFactory for MemoryTransportFactory {
    type Transport = MemoryTransport;

    fn create(&self, _peer: &PeerId) -> Result<Self::Transport, TransportError> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let ufrag = {
            let mut state = self.network.lock();
            state.next_ufrag += 1;
            let ufrag = format!("ufrag-{}", state.next_ufrag);
            state.endpoints.insert(ufrag.clone(), incoming_tx);
            ufrag
        };

        Ok(MemoryTransport {
            network: self.network.clone(),
            ufrag,
            host: self.host,
            reflexive: self.reflexive,
            reflexive_delay: self.reflexive_delay,
            remote: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(incoming_rx),
        })
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    ufrag: String,
    host: SocketAddr,
    reflexive: Option<SocketAddr>,
    reflexive_delay: Duration,
    remote: Mutex<Option<SessionDescription>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryChannel>>,
}

impl MemoryTransport {
    fn remote_ufrag(&self) -> Result<String, TransportError> {
        self.remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|description| description.ufrag.clone())
            .ok_or(TransportError::NoRemoteDescription)
    }

    /// Latency of the pair if the remote transport is alive and reachable.
    fn reachable(&self, pair: &CandidatePair) -> Result<Duration, TransportError> {
        let ufrag = self.remote_ufrag()?;
        match (
            self.network.endpoint(&ufrag),
            self.network
                .latency(pair.local.address, pair.remote.address),
        ) {
            (Some(_), Some(latency)) => Ok(latency),
            _ => Err(TransportError::Unreachable(pair.remote.address)),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.lock().endpoints.remove(&self.ufrag);
    }
}

impl IceTransport for MemoryTransport {
    type Channel = MemoryChannel;

    fn local_description(&self) -> SessionDescription {
        SessionDescription {
            ufrag: self.ufrag.clone(),
        }
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = Some(description);
        Ok(())
    }

    fn add_remote_candidate(&self, _candidate: Candidate) {}

    async fn gather_host_candidates(&self) -> Result<Vec<Candidate>, TransportError> {
        Ok(vec![Candidate::host(self.host)])
    }

    async fn gather_reflexive_candidates(&self) -> Result<Vec<Candidate>, TransportError> {
        tokio::time::sleep(self.reflexive_delay).await;
        Ok(self
            .reflexive
            .map(Candidate::server_reflexive)
            .into_iter()
            .collect())
    }

    async fn check(&self, pair: CandidatePair) -> Result<Duration, TransportError> {
        match self.reachable(&pair) {
            Ok(latency) => {
                let rtt = latency * 2;
                tokio::time::sleep(rtt).await;
                Ok(rtt)
            }
            Err(err) => {
                tokio::time::sleep(CHECK_TIMEOUT).await;
                Err(err)
            }
        }
    }

    async fn connect(&self, pair: CandidatePair) -> Result<MemoryChannel, TransportError> {
        let latency = self.reachable(&pair)?;
        tokio::time::sleep(latency).await;

        let endpoint = self
            .network
            .endpoint(&self.remote_ufrag()?)
            .ok_or(TransportError::Unreachable(pair.remote.address))?;

        let (local_tx, remote_rx) = mpsc::unbounded_channel();
        let (remote_tx, local_rx) = mpsc::unbounded_channel();
        endpoint
            .send(MemoryChannel {
                tx: Some(remote_tx),
                rx: remote_rx,
            })
            .map_err(|_| TransportError::Unreachable(pair.remote.address))?;

        Ok(MemoryChannel {
            tx: Some(local_tx),
            rx: local_rx,
        })
    }

    async fn accept(&self) -> Result<MemoryChannel, TransportError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TransportError::Closed)
    }
}

/// One end of an in-memory data channel.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl DataChannel for MemoryChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
