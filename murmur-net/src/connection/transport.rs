// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seams towards the network stack establishing direct connections.
//!
//! The connection manager drives candidate gathering, checks and nomination itself, the transport
//! only needs to perform the individual network operations.
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PeerId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Address of a local interface.
    Host,
    /// Public address as seen by a STUN server.
    ServerReflexive,
}

/// Network address under which a peer might be reachable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: SocketAddr,
}

impl Candidate {
    pub fn host(address: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::Host,
            address,
        }
    }

    pub fn server_reflexive(address: SocketAddr) -> Self {
        Self {
            kind: CandidateKind::ServerReflexive,
            address,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
        };
        write!(f, "{kind} {}", self.address)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

/// Transport parameters exchanged in offers and answers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Identifies the transport instance on the remote side.
    pub ufrag: String,
}

/// Creates one transport per connection attempt.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: IceTransport;

    fn create(&self, peer: &PeerId) -> Result<Self::Transport, TransportError>;
}

/// Network side of a single connection attempt.
///
/// Dropping the transport releases all of its resources.
pub trait IceTransport: Send + Sync + 'static {
    type Channel: DataChannel;

    fn local_description(&self) -> SessionDescription;

    fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), TransportError>;

    fn add_remote_candidate(&self, candidate: Candidate);

    /// Addresses of local network interfaces.
    fn gather_host_candidates(
        &self,
    ) -> impl Future<Output = Result<Vec<Candidate>, TransportError>> + Send;

    /// Public addresses learned from STUN servers.
    fn gather_reflexive_candidates(
        &self,
    ) -> impl Future<Output = Result<Vec<Candidate>, TransportError>> + Send;

    /// Runs a connectivity check on a pair and returns the measured round-trip time.
    fn check(
        &self,
        pair: CandidatePair,
    ) -> impl Future<Output = Result<Duration, TransportError>> + Send;

    /// Opens the data channel over the nominated pair (controlling side).
    fn connect(
        &self,
        pair: CandidatePair,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Waits for the remote peer to open the data channel (controlled side).
    fn accept(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

/// Reliable, ordered channel of binary frames.
pub trait DataChannel: Send + 'static {
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the next frame or `None` when the channel was closed by the remote peer.
    fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;

    fn close(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{0} is unreachable")]
    Unreachable(SocketAddr),

    #[error("remote description is missing")]
    NoRemoteDescription,

    #[error("gathering failed: {0}")]
    Gathering(String),

    #[error("data channel closed")]
    Closed,
}
