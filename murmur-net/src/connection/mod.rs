// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct peer-to-peer connections negotiated over the signaling relay.
//!
//! The offering side gathers its candidates, sends an offer and waits for the answer. Afterwards
//! it tests every pair of local and remote candidates concurrently and nominates the pair with the
//! lowest round-trip time. The answering side waits for the data channel to be opened over the
//! nominated pair.
mod driver;
mod manager;
mod negotiation;
mod state;
pub mod transport;

pub use manager::{
    ConnectionError, ConnectionEvent, ConnectionManager, PeerChannel, ToConnectionActor,
};
pub use negotiation::{ConnectionId, Negotiation, NegotiationError};
pub use state::{ConnectionFailure, ConnectionState, FailureReason};
pub use transport::{
    Candidate, CandidateKind, CandidatePair, DataChannel, IceTransport, SessionDescription,
    TransportError, TransportFactory,
};
