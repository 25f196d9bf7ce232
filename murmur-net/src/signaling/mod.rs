// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client of the signaling relay.
//!
//! Peers which want to connect directly first need to exchange connection offers, answers and
//! network candidates. The relay forwards these as JSON envelopes between connected clients. It is
//! not trusted: everything passing through it is either public connection metadata or checked
//! later by the encrypted session on top of the direct connection.
mod backoff;
mod client;
mod envelope;
pub mod relay;

pub use backoff::Backoff;
pub use client::{SignalingClient, SignalingError, SignalingStatus, ToSignalingActor};
pub use envelope::{EnvelopeKind, Presence, PresenceStatus, SignalingEnvelope};
pub use relay::{RelayConnection, RelayConnector, RelayError};
