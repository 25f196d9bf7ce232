// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doctest, doc=include_str!("../README.md"))]

//! `murmur-net` carries end-to-end encrypted messages between peers over direct connections.
//!
//! Peers find each other through a small signaling relay which only forwards connection offers,
//! answers, network candidates and presence. With these the [`ConnectionManager`] negotiates a
//! direct data channel. The [`SessionOrchestrator`] encrypts application messages for a peer once
//! that channel is ready, using the X3DH handshake and Double Ratchet of `murmur-encryption`, and
//! decrypts everything arriving on it.
//!
//! The relay, the network transport, the pre-key bundle directory and the storage are traits, so
//! applications bring their own. In-memory implementations for tests are available behind the
//! `test_utils` feature, a WebSocket relay client behind the default `websocket` feature.
pub mod config;
pub mod connection;
pub mod directory;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::Config;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, PeerChannel};
pub use directory::{BundleDirectory, MemoryDirectory};
pub use session::{SendError, SessionEvent, SessionOrchestrator, SessionStorage};
pub use signaling::{SignalingClient, SignalingEnvelope, SignalingStatus};

/// Peers are addressed by their long-term identity key.
pub type PeerId = murmur_encryption::IdentityKey;
