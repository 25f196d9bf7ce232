// SPDX-License-Identifier: MIT OR Apache-2.0

//! `murmur-encryption` provides the cryptographic core of murmur's peer-to-peer sessions: identity
//! and pre-key management, X3DH session establishment, the Double Ratchet for 1:1 sessions and
//! sender-key chains for groups.
//!
//! ## Sessions
//!
//! A peer publishes a [`PrekeyBundle`](key_bundle::PrekeyBundle) from its
//! [`KeyStore`](key_store::KeyStore). Anyone holding that bundle can start a session with
//! [`x3dh::initiate`], even while the owner is offline. The responder repeats the key agreement
//! with [`x3dh::respond`] once the first message arrives, consuming the one-time pre-key it named.
//!
//! Both sides then turn the shared secret into a [`SessionState`](double_ratchet::SessionState)
//! and exchange messages through [`DoubleRatchet`](double_ratchet::DoubleRatchet). Every message
//! is encrypted with its own key which is deleted right after use (forward secrecy) and every
//! round-trip mixes fresh Diffie-Hellman output into the session (break-in recovery).
//!
//! ## Groups
//!
//! [`GroupSession`](group::GroupSession) encrypts a message once for all members of a group. Each
//! member distributes its own sender chain over the pairwise sessions; membership changes move the
//! group into a new epoch where all chains are replaced.
//!
//! ## State handling
//!
//! Session and group operations follow the same pattern: they take the current state by value and
//! return the new state together with their output. The caller persists the new state before it
//! emits a ciphertext or hands out a plaintext, and keeps the old state around in case of an error.
//!
//! ```
//! use murmur_encryption::crypto::Rng;
//! use murmur_encryption::double_ratchet::{DoubleRatchet, RatchetConfig};
//! use murmur_encryption::key_store::{KeyStore, KeyStoreConfig};
//! use murmur_encryption::x3dh;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rng = Rng::default();
//!
//! let alice = KeyStore::new(
//!     KeyStore::generate_identity(&rng)?,
//!     KeyStoreConfig::default(),
//!     Rng::default(),
//! )?;
//! let bob = KeyStore::new(
//!     KeyStore::generate_identity(&rng)?,
//!     KeyStoreConfig::default(),
//!     Rng::default(),
//! )?;
//!
//! // Alice starts a session with Bob's published bundle.
//! let initiated = x3dh::initiate(alice.identity(), &bob.publish_bundle()?, &rng)?;
//! let alice_session = DoubleRatchet::init_initiator(initiated);
//! let (_alice_session, message) = DoubleRatchet::encrypt(alice_session, b"hello", &rng)?;
//!
//! // Bob repeats the key agreement with the handshake attached to the message.
//! let handshake = message.handshake.as_ref().expect("first message carries handshake");
//! let prekey_secret = bob.signed_prekey_secret(handshake.signed_prekey_id)?;
//! let onetime_secret = handshake
//!     .onetime_prekey_id
//!     .map(|id| bob.consume_one_time_prekey(id))
//!     .transpose()?;
//! let (secret, associated_data) =
//!     x3dh::respond(bob.identity(), handshake, &prekey_secret, onetime_secret.as_ref())?;
//! let bob_session = DoubleRatchet::init_responder(secret, associated_data, handshake);
//!
//! let (_bob_session, plaintext) =
//!     DoubleRatchet::decrypt(bob_session, &message, &RatchetConfig::default())?;
//! assert_eq!(plaintext, b"hello");
//! # Ok(())
//! # }
//! ```
pub mod cbor;
pub mod crypto;
pub mod double_ratchet;
pub mod group;
pub mod identity;
pub mod key_bundle;
pub mod key_store;
pub mod x3dh;

pub use double_ratchet::{DoubleRatchet, RatchetConfig, RatchetError, RatchetMessage, SessionState};
pub use group::{GroupConfig, GroupError, GroupId, GroupMessage, GroupSession, GroupState};
pub use identity::{IdentityKey, IdentityKeyPair};
pub use key_bundle::PrekeyBundle;
pub use key_store::{KeyStore, KeyStoreConfig, KeyStoreError, KeyStoreState};
pub use x3dh::{HandshakeHeader, X3dhError};
