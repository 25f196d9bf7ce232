// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet for 1:1 sessions.
//!
//! Every session keeps two symmetric chains, one for sending and one for receiving. Each message
//! advances its chain with a one-way KDF step, so a leaked chain key can not be used to decrypt
//! earlier messages. Whenever the peer shows a new ratchet key, both sides perform a
//! Diffie-Hellman step which mixes fresh key material into the root key and replaces the chains,
//! healing the session after a compromise.
//!
//! ```text
//!  root key ──KDF_RK(DH)──> root key ──KDF_RK(DH)──> root key ...
//!                 │                          │
//!                 v                          v
//!         chain key ─KDF_CK─> ...     chain key ─KDF_CK─> ...
//!                 │                          │
//!                 v                          v
//!            message key               message key
//! ```
//!
//! The sending half of a DH step is only performed right before the next message is encrypted.
//! Until then the sending chain is "stale" and we keep reporting the length of the previous chain.
//!
//! All operations consume the session state and return the updated state on success. On failure
//! the state is gone; callers keep a copy of the previous state if they want to continue the
//! session after a failed decryption.
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroizing;

use crate::crypto::aead::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE, AeadError, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError, Secret};
use crate::identity::IdentityKey;
use crate::x3dh::{HandshakeHeader, Initiated, X3dhSecret};

pub const CHAIN_KEY_SIZE: usize = 32;

const ROOT_KDF_INFO: &[u8] = b"murmur-ratchet-root";

const CHAIN_KDF_INFO: &[u8] = b"chain";

const MESSAGE_KDF_INFO: &[u8] = b"message";

/// Limits of the ratchet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Maximum number of message keys we derive ahead within one chain to decrypt a message which
    /// arrived early.
    ///
    /// Defaults to 1000.
    pub max_skip: u64,

    /// Maximum number of skipped message keys kept around. The oldest keys are evicted first.
    ///
    /// Defaults to 2000.
    pub max_skipped_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
        }
    }
}

/// Single-use symmetric key and nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MessageKey {
    pub(crate) key: Secret<AEAD_KEY_SIZE>,
    pub(crate) nonce: Secret<AEAD_NONCE_SIZE>,
}

/// Symmetric KDF chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChainState {
    chain_key: Secret<CHAIN_KEY_SIZE>,
    counter: u64,
}

impl ChainState {
    pub(crate) fn new(chain_key: Secret<CHAIN_KEY_SIZE>) -> Self {
        Self {
            chain_key,
            counter: 0,
        }
    }

    /// Derives the message key for the current counter and moves the chain forward.
    pub(crate) fn next_message_key(&mut self) -> Result<(u64, MessageKey), HkdfError> {
        let material = Zeroizing::new(hkdf::<{ AEAD_KEY_SIZE + AEAD_NONCE_SIZE }>(
            b"",
            self.chain_key.as_bytes(),
            Some(MESSAGE_KDF_INFO),
        )?);

        let mut key = [0u8; AEAD_KEY_SIZE];
        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        key.copy_from_slice(&material[..AEAD_KEY_SIZE]);
        nonce.copy_from_slice(&material[AEAD_KEY_SIZE..]);

        let counter = self.counter;
        self.chain_key = Secret::from_bytes(hkdf(
            b"",
            self.chain_key.as_bytes(),
            Some(CHAIN_KDF_INFO),
        )?);
        self.counter += 1;

        Ok((
            counter,
            MessageKey {
                key: Secret::from_bytes(key),
                nonce: Secret::from_bytes(nonce),
            },
        ))
    }

    pub(crate) fn chain_key(&self) -> &Secret<CHAIN_KEY_SIZE> {
        &self.chain_key
    }

    pub(crate) fn counter(&self) -> u64 {
        self.counter
    }

    pub(crate) fn from_parts(chain_key: Secret<CHAIN_KEY_SIZE>, counter: u64) -> Self {
        Self { chain_key, counter }
    }
}

/// Our sending chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum SendingChain {
    /// Responder before sending the first message; there is no ratchet key pair yet.
    Uninitialised,

    /// Chain belonging to the ratchet key pair we are currently advertising.
    Current {
        ratchet: SecretKey,
        chain: ChainState,
    },

    /// The peer moved to a new ratchet key. The next message starts a new chain with a fresh key
    /// pair.
    Stale { previous_chain_length: u64 },
}

/// Receiving chain of the peer's current ratchet key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ReceivingChain {
    ratchet_key: PublicKey,
    chain: ChainState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    counter: u64,
    message_key: MessageKey,
}

/// Insertion-ordered cache of message keys of messages we have not received yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SkippedKeys(VecDeque<SkippedKey>);

impl SkippedKeys {
    fn insert(
        &mut self,
        ratchet_key: PublicKey,
        counter: u64,
        message_key: MessageKey,
        capacity: usize,
    ) {
        self.0.push_back(SkippedKey {
            ratchet_key,
            counter,
            message_key,
        });
        while self.0.len() > capacity {
            self.0.pop_front();
        }
    }

    fn contains(&self, ratchet_key: &PublicKey, counter: u64) -> bool {
        self.0
            .iter()
            .any(|skipped| &skipped.ratchet_key == ratchet_key && skipped.counter == counter)
    }

    fn take(&mut self, ratchet_key: &PublicKey, counter: u64) -> Option<MessageKey> {
        let index = self
            .0
            .iter()
            .position(|skipped| &skipped.ratchet_key == ratchet_key && skipped.counter == counter)?;
        self.0.remove(index).map(|skipped| skipped.message_key)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Header sent in plaintext next to every ciphertext. It is authenticated as part of the
/// associated data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub ratchet_key: PublicKey,
    pub previous_chain_length: u64,
    pub counter: u64,
}

impl MessageHeader {
    fn to_bytes(self) -> [u8; 48] {
        let mut bytes = [0u8; 48];
        bytes[..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..40].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[40..].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }
}

/// Encrypted message of a 1:1 session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: MessageHeader,

    /// Present on messages of the initiator until the responder answered.
    pub handshake: Option<HandshakeHeader>,

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Per-peer session state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    their_identity: IdentityKey,
    associated_data: Vec<u8>,
    root_key: Secret<CHAIN_KEY_SIZE>,
    sending: SendingChain,
    previous_chain_length: u64,
    receiving: Option<ReceivingChain>,
    skipped: SkippedKeys,
    pending_handshake: Option<HandshakeHeader>,

    /// Ephemeral key of the last handshake of the peer we answered.
    #[serde(default)]
    accepted_handshake: Option<PublicKey>,
}

impl SessionState {
    pub fn their_identity(&self) -> &IdentityKey {
        &self.their_identity
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    /// Number of messages sent on our current (or, if stale, previous) sending chain.
    pub fn sending_counter(&self) -> u64 {
        match &self.sending {
            SendingChain::Uninitialised => 0,
            SendingChain::Current { chain, .. } => chain.counter,
            SendingChain::Stale {
                previous_chain_length,
            } => *previous_chain_length,
        }
    }

    /// Number of messages received on the peer's current chain.
    pub fn receiving_counter(&self) -> u64 {
        self.receiving
            .as_ref()
            .map(|receiving| receiving.chain.counter)
            .unwrap_or_default()
    }

    /// Ratchet public key we currently advertise, if we sent anything yet.
    pub fn ratchet_key(&self) -> Option<PublicKey> {
        match &self.sending {
            SendingChain::Current { ratchet, .. } => Some(ratchet.public_key()),
            _ => None,
        }
    }

    /// Ratchet public key of the peer, if we received anything yet.
    pub fn their_ratchet_key(&self) -> Option<&PublicKey> {
        self.receiving.as_ref().map(|receiving| &receiving.ratchet_key)
    }

    /// Handshake we attach to outgoing messages until the peer answered us.
    pub fn pending_handshake(&self) -> Option<&HandshakeHeader> {
        self.pending_handshake.as_ref()
    }

    /// Number of cached message keys for messages which did not arrive yet.
    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    /// Returns true if this session was already established with the given handshake.
    ///
    /// A handshake is only ever answered once, messages carrying it again are replays.
    pub fn has_accepted(&self, handshake: &HandshakeHeader) -> bool {
        self.accepted_handshake.as_ref() == Some(&handshake.ephemeral_key)
    }

    /// Marks the handshake as answered without taking over its session.
    pub fn accept_handshake(&mut self, handshake: &HandshakeHeader) {
        self.accepted_handshake = Some(handshake.ephemeral_key);
    }

    fn route(&self, header: &MessageHeader) -> Route {
        if self.skipped.contains(&header.ratchet_key, header.counter) {
            return Route::Skipped;
        }

        match &self.receiving {
            Some(receiving) if receiving.ratchet_key == header.ratchet_key => Route::CurrentChain,
            _ => Route::NewRatchet,
        }
    }

    /// Performs the sending half of a DH ratchet step.
    fn ratchet_sending(
        &mut self,
        previous_chain_length: u64,
        rng: &Rng,
    ) -> Result<(SecretKey, ChainState), RatchetError> {
        let their_ratchet_key = self
            .receiving
            .as_ref()
            .map(|receiving| receiving.ratchet_key)
            .ok_or(RatchetError::CorruptedState)?;

        let ratchet = SecretKey::generate(rng)?;
        let shared = ratchet
            .calculate_agreement(&their_ratchet_key)
            .map_err(|_| RatchetError::CorruptedState)?;
        let (root_key, chain_key) = kdf_root(&self.root_key, shared.as_bytes())?;

        self.root_key = root_key;
        self.previous_chain_length = previous_chain_length;

        trace!(
            ratchet_key = %ratchet.public_key(),
            previous_chain_length,
            "performed sending ratchet step"
        );

        Ok((ratchet, ChainState::new(chain_key)))
    }
}

/// Where the key for an incoming message comes from.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// A key cached earlier for a message which arrived late.
    Skipped,

    /// The peer's current receiving chain.
    CurrentChain,

    /// The peer moved to a new ratchet key, a DH step is required.
    NewRatchet,
}

/// Root KDF: mixes a DH output into the root key, yielding the next root key and a new chain key.
fn kdf_root(
    root_key: &Secret<CHAIN_KEY_SIZE>,
    dh_output: &[u8],
) -> Result<(Secret<CHAIN_KEY_SIZE>, Secret<CHAIN_KEY_SIZE>), HkdfError> {
    let okm = Zeroizing::new(hkdf::<64>(
        root_key.as_bytes(),
        dh_output,
        Some(ROOT_KDF_INFO),
    )?);

    let mut root = [0u8; CHAIN_KEY_SIZE];
    let mut chain = [0u8; CHAIN_KEY_SIZE];
    root.copy_from_slice(&okm[..CHAIN_KEY_SIZE]);
    chain.copy_from_slice(&okm[CHAIN_KEY_SIZE..]);
    Ok((Secret::from_bytes(root), Secret::from_bytes(chain)))
}

fn aad(associated_data: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 48);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&header.to_bytes());
    aad
}

/// Derives message keys ahead up to (excluding) `until` and caches them.
fn skip_message_keys(
    receiving: &mut ReceivingChain,
    until: u64,
    skipped: &mut SkippedKeys,
    config: &RatchetConfig,
) -> Result<(), RatchetError> {
    if until <= receiving.chain.counter {
        return Ok(());
    }

    let gap = until - receiving.chain.counter;
    if gap > config.max_skip {
        return Err(RatchetError::TooManySkipped(gap, config.max_skip));
    }

    while receiving.chain.counter < until {
        let (counter, message_key) = receiving.chain.next_message_key()?;
        skipped.insert(
            receiving.ratchet_key,
            counter,
            message_key,
            config.max_skipped_keys,
        );
    }

    Ok(())
}

#[derive(Debug)]
pub struct DoubleRatchet;

impl DoubleRatchet {
    /// Session of the initiator after an X3DH handshake.
    ///
    /// The handshake's ephemeral key pair is our first ratchet key pair and the derived chain key
    /// our first sending chain.
    pub fn init_initiator(initiated: Initiated) -> SessionState {
        let Initiated {
            header,
            secret,
            ephemeral_secret,
            their_identity,
            associated_data,
        } = initiated;

        SessionState {
            their_identity,
            associated_data,
            root_key: secret.root_key().clone(),
            sending: SendingChain::Current {
                ratchet: ephemeral_secret,
                chain: ChainState::new(secret.chain_key().clone()),
            },
            previous_chain_length: 0,
            receiving: None,
            skipped: SkippedKeys::default(),
            pending_handshake: Some(header),
            accepted_handshake: None,
        }
    }

    /// Session of the responder after an X3DH handshake.
    pub fn init_responder(
        secret: X3dhSecret,
        associated_data: Vec<u8>,
        header: &HandshakeHeader,
    ) -> SessionState {
        SessionState {
            their_identity: header.identity_key,
            associated_data,
            root_key: secret.root_key().clone(),
            sending: SendingChain::Uninitialised,
            previous_chain_length: 0,
            receiving: Some(ReceivingChain {
                ratchet_key: header.ephemeral_key,
                chain: ChainState::new(secret.chain_key().clone()),
            }),
            skipped: SkippedKeys::default(),
            pending_handshake: None,
            accepted_handshake: Some(header.ephemeral_key),
        }
    }

    /// Encrypts the next message.
    ///
    /// Fails only if the local state is corrupted or the random number generator is broken.
    pub fn encrypt(
        mut y: SessionState,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<(SessionState, RatchetMessage), RatchetError> {
        let sending = std::mem::replace(&mut y.sending, SendingChain::Uninitialised);
        let (ratchet, mut chain) = match sending {
            SendingChain::Current { ratchet, chain } => (ratchet, chain),
            SendingChain::Uninitialised => y.ratchet_sending(0, rng)?,
            SendingChain::Stale {
                previous_chain_length,
            } => y.ratchet_sending(previous_chain_length, rng)?,
        };

        let (counter, message_key) = chain.next_message_key()?;
        let header = MessageHeader {
            ratchet_key: ratchet.public_key(),
            previous_chain_length: y.previous_chain_length,
            counter,
        };

        let ciphertext = aead_encrypt(
            message_key.key.as_bytes(),
            plaintext,
            message_key.nonce.as_bytes(),
            &aad(&y.associated_data, &header),
        )?;

        y.sending = SendingChain::Current { ratchet, chain };
        let handshake = y.pending_handshake.clone();

        Ok((
            y,
            RatchetMessage {
                header,
                handshake,
                ciphertext,
            },
        ))
    }

    /// Decrypts a message of the peer.
    ///
    /// Every cryptographic failure surfaces as the same `DecryptionFailed` error, details are only
    /// logged on trace level.
    pub fn decrypt(
        mut y: SessionState,
        message: &RatchetMessage,
        config: &RatchetConfig,
    ) -> Result<(SessionState, Vec<u8>), RatchetError> {
        let header = &message.header;

        let message_key = match y.route(header) {
            Route::Skipped => y
                .skipped
                .take(&header.ratchet_key, header.counter)
                .ok_or(RatchetError::CorruptedState)?,
            Route::CurrentChain => {
                let receiving = y.receiving.as_mut().ok_or(RatchetError::CorruptedState)?;
                if header.counter < receiving.chain.counter {
                    trace!(
                        counter = header.counter,
                        expected = receiving.chain.counter,
                        "message key was already used or evicted"
                    );
                    return Err(RatchetError::DecryptionFailed);
                }
                skip_message_keys(receiving, header.counter, &mut y.skipped, config)?;
                let (_, message_key) = receiving.chain.next_message_key()?;
                message_key
            }
            Route::NewRatchet => {
                let SendingChain::Current { ratchet, chain } = &y.sending else {
                    trace!(
                        ratchet_key = %header.ratchet_key,
                        "unexpected ratchet key while we did not advertise a new one"
                    );
                    return Err(RatchetError::DecryptionFailed);
                };

                // Check the bounds of both chains before deriving anything.
                let previous_gap = y.receiving.as_ref().map_or(0, |receiving| {
                    header
                        .previous_chain_length
                        .saturating_sub(receiving.chain.counter)
                });
                if previous_gap > config.max_skip {
                    return Err(RatchetError::TooManySkipped(previous_gap, config.max_skip));
                }
                if header.counter > config.max_skip {
                    return Err(RatchetError::TooManySkipped(header.counter, config.max_skip));
                }

                let shared = ratchet
                    .calculate_agreement(&header.ratchet_key)
                    .map_err(|err| {
                        trace!(%err, "invalid ratchet key");
                        RatchetError::DecryptionFailed
                    })?;
                let sending_counter = chain.counter;

                if let Some(receiving) = y.receiving.as_mut() {
                    skip_message_keys(
                        receiving,
                        header.previous_chain_length,
                        &mut y.skipped,
                        config,
                    )?;
                }

                let (root_key, chain_key) = kdf_root(&y.root_key, shared.as_bytes())?;
                y.root_key = root_key;
                y.sending = SendingChain::Stale {
                    previous_chain_length: sending_counter,
                };

                let mut receiving = ReceivingChain {
                    ratchet_key: header.ratchet_key,
                    chain: ChainState::new(chain_key),
                };
                skip_message_keys(&mut receiving, header.counter, &mut y.skipped, config)?;
                let (_, message_key) = receiving.chain.next_message_key()?;
                y.receiving = Some(receiving);

                trace!(ratchet_key = %header.ratchet_key, "performed receiving ratchet step");
                message_key
            }
        };

        let plaintext = aead_decrypt(
            message_key.key.as_bytes(),
            &message.ciphertext,
            message_key.nonce.as_bytes(),
            &aad(&y.associated_data, header),
        )
        .map_err(|err| {
            trace!(%err, counter = header.counter, "authentication failed");
            RatchetError::DecryptionFailed
        })?;

        // The peer evidently established the session, no need to repeat the handshake.
        y.pending_handshake = None;

        Ok((y, plaintext))
    }
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("could not decrypt message")]
    DecryptionFailed,

    #[error("message is {0} keys ahead of the chain, exceeding the limit of {1}")]
    TooManySkipped(u64, u64),

    #[error("session state is corrupted")]
    CorruptedState,

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::key_store::{KeyStore, KeyStoreConfig};
    use crate::x3dh::{initiate, respond};

    use super::{DoubleRatchet, RatchetConfig, RatchetError, SessionState};

    fn key_store(seed: u8) -> KeyStore {
        let rng = Rng::from_seed([seed; 32]);
        let identity = KeyStore::generate_identity(&rng).unwrap();
        let config = KeyStoreConfig {
            onetime_prekeys: 1,
            ..Default::default()
        };
        KeyStore::new(identity, config, rng).unwrap()
    }

    /// Alice initiates a session with Bob, Bob answers the handshake right away.
    fn sessions(rng: &Rng) -> (SessionState, SessionState) {
        let alice = key_store(10);
        let bob = key_store(11);

        let initiated = initiate(alice.identity(), &bob.publish_bundle().unwrap(), rng).unwrap();
        let header = initiated.header.clone();
        let alice_session = DoubleRatchet::init_initiator(initiated);

        let prekey_secret = bob.signed_prekey_secret(header.signed_prekey_id).unwrap();
        let onetime_secret = bob
            .consume_one_time_prekey(header.onetime_prekey_id.unwrap())
            .unwrap();
        let (secret, associated_data) =
            respond(bob.identity(), &header, &prekey_secret, Some(&onetime_secret)).unwrap();
        let bob_session = DoubleRatchet::init_responder(secret, associated_data, &header);

        (alice_session, bob_session)
    }

    #[test]
    fn hello_hi() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (alice, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();
        assert_eq!(message.header.counter, 0);
        assert!(message.handshake.is_some());

        let (bob, plaintext) = DoubleRatchet::decrypt(bob, &message, &config).unwrap();
        assert_eq!(plaintext, b"hello");

        let (bob, message) = DoubleRatchet::encrypt(bob, b"hi", &rng).unwrap();
        assert_eq!(message.header.counter, 0);
        assert!(message.handshake.is_none());

        let (alice, plaintext) = DoubleRatchet::decrypt(alice, &message, &config).unwrap();
        assert_eq!(plaintext, b"hi");

        for state in [&alice, &bob] {
            assert_eq!(state.sending_counter(), 1);
            assert_eq!(state.receiving_counter(), 1);
        }

        // Bob answered, Alice stops attaching the handshake.
        assert!(alice.pending_handshake().is_none());
        let (_, message) = DoubleRatchet::encrypt(alice, b"how are you?", &rng).unwrap();
        assert!(message.handshake.is_none());
    }

    #[test]
    fn remembers_answered_handshake() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (_, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();
        let handshake = message.handshake.clone().unwrap();
        assert!(bob.has_accepted(&handshake));

        // The mark survives progress of the session.
        let (bob, _) = DoubleRatchet::decrypt(bob, &message, &config).unwrap();
        let (mut bob, _) = DoubleRatchet::encrypt(bob, b"hi", &rng).unwrap();
        assert!(bob.has_accepted(&handshake));

        // A handshake with another ephemeral key is new.
        let (other, _) = sessions(&Rng::from_seed([2; 32]));
        let other = other.pending_handshake().unwrap().clone();
        assert!(!bob.has_accepted(&other));
        bob.accept_handshake(&other);
        assert!(bob.has_accepted(&other));
    }

    #[test]
    fn ping_pong_ratchets_keys() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (mut alice, mut bob) = sessions(&rng);

        let mut ratchet_keys = Vec::new();
        for round in 0..5u8 {
            let message;
            (alice, message) = DoubleRatchet::encrypt(alice, &[round], &rng).unwrap();
            ratchet_keys.push(message.header.ratchet_key);
            let plaintext;
            (bob, plaintext) = DoubleRatchet::decrypt(bob, &message, &config).unwrap();
            assert_eq!(plaintext, [round]);

            let message;
            (bob, message) = DoubleRatchet::encrypt(bob, &[round, round], &rng).unwrap();
            ratchet_keys.push(message.header.ratchet_key);
            let plaintext;
            (alice, plaintext) = DoubleRatchet::decrypt(alice, &message, &config).unwrap();
            assert_eq!(plaintext, [round, round]);
        }

        // Every turn of the conversation used a fresh ratchet key.
        let mut unique = ratchet_keys.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ratchet_keys.len());
    }

    #[test]
    fn out_of_order() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (alice, message_1) = DoubleRatchet::encrypt(alice, b"one", &rng).unwrap();
        let (alice, message_2) = DoubleRatchet::encrypt(alice, b"two", &rng).unwrap();
        let (_alice, message_3) = DoubleRatchet::encrypt(alice, b"three", &rng).unwrap();

        let (bob, plaintext_3) = DoubleRatchet::decrypt(bob, &message_3, &config).unwrap();
        assert_eq!(bob.skipped_keys(), 2);
        let (bob, plaintext_1) = DoubleRatchet::decrypt(bob, &message_1, &config).unwrap();
        let (bob, plaintext_2) = DoubleRatchet::decrypt(bob, &message_2, &config).unwrap();

        assert_eq!(plaintext_1, b"one");
        assert_eq!(plaintext_2, b"two");
        assert_eq!(plaintext_3, b"three");
        assert_eq!(bob.skipped_keys(), 0);
        assert_eq!(bob.receiving_counter(), 3);

        // Every message key is used exactly once.
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &message_1, &config),
            Err(RatchetError::DecryptionFailed)
        );
        assert_matches!(
            DoubleRatchet::decrypt(bob, &message_3, &config),
            Err(RatchetError::DecryptionFailed)
        );
    }

    #[test]
    fn out_of_order_across_ratchet_steps() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (alice, message_0) = DoubleRatchet::encrypt(alice, b"zero", &rng).unwrap();
        let (alice, message_1) = DoubleRatchet::encrypt(alice, b"one", &rng).unwrap();
        let (alice, message_2) = DoubleRatchet::encrypt(alice, b"two", &rng).unwrap();

        let (bob, _) = DoubleRatchet::decrypt(bob, &message_0, &config).unwrap();
        let (bob, reply) = DoubleRatchet::encrypt(bob, b"reply", &rng).unwrap();

        // Alice ratchets forward after Bob's reply and sends from a new chain.
        let (alice, _) = DoubleRatchet::decrypt(alice, &reply, &config).unwrap();
        let (_alice, message_3) = DoubleRatchet::encrypt(alice, b"three", &rng).unwrap();
        assert_ne!(message_3.header.ratchet_key, message_2.header.ratchet_key);
        assert_eq!(message_3.header.previous_chain_length, 3);

        // Bob receives the new chain first and caches the keys of the old one.
        let (bob, plaintext_3) = DoubleRatchet::decrypt(bob, &message_3, &config).unwrap();
        assert_eq!(bob.skipped_keys(), 2);
        let (bob, plaintext_2) = DoubleRatchet::decrypt(bob, &message_2, &config).unwrap();
        let (bob, plaintext_1) = DoubleRatchet::decrypt(bob, &message_1, &config).unwrap();

        assert_eq!(plaintext_1, b"one");
        assert_eq!(plaintext_2, b"two");
        assert_eq!(plaintext_3, b"three");
        assert_eq!(bob.skipped_keys(), 0);
    }

    #[test]
    fn too_many_skipped() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (mut alice, bob) = sessions(&rng);

        let mut messages = Vec::new();
        for _ in 0..1002 {
            let message;
            (alice, message) = DoubleRatchet::encrypt(alice, b"spam", &rng).unwrap();
            messages.push(message);
        }

        // A gap of 1001 keys is too much.
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &messages[1001], &config),
            Err(RatchetError::TooManySkipped(1001, 1000))
        );

        // A gap of exactly 1000 is fine.
        let (bob, plaintext) = DoubleRatchet::decrypt(bob, &messages[1000], &config).unwrap();
        assert_eq!(plaintext, b"spam");
        assert_eq!(bob.skipped_keys(), 1000);
    }

    #[test]
    fn skipped_keys_are_bounded() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig {
            max_skip: 10,
            max_skipped_keys: 3,
        };
        let (mut alice, bob) = sessions(&rng);

        let mut messages = Vec::new();
        for _ in 0..6 {
            let message;
            (alice, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();
            messages.push(message);
        }

        let (bob, _) = DoubleRatchet::decrypt(bob, &messages[5], &config).unwrap();
        assert_eq!(bob.skipped_keys(), 3);

        // The oldest keys were evicted.
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &messages[0], &config),
            Err(RatchetError::DecryptionFailed)
        );
        let (_, plaintext) = DoubleRatchet::decrypt(bob, &messages[4], &config).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn forward_secrecy() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (alice, message_1) = DoubleRatchet::encrypt(alice, b"one", &rng).unwrap();
        let (bob, _) = DoubleRatchet::decrypt(bob, &message_1, &config).unwrap();
        let (bob, reply) = DoubleRatchet::encrypt(bob, b"reply", &rng).unwrap();
        let (alice, _) = DoubleRatchet::decrypt(alice, &reply, &config).unwrap();
        let (_alice, message_2) = DoubleRatchet::encrypt(alice, b"two", &rng).unwrap();
        let (bob, _) = DoubleRatchet::decrypt(bob, &message_2, &config).unwrap();

        // An attacker capturing Bob's state now learns nothing about earlier messages.
        let captured = bob.clone();
        assert_matches!(
            DoubleRatchet::decrypt(captured.clone(), &message_1, &config),
            Err(RatchetError::DecryptionFailed)
        );
        assert_matches!(
            DoubleRatchet::decrypt(captured, &message_2, &config),
            Err(RatchetError::DecryptionFailed)
        );
    }

    #[test]
    fn tampered_message_keeps_session_usable() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (_alice, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();

        let mut tampered = message.clone();
        tampered.ciphertext[0] ^= 1;
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &tampered, &config),
            Err(RatchetError::DecryptionFailed)
        );

        let mut tampered = message.clone();
        tampered.header.previous_chain_length += 1;
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &tampered, &config),
            Err(RatchetError::DecryptionFailed)
        );

        // The previous state is still intact.
        let (_, plaintext) = DoubleRatchet::decrypt(bob, &message, &config).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn unexpected_ratchet_key_from_responder_side() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);
        let (_, other_bob) = sessions(&Rng::from_seed([2; 32]));

        // Bob never sent anything, a message on a foreign ratchet key can not be valid.
        let (_, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();
        let (_, foreign) = DoubleRatchet::encrypt(other_bob, b"hello", &rng).unwrap();
        assert_matches!(
            DoubleRatchet::decrypt(bob.clone(), &foreign, &config),
            Err(RatchetError::DecryptionFailed)
        );
        assert!(DoubleRatchet::decrypt(bob, &message, &config).is_ok());
    }

    #[test]
    fn serialized_state_continues_session() {
        let rng = Rng::from_seed([1; 32]);
        let config = RatchetConfig::default();
        let (alice, bob) = sessions(&rng);

        let (alice, message) = DoubleRatchet::encrypt(alice, b"hello", &rng).unwrap();
        let (bob, _) = DoubleRatchet::decrypt(bob, &message, &config).unwrap();

        let bytes = crate::cbor::encode_cbor(&bob).unwrap();
        let bob: SessionState = crate::cbor::decode_cbor(&bytes[..]).unwrap();

        let (_, message) = DoubleRatchet::encrypt(bob, b"hi", &rng).unwrap();
        let (_, plaintext) = DoubleRatchet::decrypt(alice, &message, &config).unwrap();
        assert_eq!(plaintext, b"hi");
    }
}
