// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group sessions based on "sender keys".
//!
//! Every member owns one symmetric sender chain per epoch and shares its chain key with all other
//! members over the pairwise double-ratchet sessions. A group message is encrypted once with the
//! next key of the sender's chain and the same ciphertext is fanned out to every member.
//!
//! Each chain is paired with a signing key generated for it. Members only learn the verifying
//! half, so knowing someone's chain key is not enough to forge messages in their name.
//!
//! Membership changes move the group into a new epoch. Every member then generates a fresh sender
//! chain and distributes it to all current members; removed members never receive the new chains.
//! Chains of the previous epoch are kept for a grace period to decrypt messages still in flight
//! and purged afterwards.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::crypto::aead::{AeadError, aead_decrypt, aead_encrypt};
use crate::crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use crate::crypto::hkdf::HkdfError;
use crate::crypto::{Rng, RngError, Secret};
use crate::double_ratchet::{CHAIN_KEY_SIZE, ChainState, MessageKey};
use crate::identity::IdentityKey;

const GROUP_SIGNATURE_CONTEXT: &[u8] = b"murmur-group-message-v1";

pub type Epoch = u64;

/// Random identifier of a group.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(#[serde(with = "serde_bytes")] [u8; 16]);

impl GroupId {
    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Maximum number of message keys derived ahead within one sender chain.
    ///
    /// Defaults to 1000.
    pub max_skip: u64,

    /// Maximum number of skipped message keys kept per sender chain. The oldest keys are evicted
    /// first.
    ///
    /// Defaults to 2000.
    pub max_skipped_keys: usize,

    /// How long chains of a previous epoch are kept after a membership change.
    ///
    /// Defaults to 5 minutes.
    pub retired_epoch_grace: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
            retired_epoch_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Our own sender chain of the current epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct OwnChain {
    chain: ChainState,
    signing_key: SigningKey,
}

/// Sender chain of another member, as learned from their distribution message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MemberChain {
    chain: ChainState,
    verifying_key: VerifyingKey,
    skipped: BTreeMap<u64, MessageKey>,
}

impl MemberChain {
    fn message_key(
        &mut self,
        counter: u64,
        config: &GroupConfig,
    ) -> Result<MessageKey, GroupError> {
        if counter < self.chain.counter() {
            return self.skipped.remove(&counter).ok_or_else(|| {
                trace!(counter, "group message key was already used");
                GroupError::DecryptionFailed
            });
        }

        let gap = counter - self.chain.counter();
        if gap > config.max_skip {
            return Err(GroupError::TooManySkipped(gap, config.max_skip));
        }

        loop {
            let (next, message_key) = self.chain.next_message_key()?;
            if next == counter {
                return Ok(message_key);
            }
            self.skipped.insert(next, message_key);

            // Counters only grow, the lowest one is the oldest key.
            while self.skipped.len() > config.max_skipped_keys {
                self.skipped.pop_first();
            }
        }
    }

    fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RetiredEpoch {
    epoch: Epoch,
    retired_at: u64,
    chains: BTreeMap<IdentityKey, MemberChain>,
}

/// Sender chain of one member, sent to every other member over the pairwise sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub group_id: GroupId,
    pub epoch: Epoch,
    pub sender: IdentityKey,
    pub members: Vec<IdentityKey>,
    pub chain_key: Secret<CHAIN_KEY_SIZE>,
    pub counter: u64,
    pub verifying_key: VerifyingKey,
}

/// Encrypted and signed group message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub group_id: GroupId,
    pub epoch: Epoch,
    pub sender: IdentityKey,
    pub counter: u64,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub signature: Signature,
}

impl GroupMessage {
    fn signature_payload(
        group_id: &GroupId,
        epoch: Epoch,
        sender: &IdentityKey,
        counter: u64,
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            GROUP_SIGNATURE_CONTEXT.len() + 16 + 8 + 64 + 8 + ciphertext.len(),
        );
        payload.extend_from_slice(GROUP_SIGNATURE_CONTEXT);
        payload.extend_from_slice(group_id.as_bytes());
        payload.extend_from_slice(&epoch.to_be_bytes());
        payload.extend_from_slice(&sender.to_bytes());
        payload.extend_from_slice(&counter.to_be_bytes());
        payload.extend_from_slice(ciphertext);
        payload
    }

    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + 8 + 64 + 8);
        aad.extend_from_slice(self.group_id.as_bytes());
        aad.extend_from_slice(&self.epoch.to_be_bytes());
        aad.extend_from_slice(&self.sender.to_bytes());
        aad.extend_from_slice(&self.counter.to_be_bytes());
        aad
    }
}

/// State of a group from the perspective of one member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    group_id: GroupId,
    our_identity: IdentityKey,
    epoch: Epoch,
    members: BTreeSet<IdentityKey>,
    own_chain: OwnChain,
    chains: BTreeMap<IdentityKey, MemberChain>,
    retired: Vec<RetiredEpoch>,
}

impl GroupState {
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn members(&self) -> impl Iterator<Item = &IdentityKey> {
        self.members.iter()
    }

    pub fn is_member(&self, identity: &IdentityKey) -> bool {
        self.members.contains(identity)
    }

    /// All members except ourselves.
    pub fn recipients(&self) -> Vec<IdentityKey> {
        self.members
            .iter()
            .filter(|member| *member != &self.our_identity)
            .copied()
            .collect()
    }

    /// Returns true if we know the sender chain of the given member in the current epoch.
    pub fn has_chain(&self, member: &IdentityKey) -> bool {
        self.chains.contains_key(member)
    }

    /// Number of cached message keys of a member's chain in the current epoch.
    pub fn skipped_keys(&self, member: &IdentityKey) -> usize {
        self.chains.get(member).map_or(0, MemberChain::skipped_keys)
    }

    /// Number of previous epochs still kept around.
    pub fn retired_epochs(&self) -> usize {
        self.retired.len()
    }

    /// Distribution message of our current sender chain.
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            group_id: self.group_id,
            epoch: self.epoch,
            sender: self.our_identity,
            members: self.members.iter().copied().collect(),
            chain_key: self.own_chain.chain.chain_key().clone(),
            counter: self.own_chain.chain.counter(),
            verifying_key: self.own_chain.signing_key.verifying_key(),
        }
    }

    fn retire_current_epoch(&mut self, now: u64) {
        let chains = std::mem::take(&mut self.chains);
        self.retired.push(RetiredEpoch {
            epoch: self.epoch,
            retired_at: now,
            chains,
        });
    }

    fn chain_mut(
        &mut self,
        epoch: Epoch,
        sender: &IdentityKey,
    ) -> Result<&mut MemberChain, GroupError> {
        let chains = if epoch == self.epoch {
            &mut self.chains
        } else {
            &mut self
                .retired
                .iter_mut()
                .find(|retired| retired.epoch == epoch)
                .ok_or(GroupError::UnknownEpoch(epoch))?
                .chains
        };
        chains
            .get_mut(sender)
            .ok_or(GroupError::UnknownSenderChain(*sender, epoch))
    }
}

fn new_own_chain(rng: &Rng) -> Result<OwnChain, GroupError> {
    Ok(OwnChain {
        chain: ChainState::new(Secret::from_bytes(rng.random_array()?)),
        signing_key: SigningKey::generate(rng)?,
    })
}

#[derive(Debug)]
pub struct GroupSession;

impl GroupSession {
    /// Creates a new group and returns our distribution message for all other members.
    pub fn init(
        group_id: GroupId,
        our_identity: IdentityKey,
        members: impl IntoIterator<Item = IdentityKey>,
        rng: &Rng,
    ) -> Result<(GroupState, SenderKeyDistribution), GroupError> {
        Self::init_at(group_id, our_identity, 0, members, rng)
    }

    /// Joins a group we learned about through a distribution message of another member.
    ///
    /// Returns our own distribution message, all other members need it as well.
    pub fn join(
        our_identity: IdentityKey,
        sender: &IdentityKey,
        distribution: &SenderKeyDistribution,
        now: u64,
        rng: &Rng,
    ) -> Result<(GroupState, SenderKeyDistribution), GroupError> {
        if !distribution.members.contains(&our_identity) {
            return Err(GroupError::NotMember(our_identity));
        }
        let (y, our_distribution) = Self::init_at(
            distribution.group_id,
            our_identity,
            distribution.epoch,
            distribution.members.iter().copied(),
            rng,
        )?;
        let (y, _) = Self::process_distribution(y, sender, distribution, now, rng)?;
        Ok((y, our_distribution))
    }

    fn init_at(
        group_id: GroupId,
        our_identity: IdentityKey,
        epoch: Epoch,
        members: impl IntoIterator<Item = IdentityKey>,
        rng: &Rng,
    ) -> Result<(GroupState, SenderKeyDistribution), GroupError> {
        let mut members: BTreeSet<IdentityKey> = members.into_iter().collect();
        members.insert(our_identity);

        let y = GroupState {
            group_id,
            our_identity,
            epoch,
            members,
            own_chain: new_own_chain(rng)?,
            chains: BTreeMap::new(),
            retired: Vec::new(),
        };
        let distribution = y.distribution();

        debug!(%group_id, epoch, members = y.members.len(), "initialised group sender chain");
        Ok((y, distribution))
    }

    /// Encrypts a message once for all members of the group.
    pub fn encrypt(
        mut y: GroupState,
        plaintext: &[u8],
    ) -> Result<(GroupState, GroupMessage), GroupError> {
        let (counter, message_key) = y.own_chain.chain.next_message_key()?;

        let mut message = GroupMessage {
            group_id: y.group_id,
            epoch: y.epoch,
            sender: y.our_identity,
            counter,
            ciphertext: Vec::new(),
            signature: Signature::from_bytes([0; 64]),
        };
        message.ciphertext = aead_encrypt(
            message_key.key.as_bytes(),
            plaintext,
            message_key.nonce.as_bytes(),
            &message.aad(),
        )?;
        message.signature = y
            .own_chain
            .signing_key
            .sign(&GroupMessage::signature_payload(
                &message.group_id,
                message.epoch,
                &message.sender,
                message.counter,
                &message.ciphertext,
            ));

        Ok((y, message))
    }

    /// Decrypts a message of another member.
    ///
    /// Messages of the previous epochs are accepted until they got purged.
    pub fn decrypt(
        mut y: GroupState,
        message: &GroupMessage,
        config: &GroupConfig,
    ) -> Result<(GroupState, Vec<u8>), GroupError> {
        if message.group_id != y.group_id {
            return Err(GroupError::GroupMismatch(message.group_id, y.group_id));
        }

        let chain = y.chain_mut(message.epoch, &message.sender)?;

        let payload = GroupMessage::signature_payload(
            &message.group_id,
            message.epoch,
            &message.sender,
            message.counter,
            &message.ciphertext,
        );
        chain
            .verifying_key
            .verify(&payload, &message.signature)
            .map_err(|err| {
                trace!(%err, sender = %message.sender, "invalid group message signature");
                GroupError::DecryptionFailed
            })?;

        let message_key = chain.message_key(message.counter, config)?;
        let plaintext = aead_decrypt(
            message_key.key.as_bytes(),
            &message.ciphertext,
            message_key.nonce.as_bytes(),
            &message.aad(),
        )
        .map_err(|err| {
            trace!(%err, sender = %message.sender, "group message authentication failed");
            GroupError::DecryptionFailed
        })?;

        Ok((y, plaintext))
    }

    /// Processes the sender chain of another member.
    ///
    /// `sender` is the identity of the pairwise session the distribution arrived on. If the
    /// distribution announces a newer epoch we move into it and return our own new distribution
    /// message, which needs to be sent to all members.
    pub fn process_distribution(
        mut y: GroupState,
        sender: &IdentityKey,
        distribution: &SenderKeyDistribution,
        now: u64,
        rng: &Rng,
    ) -> Result<(GroupState, Option<SenderKeyDistribution>), GroupError> {
        if &distribution.sender != sender {
            return Err(GroupError::SenderMismatch(*sender, distribution.sender));
        }

        if distribution.group_id != y.group_id {
            return Err(GroupError::GroupMismatch(distribution.group_id, y.group_id));
        }

        if distribution.epoch < y.epoch {
            return Err(GroupError::StaleEpoch(distribution.epoch, y.epoch));
        }

        let mut our_distribution = None;
        if distribution.epoch > y.epoch {
            let members: BTreeSet<IdentityKey> = distribution.members.iter().copied().collect();
            if !members.contains(&y.our_identity) {
                return Err(GroupError::NotMember(y.our_identity));
            }

            y.retire_current_epoch(now);
            y.epoch = distribution.epoch;
            y.members = members;
            y.own_chain = new_own_chain(rng)?;
            our_distribution = Some(y.distribution());

            debug!(group_id = %y.group_id, epoch = y.epoch, "moved to new group epoch");
        }

        if !y.members.contains(sender) {
            return Err(GroupError::NotMember(*sender));
        }

        let known = y
            .chains
            .get(sender)
            .is_some_and(|chain| chain.verifying_key == distribution.verifying_key);
        if !known {
            y.chains.insert(
                *sender,
                MemberChain {
                    chain: ChainState::from_parts(
                        distribution.chain_key.clone(),
                        distribution.counter,
                    ),
                    verifying_key: distribution.verifying_key,
                    skipped: BTreeMap::new(),
                },
            );
            trace!(group_id = %y.group_id, %sender, epoch = y.epoch, "learned sender chain");
        }

        Ok((y, our_distribution))
    }

    /// Replaces the member list, moving the group into a new epoch.
    ///
    /// Returns our new distribution message which needs to be sent to all (new) members.
    pub fn update_members(
        mut y: GroupState,
        members: impl IntoIterator<Item = IdentityKey>,
        now: u64,
        rng: &Rng,
    ) -> Result<(GroupState, SenderKeyDistribution), GroupError> {
        let mut members: BTreeSet<IdentityKey> = members.into_iter().collect();
        members.insert(y.our_identity);

        y.retire_current_epoch(now);
        y.epoch += 1;
        y.members = members;
        y.own_chain = new_own_chain(rng)?;

        debug!(
            group_id = %y.group_id,
            epoch = y.epoch,
            members = y.members.len(),
            "updated group members"
        );

        let distribution = y.distribution();
        Ok((y, distribution))
    }

    /// Removes chains of previous epochs whose grace period passed.
    pub fn purge_retired(mut y: GroupState, now: u64, config: &GroupConfig) -> GroupState {
        let grace = config.retired_epoch_grace.as_secs();
        y.retired
            .retain(|retired| now < retired.retired_at.saturating_add(grace));
        y
    }
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("could not decrypt group message")]
    DecryptionFailed,

    #[error("message is {0} keys ahead of the sender chain, exceeding the limit of {1}")]
    TooManySkipped(u64, u64),

    #[error("no sender chain known for {0} in epoch {1}")]
    UnknownSenderChain(IdentityKey, Epoch),

    #[error("epoch {0} is unknown or already purged")]
    UnknownEpoch(Epoch),

    #[error("{0} is not a member of the group")]
    NotMember(IdentityKey),

    #[error("message for group {0} was processed by group {1}")]
    GroupMismatch(GroupId, GroupId),

    #[error("distribution of {1} arrived over the session with {0}")]
    SenderMismatch(IdentityKey, IdentityKey),

    #[error("distribution for epoch {0} is older than the current epoch {1}")]
    StaleEpoch(Epoch, Epoch),

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
    use crate::identity::{IdentityKey, IdentityKeyPair};

    use super::{GroupConfig, GroupError, GroupId, GroupSession, GroupState};

    fn identity(rng: &Rng) -> IdentityKey {
        IdentityKeyPair::generate(rng).unwrap().public()
    }

    /// Alice creates a group with Bob and Charlie, everyone exchanges their sender chains.
    fn group(rng: &Rng) -> ([IdentityKey; 3], [GroupState; 3]) {
        let alice = identity(rng);
        let bob = identity(rng);
        let charlie = identity(rng);

        let group_id = GroupId::random(rng).unwrap();
        let (alice_y, alice_dist) =
            GroupSession::init(group_id, alice, [bob, charlie], rng).unwrap();
        let (bob_y, bob_dist) = GroupSession::join(bob, &alice, &alice_dist, 0, rng).unwrap();
        let (charlie_y, charlie_dist) =
            GroupSession::join(charlie, &alice, &alice_dist, 0, rng).unwrap();

        let (alice_y, _) =
            GroupSession::process_distribution(alice_y, &bob, &bob_dist, 0, rng).unwrap();
        let (alice_y, _) =
            GroupSession::process_distribution(alice_y, &charlie, &charlie_dist, 0, rng).unwrap();
        let (bob_y, _) =
            GroupSession::process_distribution(bob_y, &charlie, &charlie_dist, 0, rng).unwrap();
        let (charlie_y, _) =
            GroupSession::process_distribution(charlie_y, &bob, &bob_dist, 0, rng).unwrap();

        ([alice, bob, charlie], [alice_y, bob_y, charlie_y])
    }

    #[test]
    fn encrypt_once_decrypt_everywhere() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig::default();
        let ([alice, _, _], [alice_y, bob_y, charlie_y]) = group(&rng);

        assert_eq!(alice_y.recipients().len(), 2);
        assert!(!alice_y.recipients().contains(&alice));

        let (alice_y, message) = GroupSession::encrypt(alice_y, b"hello group").unwrap();
        let (_, plaintext) = GroupSession::decrypt(bob_y, &message, &config).unwrap();
        assert_eq!(plaintext, b"hello group");
        let (charlie_y, plaintext) = GroupSession::decrypt(charlie_y, &message, &config).unwrap();
        assert_eq!(plaintext, b"hello group");

        // Replays are rejected.
        assert_matches!(
            GroupSession::decrypt(charlie_y, &message, &config),
            Err(GroupError::DecryptionFailed)
        );

        let (_, message) = GroupSession::encrypt(alice_y, b"second").unwrap();
        assert_eq!(message.counter, 1);
    }

    #[test]
    fn out_of_order_and_bounds() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig {
            max_skip: 5,
            ..Default::default()
        };
        let (_, [alice_y, bob_y, _]) = group(&rng);

        let mut alice_y = alice_y;
        let mut messages = Vec::new();
        for i in 0..8u8 {
            let message;
            (alice_y, message) = GroupSession::encrypt(alice_y, &[i]).unwrap();
            messages.push(message);
        }

        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &messages[2], &config).unwrap();
        assert_eq!(plaintext, [2]);
        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &messages[0], &config).unwrap();
        assert_eq!(plaintext, [0]);
        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &messages[1], &config).unwrap();
        assert_eq!(plaintext, [1]);

        // A member who has not seen anything yet would need to skip seven keys.
        let (_, [_, fresh_bob_y, _]) = group(&Rng::from_seed([1; 32]));
        assert_matches!(
            GroupSession::decrypt(fresh_bob_y, &messages[7], &config),
            Err(GroupError::TooManySkipped(7, 5))
        );
        assert!(GroupSession::decrypt(bob_y, &messages[7], &config).is_ok());
    }

    #[test]
    fn skipped_keys_are_capped() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig {
            max_skip: 10,
            max_skipped_keys: 10,
            ..Default::default()
        };
        let ([alice, _, _], [mut alice_y, mut bob_y, _]) = group(&rng);

        let mut messages = Vec::new();
        for i in 0..=100u8 {
            let message;
            (alice_y, message) = GroupSession::encrypt(alice_y, &[i]).unwrap();
            messages.push(message);
        }

        // Every gap stays within the limit, but together they would pile up 90 keys.
        for i in (10..=100).step_by(10) {
            let plaintext;
            (bob_y, plaintext) = GroupSession::decrypt(bob_y, &messages[i], &config).unwrap();
            assert_eq!(plaintext, [i as u8]);
        }
        assert_eq!(bob_y.skipped_keys(&alice), 10);

        // The most recent keys are kept, the oldest ones are gone.
        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &messages[99], &config).unwrap();
        assert_eq!(plaintext, [99]);
        assert_matches!(
            GroupSession::decrypt(bob_y, &messages[1], &config),
            Err(GroupError::DecryptionFailed)
        );
    }

    #[test]
    fn forged_sender_is_rejected() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig::default();
        let ([alice, _, _], [_, bob_y, charlie_y]) = group(&rng);

        // Bob knows Charlie's chain, but can not sign in Alice's name.
        let (_, mut message) = GroupSession::encrypt(bob_y, b"I am Alice").unwrap();
        message.sender = alice;
        assert_matches!(
            GroupSession::decrypt(charlie_y, &message, &config),
            Err(GroupError::DecryptionFailed)
        );
    }

    #[test]
    fn unknown_sender_chain() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig::default();
        let ([alice, bob, charlie], _) = group(&rng);

        let group_id = GroupId::random(&rng).unwrap();
        let (alice_y, _) = GroupSession::init(group_id, alice, [bob, charlie], &rng).unwrap();
        let (bob_y, _) = GroupSession::init(group_id, bob, [alice, charlie], &rng).unwrap();

        let (_, message) = GroupSession::encrypt(alice_y, b"hello").unwrap();
        assert_matches!(
            GroupSession::decrypt(bob_y, &message, &config),
            Err(GroupError::UnknownSenderChain(sender, 0)) if sender == alice
        );
    }

    #[test]
    fn membership_change_moves_epoch() {
        let rng = Rng::from_seed([1; 32]);
        let config = GroupConfig::default();
        let ([alice, bob, charlie], [alice_y, bob_y, charlie_y]) = group(&rng);

        // A message of the old epoch is still in flight.
        let (alice_y, in_flight) = GroupSession::encrypt(alice_y, b"old epoch").unwrap();

        // Alice removes Charlie.
        let (alice_y, alice_dist) =
            GroupSession::update_members(alice_y, [alice, bob], 100, &rng).unwrap();
        assert_eq!(alice_y.epoch(), 1);
        assert!(!alice_y.is_member(&charlie));

        // Bob follows into the new epoch and has to redistribute his chain.
        let (bob_y, bob_dist) =
            GroupSession::process_distribution(bob_y, &alice, &alice_dist, 100, &rng).unwrap();
        let bob_dist = bob_dist.expect("new epoch requires new distribution");
        assert_eq!(bob_y.epoch(), 1);
        assert_eq!(bob_dist.epoch, 1);
        assert_eq!(bob_dist.members.len(), 2);

        let (alice_y, again) =
            GroupSession::process_distribution(alice_y, &bob, &bob_dist, 100, &rng).unwrap();
        assert!(again.is_none());

        // Charlie was removed and can not join the new epoch.
        assert_matches!(
            GroupSession::process_distribution(charlie_y.clone(), &alice, &alice_dist, 100, &rng),
            Err(GroupError::NotMember(member)) if member == charlie
        );

        // Messages of the new epoch are readable by remaining members only.
        let (alice_y, message) = GroupSession::encrypt(alice_y, b"new epoch").unwrap();
        assert_eq!(message.epoch, 1);
        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &message, &config).unwrap();
        assert_eq!(plaintext, b"new epoch");
        assert_matches!(
            GroupSession::decrypt(charlie_y, &message, &config),
            Err(GroupError::UnknownEpoch(1))
        );

        // The in-flight message of the previous epoch still decrypts during the grace period.
        let (bob_y, plaintext) = GroupSession::decrypt(bob_y, &in_flight, &config).unwrap();
        assert_eq!(plaintext, b"old epoch");

        // Until it got purged.
        let (_, late) = GroupSession::encrypt(alice_y, b"late").unwrap();
        let bob_y = GroupSession::purge_retired(bob_y, 100 + 60, &config);
        assert_eq!(bob_y.retired_epochs(), 1);
        let bob_y = GroupSession::purge_retired(bob_y, 100 + 5 * 60, &config);
        assert_eq!(bob_y.retired_epochs(), 0);
        assert_matches!(
            GroupSession::decrypt(bob_y.clone(), &in_flight, &config),
            Err(GroupError::UnknownEpoch(0))
        );
        assert!(GroupSession::decrypt(bob_y, &late, &config).is_ok());
    }

    #[test]
    fn stale_and_misrouted_distributions() {
        let rng = Rng::from_seed([1; 32]);
        let ([alice, bob, charlie], [alice_y, bob_y, _]) = group(&rng);

        let old_dist = alice_y.distribution();
        let (_, new_dist) =
            GroupSession::update_members(alice_y, [alice, bob, charlie], 10, &rng).unwrap();
        let (bob_y, _) =
            GroupSession::process_distribution(bob_y, &alice, &new_dist, 10, &rng).unwrap();

        assert_matches!(
            GroupSession::process_distribution(bob_y.clone(), &alice, &old_dist, 10, &rng),
            Err(GroupError::StaleEpoch(0, 1))
        );

        // Charlie relays a distribution claiming to come from Alice.
        assert_matches!(
            GroupSession::process_distribution(bob_y, &charlie, &new_dist, 10, &rng),
            Err(GroupError::SenderMismatch(_, _))
        );
    }
}
