// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! X3DH lets an initiator derive a shared secret with a responder who is currently offline, based
//! on the pre-key bundle the responder published earlier. Both parties authenticate each other
//! through their long-term identity keys and the result provides forward secrecy.
//!
//! The derived secret seeds a double-ratchet session: the first 32 bytes become the root key, the
//! second 32 bytes the first chain key (sending chain of the initiator, receiving chain of the
//! responder).
//!
//! <https://signal.org/docs/specifications/x3dh/>
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroizing;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::identity::{IdentityKey, IdentityKeyPair};
use crate::key_bundle::{KeyBundleError, OneTimePreKeyId, PrekeyBundle, SignedPreKeyId};

/// ASCII string identifying the application, used as KDF info.
const KDF_INFO: &[u8] = b"murmur-x3dh";

/// Root key and initial chain key both sides derive from the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X3dhSecret {
    root_key: Secret<32>,
    chain_key: Secret<32>,
}

impl X3dhSecret {
    pub fn root_key(&self) -> &Secret<32> {
        &self.root_key
    }

    pub fn chain_key(&self) -> &Secret<32> {
        &self.chain_key
    }
}

/// Information the responder needs to repeat the key agreement, attached to the first messages of
/// a new session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    pub identity_key: IdentityKey,
    pub ephemeral_key: PublicKey,
    pub signed_prekey_id: SignedPreKeyId,
    pub onetime_prekey_id: Option<OneTimePreKeyId>,
}

/// Result of an initiated handshake.
#[derive(Debug)]
pub struct Initiated {
    pub header: HandshakeHeader,
    pub secret: X3dhSecret,

    /// Ephemeral key pair of this handshake. It serves as the first ratchet key pair of the
    /// initiator's session.
    pub ephemeral_secret: SecretKey,

    pub their_identity: IdentityKey,
    pub associated_data: Vec<u8>,
}

/// Starts a session with the owner of the given bundle.
///
/// The first one-time pre-key of the bundle is used if there is any.
pub fn initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PrekeyBundle,
    rng: &Rng,
) -> Result<Initiated, X3dhError> {
    their_bundle.verify().map_err(X3dhError::InvalidBundle)?;

    let their_identity = *their_bundle.identity_key();
    let their_signed_prekey = their_bundle.signed_prekey();
    let their_onetime_prekey = their_bundle.onetime_prekeys().first();

    let ephemeral_secret = SecretKey::generate(rng)?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IK_A, SPK_B)
    ikm.extend_from_slice(
        our_identity
            .dh_secret()
            .calculate_agreement(their_signed_prekey.key())?
            .as_bytes(),
    );

    // DH2 = DH(EK_A, IK_B)
    ikm.extend_from_slice(
        ephemeral_secret
            .calculate_agreement(their_identity.dh_key())?
            .as_bytes(),
    );

    // DH3 = DH(EK_A, SPK_B)
    ikm.extend_from_slice(
        ephemeral_secret
            .calculate_agreement(their_signed_prekey.key())?
            .as_bytes(),
    );

    // DH4 = DH(EK_A, OPK_B)
    if let Some(onetime_prekey) = their_onetime_prekey {
        ikm.extend_from_slice(
            ephemeral_secret
                .calculate_agreement(onetime_prekey.key())?
                .as_bytes(),
        );
    }

    let secret = derive_secret(&ikm)?;
    let our_identity_key = our_identity.public();

    trace!(
        their_identity = %their_identity.fingerprint(),
        signed_prekey_id = their_signed_prekey.id(),
        onetime_prekey = their_onetime_prekey.is_some(),
        "initiated x3dh handshake"
    );

    Ok(Initiated {
        header: HandshakeHeader {
            identity_key: our_identity_key,
            ephemeral_key: ephemeral_secret.public_key(),
            signed_prekey_id: their_signed_prekey.id(),
            onetime_prekey_id: their_onetime_prekey.map(|prekey| prekey.id()),
        },
        secret,
        ephemeral_secret,
        their_identity,
        associated_data: associated_data(&our_identity_key, &their_identity),
    })
}

/// Repeats the key agreement on the responder's side.
///
/// The caller looks up the signed pre-key secret and consumes the one-time pre-key secret named in
/// the header from its key store.
pub fn respond(
    our_identity: &IdentityKeyPair,
    header: &HandshakeHeader,
    our_prekey_secret: &SecretKey,
    our_onetime_secret: Option<&SecretKey>,
) -> Result<(X3dhSecret, Vec<u8>), X3dhError> {
    if header.onetime_prekey_id.is_some() != our_onetime_secret.is_some() {
        return Err(X3dhError::OneTimePreKeyMismatch);
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IK_A, SPK_B)
    ikm.extend_from_slice(
        our_prekey_secret
            .calculate_agreement(header.identity_key.dh_key())?
            .as_bytes(),
    );

    // DH2 = DH(EK_A, IK_B)
    ikm.extend_from_slice(
        our_identity
            .dh_secret()
            .calculate_agreement(&header.ephemeral_key)?
            .as_bytes(),
    );

    // DH3 = DH(EK_A, SPK_B)
    ikm.extend_from_slice(
        our_prekey_secret
            .calculate_agreement(&header.ephemeral_key)?
            .as_bytes(),
    );

    // DH4 = DH(EK_A, OPK_B)
    if let Some(our_onetime_secret) = our_onetime_secret {
        ikm.extend_from_slice(
            our_onetime_secret
                .calculate_agreement(&header.ephemeral_key)?
                .as_bytes(),
        );
    }

    let secret = derive_secret(&ikm)?;

    trace!(
        their_identity = %header.identity_key.fingerprint(),
        signed_prekey_id = header.signed_prekey_id,
        "responded to x3dh handshake"
    );

    Ok((
        secret,
        associated_data(&header.identity_key, &our_identity.public()),
    ))
}

fn derive_secret(ikm: &[u8]) -> Result<X3dhSecret, X3dhError> {
    let salt = [0u8; 32];
    let okm = Zeroizing::new(hkdf::<64>(&salt, ikm, Some(KDF_INFO))?);

    let mut root_key = [0u8; 32];
    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);

    Ok(X3dhSecret {
        root_key: Secret::from_bytes(root_key),
        chain_key: Secret::from_bytes(chain_key),
    })
}

/// Associated data bound into every message of the session: initiator identity followed by the
/// responder identity.
fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(128);
    ad.extend_from_slice(&initiator.to_bytes());
    ad.extend_from_slice(&responder.to_bytes());
    ad
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error("invalid pre-key bundle: {0}")]
    InvalidBundle(KeyBundleError),

    #[error("handshake and provided one-time pre-key secret do not match")]
    OneTimePreKeyMismatch,

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),
}
