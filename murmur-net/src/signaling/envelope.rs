// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Message exchanged with other peers through the signaling relay.
///
/// Envelopes travel as JSON text frames. The relay only looks at `to` for routing, the payload is
/// opaque to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(with = "peer_id_hex")]
    pub from: PeerId,

    #[serde(with = "peer_id_hex")]
    pub to: PeerId,

    pub kind: EnvelopeKind,

    pub payload: serde_json::Value,
}

impl SignalingEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
    Presence,
}

impl EnvelopeKind {
    /// Returns true if this envelope is part of a connection negotiation.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Presence => "presence",
        };
        write!(f, "{value}")
    }
}

/// Availability announced by a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Presence announcement received from another peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Presence {
    pub peer: PeerId,
    pub status: PresenceStatus,
}

mod peer_id_hex {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use crate::PeerId;

    pub fn serialize<S: Serializer>(peer: &PeerId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&peer.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PeerId, D::Error> {
        let value = String::deserialize(deserializer)?;
        PeerId::from_hex(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use murmur_encryption::IdentityKeyPair;
    use murmur_encryption::crypto::Rng;
    use serde_json::json;

    use super::{EnvelopeKind, SignalingEnvelope};

    #[test]
    fn json_wire_format() {
        let rng = Rng::from_seed([1; 32]);
        let alice = IdentityKeyPair::generate(&rng).unwrap().public();
        let bob = IdentityKeyPair::generate(&rng).unwrap().public();

        let envelope = SignalingEnvelope {
            from: alice,
            to: bob,
            kind: EnvelopeKind::Presence,
            payload: json!({ "status": "online" }),
        };

        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["from"], json!(alice.to_hex()));
        assert_eq!(value["to"], json!(bob.to_hex()));
        assert_eq!(value["kind"], json!("presence"));
        assert_eq!(value["payload"]["status"], json!("online"));

        let decoded = SignalingEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn rejects_invalid_peer_ids() {
        let value = r#"{"from":"zz","to":"00","kind":"offer","payload":null}"#;
        assert!(SignalingEnvelope::from_json(value).is_err());

        let value = r#"{"from":"00","to":"00","kind":"unknown","payload":null}"#;
        assert!(SignalingEnvelope::from_json(value).is_err());
    }
}
