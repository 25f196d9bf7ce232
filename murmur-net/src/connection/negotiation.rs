// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::transport::{Candidate, SessionDescription};
use crate::signaling::{EnvelopeKind, SignalingEnvelope};

/// Random identifier chosen by the offering side. Answers and candidates echo it, so messages of
/// earlier attempts can be told apart.
pub type ConnectionId = u64;

/// Negotiation messages carried in signaling envelopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Negotiation {
    Offer {
        connection: ConnectionId,
        description: SessionDescription,
    },
    Answer {
        connection: ConnectionId,
        description: SessionDescription,
    },
    Candidate {
        connection: ConnectionId,
        candidate: Candidate,
    },
}

#[derive(Serialize, Deserialize)]
struct DescriptionPayload {
    connection: ConnectionId,
    description: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    connection: ConnectionId,
    candidate: Candidate,
}

impl Negotiation {
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Offer { connection, .. }
            | Self::Answer { connection, .. }
            | Self::Candidate { connection, .. } => *connection,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Offer { .. } => EnvelopeKind::Offer,
            Self::Answer { .. } => EnvelopeKind::Answer,
            Self::Candidate { .. } => EnvelopeKind::Candidate,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self.clone() {
            Self::Offer {
                connection,
                description,
            }
            | Self::Answer {
                connection,
                description,
            } => serde_json::to_value(DescriptionPayload {
                connection,
                description,
            }),
            Self::Candidate {
                connection,
                candidate,
            } => serde_json::to_value(CandidatePayload {
                connection,
                candidate,
            }),
        }
    }

    pub fn from_envelope(envelope: &SignalingEnvelope) -> Result<Self, NegotiationError> {
        let payload = envelope.payload.clone();
        let negotiation = match envelope.kind {
            EnvelopeKind::Offer => {
                let DescriptionPayload {
                    connection,
                    description,
                } = serde_json::from_value(payload)?;
                Self::Offer {
                    connection,
                    description,
                }
            }
            EnvelopeKind::Answer => {
                let DescriptionPayload {
                    connection,
                    description,
                } = serde_json::from_value(payload)?;
                Self::Answer {
                    connection,
                    description,
                }
            }
            EnvelopeKind::Candidate => {
                let CandidatePayload {
                    connection,
                    candidate,
                } = serde_json::from_value(payload)?;
                Self::Candidate {
                    connection,
                    candidate,
                }
            }
            kind => return Err(NegotiationError::UnexpectedKind(kind)),
        };

        Ok(negotiation)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{0} envelope is not part of a negotiation")]
    UnexpectedKind(EnvelopeKind),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::connection::transport::{Candidate, SessionDescription};
    use crate::signaling::{EnvelopeKind, SignalingEnvelope};
    use crate::test_utils::generate_peer;

    use super::Negotiation;

    fn envelope(negotiation: &Negotiation) -> SignalingEnvelope {
        SignalingEnvelope {
            from: generate_peer(1),
            to: generate_peer(2),
            kind: negotiation.kind(),
            payload: negotiation.to_payload().unwrap(),
        }
    }

    #[test]
    fn payload_shape() {
        let negotiation = Negotiation::Candidate {
            connection: 7,
            candidate: Candidate::host("10.0.0.1:4000".parse().unwrap()),
        };
        assert_eq!(
            negotiation.to_payload().unwrap(),
            json!({
                "connection": 7,
                "candidate": { "kind": "host", "address": "10.0.0.1:4000" }
            })
        );
        assert_eq!(
            Negotiation::from_envelope(&envelope(&negotiation)).unwrap(),
            negotiation
        );
    }

    #[test]
    fn kind_decides_message_type() {
        let offer = Negotiation::Offer {
            connection: 1,
            description: SessionDescription {
                ufrag: "abc".into(),
            },
        };
        let mut answer = envelope(&offer);
        answer.kind = EnvelopeKind::Answer;
        assert!(matches!(
            Negotiation::from_envelope(&answer).unwrap(),
            Negotiation::Answer { connection: 1, .. }
        ));

        let mut presence = envelope(&offer);
        presence.kind = EnvelopeKind::Presence;
        assert!(Negotiation::from_envelope(&presence).is_err());
    }
}
