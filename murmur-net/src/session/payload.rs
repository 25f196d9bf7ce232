// SPDX-License-Identifier: MIT OR Apache-2.0

use murmur_encryption::group::SenderKeyDistribution;
use murmur_encryption::{GroupMessage, RatchetMessage};
use serde::{Deserialize, Serialize};

/// Messages exchanged by sessions over a data channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Encrypted for one peer with the pairwise session.
    Direct(RatchetMessage),
    /// Encrypted once with our sender chain and sent to every group member.
    Group(GroupMessage),
}

/// Plaintext of a direct message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    Application(#[serde(with = "serde_bytes")] Vec<u8>),
    SenderKey(SenderKeyDistribution),
}
