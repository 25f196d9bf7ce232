// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted sessions on top of direct peer connections.
//!
//! The orchestrator ties both layers together: a message for a peer is only encrypted once a
//! connection to them is up, and incoming frames are decrypted with the pairwise session of the
//! peer they arrived from. Group messages are encrypted once with our sender chain, the chains
//! themselves travel over the pairwise sessions.
mod error;
mod orchestrator;
mod payload;

pub use error::SendError;
pub use orchestrator::{SessionEvent, SessionOrchestrator, SessionStorage};
pub use payload::{SessionPayload, WireMessage};
