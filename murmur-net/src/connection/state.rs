// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use thiserror::Error;

/// Lifecycle of a peer connection.
///
/// ```text
/// Idle -> Gathering -> Offering | Answering -> Checking -> Connected -> Closed
///                                                      \-> Failed
/// ```
///
/// Any state before `Connected` can move to `Failed` when the connection timeout hits, or to
/// `Closed` when the attempt is cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    /// Collecting local host and server-reflexive candidates.
    Gathering,
    /// Our offer was sent, waiting for the answer.
    Offering,
    /// Answering an offer of the remote peer.
    Answering,
    /// Testing candidate pairs.
    Checking,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Idle => "idle",
            Self::Gathering => "gathering",
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{value}")
    }
}

/// Why a connection attempt failed and where it got stuck.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason} (stuck in {stuck_in})")]
pub struct ConnectionFailure {
    pub stuck_in: ConnectionState,
    pub reason: FailureReason,
}

impl ConnectionFailure {
    pub fn new(stuck_in: ConnectionState, reason: FailureReason) -> Self {
        Self { stuck_in, reason }
    }
}

/// User-facing failure reasons.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("no usable network path found")]
    NoUsablePath,

    #[error("no local network candidates available")]
    NoCandidates,

    #[error("peer did not answer")]
    NoAnswer,

    #[error("connection could not be opened: {0}")]
    Transport(String),
}
