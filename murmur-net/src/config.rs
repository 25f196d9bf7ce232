// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of a murmur node.
//!
//! `Config` bundles the settings of every layer: key material, ratchets, groups, the signaling
//! relay and peer connection establishment. All parameters have defaults, so usually only the
//! relay address and its auth token need to be set.
use std::time::Duration;

use murmur_encryption::{GroupConfig, KeyStoreConfig, RatchetConfig};
use serde::{Deserialize, Serialize};

/// Default address of the signaling relay.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8787/signal";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub key_store: KeyStoreConfig,
    pub ratchet: RatchetConfig,
    pub group: GroupConfig,
    pub signaling: SignalingConfig,
    pub connection: ConnectionConfig,
}

/// Configuration of the signaling relay client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket address of the relay.
    ///
    /// Defaults to `ws://localhost:8787/signal`.
    pub relay_url: String,

    /// Token sent as bearer authorization when connecting to the relay.
    ///
    /// Defaults to `None`.
    pub auth_token: Option<String>,

    /// Parameters of the reconnection backoff.
    pub backoff: BackoffConfig,

    /// Number of failed connection attempts in a row after which the client gives up.
    ///
    /// Defaults to 10.
    pub max_attempts: u32,

    /// Capacity of the queue of outgoing envelopes. Envelopes sent into a full queue are dropped.
    ///
    /// Defaults to 256.
    pub queue_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            auth_token: None,
            backoff: BackoffConfig::default(),
            max_attempts: 10,
            queue_capacity: 256,
        }
    }
}

/// Exponential backoff with full jitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Upper bound of the first delay. It doubles with every failed attempt.
    ///
    /// Defaults to 1 second.
    pub base: Duration,

    /// Maximum upper bound of a delay.
    ///
    /// Defaults to 30 seconds.
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

/// Timing parameters of peer connection establishment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Time after which a connection which did not reach `Connected` is considered failed.
    ///
    /// Defaults to 15 seconds.
    pub connect_timeout: Duration,

    /// Candidate gathering lasts at least this long, even if all candidates are known earlier.
    ///
    /// Defaults to 1 second.
    pub min_gathering_time: Duration,

    /// Candidate gathering is aborted after this time with whatever was found until then.
    ///
    /// Defaults to 5 seconds.
    pub gathering_timeout: Duration,

    /// Interval in which unanswered offers and our candidates are sent again.
    ///
    /// Defaults to 2 seconds.
    pub retransmit_interval: Duration,

    /// After the first successful connectivity check we wait this long for pairs with a lower
    /// latency before nominating one.
    ///
    /// Defaults to 200 milliseconds.
    pub nomination_window: Duration,

    /// Capacity of the outbound frame queue of each connection.
    ///
    /// Defaults to 128.
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            min_gathering_time: Duration::from_secs(1),
            gathering_timeout: Duration::from_secs(5),
            retransmit_interval: Duration::from_secs(2),
            nomination_window: Duration::from_millis(200),
            channel_capacity: 128,
        }
    }
}
