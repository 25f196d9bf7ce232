// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task driving a single connection attempt through its states and pumping frames afterwards.
use std::collections::HashSet;
use std::sync::Arc;

use murmur_encryption::cbor::{decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::PeerId;
use crate::config::ConnectionConfig;
use crate::connection::negotiation::{ConnectionId, Negotiation};
use crate::connection::state::{ConnectionFailure, ConnectionState, FailureReason};
use crate::connection::transport::{
    Candidate, CandidatePair, DataChannel, IceTransport, SessionDescription, TransportError,
};
use crate::signaling::SignalingClient;

/// Frames on the data channel.
#[derive(Debug, Serialize, Deserialize)]
enum ChannelFrame {
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Sent before the channel is closed on purpose.
    Close,
}

#[derive(Clone, Debug)]
pub(crate) enum Role {
    Controlling,
    Controlled { offer: SessionDescription },
}

/// Reports of a driver to the connection manager.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    State {
        peer: PeerId,
        connection: ConnectionId,
        state: ConnectionState,
    },
    Connected {
        peer: PeerId,
        connection: ConnectionId,
    },
    Failed {
        peer: PeerId,
        connection: ConnectionId,
        failure: ConnectionFailure,
    },
    Frame {
        peer: PeerId,
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        connection: ConnectionId,
    },
}

enum Interrupted {
    Cancelled,
    Failed(ConnectionFailure),
}

impl Interrupted {
    fn failed(stuck_in: ConnectionState, reason: FailureReason) -> Self {
        Self::Failed(ConnectionFailure::new(stuck_in, reason))
    }
}

pub(crate) struct Driver<T: IceTransport> {
    pub(crate) peer: PeerId,
    pub(crate) connection: ConnectionId,
    pub(crate) role: Role,
    pub(crate) transport: Arc<T>,
    pub(crate) signaling: SignalingClient,
    pub(crate) config: ConnectionConfig,
    pub(crate) negotiation_rx: mpsc::Receiver<Negotiation>,
    pub(crate) outbound_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) events_tx: mpsc::Sender<DriverEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: ConnectionState,
    pub(crate) deadline: Instant,
}

impl<T: IceTransport> Driver<T> {
    pub(crate) async fn run(mut self) {
        let result = match self.role.clone() {
            Role::Controlling => self.establish_controlling().await,
            Role::Controlled { offer } => self.establish_controlled(offer).await,
        };

        match result {
            Ok(channel) => {
                self.set_state(ConnectionState::Connected).await;
                self.report(DriverEvent::Connected {
                    peer: self.peer,
                    connection: self.connection,
                })
                .await;
                self.pump(channel).await;
                self.set_state(ConnectionState::Closed).await;
                self.report(DriverEvent::Closed {
                    peer: self.peer,
                    connection: self.connection,
                })
                .await;
            }
            Err(Interrupted::Cancelled) => {
                debug!(peer = %self.peer, state = %self.state, "connection attempt cancelled");
                self.set_state(ConnectionState::Closed).await;
                self.report(DriverEvent::Closed {
                    peer: self.peer,
                    connection: self.connection,
                })
                .await;
            }
            Err(Interrupted::Failed(failure)) => {
                warn!(peer = %self.peer, "connection failed: {failure}");
                self.set_state(ConnectionState::Failed).await;
                self.report(DriverEvent::Failed {
                    peer: self.peer,
                    connection: self.connection,
                    failure,
                })
                .await;
            }
        }
    }

    async fn establish_controlling(&mut self) -> Result<T::Channel, Interrupted> {
        let local = self.gather().await?;

        self.set_state(ConnectionState::Offering).await;
        let offer = Negotiation::Offer {
            connection: self.connection,
            description: self.transport.local_description(),
        };
        self.announce(&offer, &local);

        let mut remote = Vec::new();
        let mut retransmit = self.retransmit_interval();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(Interrupted::failed(
                        ConnectionState::Offering,
                        FailureReason::NoAnswer,
                    ));
                }
                _ = retransmit.tick() => {
                    trace!(peer = %self.peer, "retransmit offer");
                    self.announce(&offer, &local);
                }
                msg = self.negotiation_rx.recv() => match msg {
                    Some(Negotiation::Answer { description, .. }) => {
                        self.transport.set_remote_description(description).map_err(|err| {
                            Interrupted::failed(
                                ConnectionState::Offering,
                                FailureReason::Transport(err.to_string()),
                            )
                        })?;
                        break;
                    }
                    Some(Negotiation::Candidate { candidate, .. }) => {
                        if !remote.contains(&candidate) {
                            remote.push(candidate);
                        }
                    }
                    Some(Negotiation::Offer { .. }) => (),
                    None => return Err(Interrupted::Cancelled),
                }
            }
        }

        self.set_state(ConnectionState::Checking).await;
        self.check_and_nominate(local, remote).await
    }

    async fn establish_controlled(
        &mut self,
        offer: SessionDescription,
    ) -> Result<T::Channel, Interrupted> {
        self.transport.set_remote_description(offer).map_err(|err| {
            Interrupted::failed(self.state, FailureReason::Transport(err.to_string()))
        })?;

        let local = self.gather().await?;

        self.set_state(ConnectionState::Answering).await;
        let answer = Negotiation::Answer {
            connection: self.connection,
            description: self.transport.local_description(),
        };
        self.announce(&answer, &local);

        self.set_state(ConnectionState::Checking).await;
        let mut retransmit = self.retransmit_interval();
        let transport = self.transport.clone();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(Interrupted::failed(
                        ConnectionState::Checking,
                        FailureReason::NoUsablePath,
                    ));
                }
                result = transport.accept() => {
                    return result.map_err(|err| {
                        Interrupted::failed(
                            ConnectionState::Checking,
                            FailureReason::Transport(err.to_string()),
                        )
                    });
                }
                _ = retransmit.tick() => self.announce_candidates(&local),
                msg = self.negotiation_rx.recv() => match msg {
                    Some(Negotiation::Offer { .. }) => {
                        // Our answer got lost.
                        self.announce(&answer, &local);
                    }
                    Some(Negotiation::Candidate { candidate, .. }) => {
                        self.transport.add_remote_candidate(candidate);
                    }
                    Some(Negotiation::Answer { .. }) => (),
                    None => return Err(Interrupted::Cancelled),
                }
            }
        }
    }

    /// Collects host and server-reflexive candidates in parallel.
    async fn gather(&mut self) -> Result<Vec<Candidate>, Interrupted> {
        self.set_state(ConnectionState::Gathering).await;
        let started = Instant::now();

        let timeout = self.config.gathering_timeout;
        let transport = self.transport.clone();
        let gathering = async {
            let (host, reflexive) = tokio::join!(
                tokio::time::timeout(timeout, transport.gather_host_candidates()),
                tokio::time::timeout(timeout, transport.gather_reflexive_candidates()),
            );

            let mut candidates = Vec::new();
            for (kind, result) in [("host", host), ("server-reflexive", reflexive)] {
                match result {
                    Ok(Ok(found)) => candidates.extend(found),
                    Ok(Err(err)) => warn!("{kind} candidate gathering failed: {err}"),
                    Err(_) => debug!("{kind} candidate gathering timed out"),
                }
            }
            candidates
        };

        let candidates = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
            candidates = gathering => candidates,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(started + self.config.min_gathering_time) => (),
        }

        if candidates.is_empty() {
            return Err(Interrupted::failed(
                ConnectionState::Gathering,
                FailureReason::NoCandidates,
            ));
        }

        debug!(peer = %self.peer, "gathered {} candidates", candidates.len());
        Ok(candidates)
    }

    /// Runs connectivity checks on all candidate pairs concurrently and nominates the pair with the
    /// lowest round-trip time which succeeded within the nomination window.
    async fn check_and_nominate(
        &mut self,
        local: Vec<Candidate>,
        remote: Vec<Candidate>,
    ) -> Result<T::Channel, Interrupted> {
        let mut checks = JoinSet::new();
        let mut started = HashSet::new();
        for candidate in remote {
            self.spawn_checks(&mut checks, &mut started, &local, candidate);
        }

        let mut best: Option<(Duration, CandidatePair)> = None;
        let mut nominate_at: Option<Instant> = None;
        let mut retransmit = self.retransmit_interval();

        loop {
            let nomination = async {
                match nominate_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(Interrupted::failed(
                        ConnectionState::Checking,
                        FailureReason::NoUsablePath,
                    ));
                }
                _ = nomination => break,
                Some(result) = checks.join_next(), if !checks.is_empty() => match result {
                    Ok((pair, Ok(rtt))) => {
                        trace!(
                            peer = %self.peer,
                            "check {} -> {} succeeded in {:?}",
                            pair.local,
                            pair.remote,
                            rtt
                        );
                        if best.is_none_or(|(best_rtt, _)| rtt < best_rtt) {
                            best = Some((rtt, pair));
                        }
                        if nominate_at.is_none() {
                            nominate_at = Some(Instant::now() + self.config.nomination_window);
                        }
                    }
                    Ok((pair, Err(err))) => {
                        trace!(
                            peer = %self.peer,
                            "check {} -> {} failed: {err}",
                            pair.local,
                            pair.remote
                        );
                    }
                    Err(err) => warn!("connectivity check task failed: {err}"),
                },
                _ = retransmit.tick() => self.announce_candidates(&local),
                msg = self.negotiation_rx.recv() => match msg {
                    Some(Negotiation::Candidate { candidate, .. }) => {
                        self.spawn_checks(&mut checks, &mut started, &local, candidate);
                    }
                    Some(_) => (),
                    None => return Err(Interrupted::Cancelled),
                }
            }
        }

        checks.abort_all();

        let Some((rtt, pair)) = best else {
            return Err(Interrupted::failed(
                ConnectionState::Checking,
                FailureReason::NoUsablePath,
            ));
        };
        debug!(peer = %self.peer, "nominate {} -> {} ({:?})", pair.local, pair.remote, rtt);

        let transport = self.transport.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupted::failed(
                ConnectionState::Checking,
                FailureReason::NoUsablePath,
            )),
            result = transport.connect(pair) => result.map_err(|err| {
                Interrupted::failed(
                    ConnectionState::Checking,
                    FailureReason::Transport(err.to_string()),
                )
            }),
        }
    }

    fn spawn_checks(
        &self,
        checks: &mut JoinSet<(CandidatePair, Result<Duration, TransportError>)>,
        started: &mut HashSet<CandidatePair>,
        local: &[Candidate],
        remote: Candidate,
    ) {
        for local in local {
            let pair = CandidatePair {
                local: *local,
                remote,
            };
            if !started.insert(pair) {
                continue;
            }

            let transport = self.transport.clone();
            checks.spawn(async move {
                let result = transport.check(pair).await;
                (pair, result)
            });
        }
    }

    /// Forwards frames between the data channel and the manager until either side closes.
    async fn pump(&mut self, mut channel: T::Channel) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    match encode_cbor(&ChannelFrame::Close) {
                        Ok(bytes) => {
                            let _ = channel.send(bytes).await;
                        }
                        Err(err) => warn!("could not encode close frame: {err}"),
                    }
                    channel.close();
                    break;
                }
                frame = channel.recv() => {
                    let Some(bytes) = frame else {
                        debug!(peer = %self.peer, "data channel closed by remote peer");
                        break;
                    };

                    match decode_cbor::<ChannelFrame, _>(&bytes[..]) {
                        Ok(ChannelFrame::Data(bytes)) => {
                            self.report(DriverEvent::Frame {
                                peer: self.peer,
                                connection: self.connection,
                                bytes,
                            })
                            .await;
                        }
                        Ok(ChannelFrame::Close) => {
                            debug!(peer = %self.peer, "remote peer closed the connection");
                            channel.close();
                            break;
                        }
                        Err(err) => warn!(peer = %self.peer, "dropping malformed frame: {err}"),
                    }
                }
                Some(bytes) = self.outbound_rx.recv() => {
                    let result = match encode_cbor(&ChannelFrame::Data(bytes)) {
                        Ok(frame) => channel.send(frame).await,
                        Err(err) => {
                            warn!("could not encode frame: {err}");
                            continue;
                        }
                    };

                    if let Err(err) = result {
                        warn!(peer = %self.peer, "data channel failed: {err}");
                        break;
                    }
                }
            }
        }
    }

    fn announce(&self, negotiation: &Negotiation, local: &[Candidate]) {
        self.signal(negotiation);
        self.announce_candidates(local);
    }

    fn announce_candidates(&self, local: &[Candidate]) {
        for candidate in local {
            self.signal(&Negotiation::Candidate {
                connection: self.connection,
                candidate: *candidate,
            });
        }
    }

    fn signal(&self, negotiation: &Negotiation) {
        let payload = match negotiation.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not encode negotiation: {err}");
                return;
            }
        };

        if let Err(err) = self
            .signaling
            .send_to(self.peer, negotiation.kind(), payload)
        {
            debug!(peer = %self.peer, "could not signal {}: {err}", negotiation.kind());
        }
    }

    fn retransmit_interval(&self) -> tokio::time::Interval {
        let period = self.config.retransmit_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    async fn set_state(&mut self, state: ConnectionState) {
        trace!(peer = %self.peer, "{} -> {}", self.state, state);
        self.state = state;
        self.report(DriverEvent::State {
            peer: self.peer,
            connection: self.connection,
            state,
        })
        .await;
    }

    async fn report(&self, event: DriverEvent) {
        // The manager only goes away on shutdown.
        let _ = self.events_tx.send(event).await;
    }
}
