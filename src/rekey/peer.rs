use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use super::checkpoint::{Checkpoint, RekeySubstate};
use crate::config::RekeyConfig;

/// Messages exchanged between the two controllers of a raid group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    CheckpointHint {
        sequence: u64,
        checkpoint: Checkpoint,
        substate: RekeySubstate,
    },
    HintAck {
        sequence: u64,
    },
    /// Sent by a controller that restarted and wants the active's state.
    RejoinRequest,
    StateSync {
        checkpoint: Checkpoint,
        substate: RekeySubstate,
    },
}

/// One end of a bidirectional link to the peer controller.
pub struct PeerLink {
    tx: Sender<PeerMessage>,
    rx: Receiver<PeerMessage>,
}

pub fn peer_link_pair() -> (PeerLink, PeerLink) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (PeerLink { tx: a_tx, rx: a_rx }, PeerLink { tx: b_tx, rx: b_rx })
}

/// Last known rekey state of the peer. Always a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerRekeyView {
    pub checkpoint: Checkpoint,
    pub substate: Option<RekeySubstate>,
    pub sequence: u64,
}

impl Default for PeerRekeyView {
    fn default() -> Self {
        PeerRekeyView {
            checkpoint: Checkpoint::Invalid,
            substate: None,
            sequence: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The link dropped; the view holds the last hint received.
    Lost,
    RejoinRequested,
    Synced { checkpoint: Checkpoint, substate: RekeySubstate },
    AckTimeout { sequence: u64 },
}

/// Propagates checkpoint hints to the peer and tracks what it last heard
/// from it. Propagation is rate limited and best effort: the recovery path
/// never relies on it.
pub struct PeerCoordinator {
    link: Option<PeerLink>,
    view: PeerRekeyView,
    interval_chunks: u64,
    ack_timeout: Duration,
    last_propagated_chunk: Option<u64>,
    sequence: u64,
    pending: Option<(u64, Instant)>,
    responsive: bool,
    ack_timeouts: u64,
}

impl PeerCoordinator {
    pub fn new(link: Option<PeerLink>, config: &RekeyConfig) -> Self {
        PeerCoordinator {
            link,
            view: PeerRekeyView::default(),
            interval_chunks: config.peer_propagation_interval_chunks,
            ack_timeout: config.peer_ack_timeout(),
            last_propagated_chunk: None,
            sequence: 0,
            pending: None,
            responsive: true,
            ack_timeouts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_responsive(&self) -> bool {
        self.responsive
    }

    /// Hints the peer failed to acknowledge in time.
    pub fn ack_timeouts(&self) -> u64 {
        self.ack_timeouts
    }

    pub fn pending_peer_ack(&self) -> bool {
        self.pending.is_some()
    }

    pub fn view(&self) -> &PeerRekeyView {
        &self.view
    }

    /// Replaces the link after the peer came back.
    pub fn attach(&mut self, link: PeerLink) {
        self.link = Some(link);
        self.responsive = true;
        self.pending = None;
        self.last_propagated_chunk = None;
    }

    fn send(&mut self, message: PeerMessage) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        if link.tx.send(message).is_err() {
            self.peer_lost();
            return false;
        }
        true
    }

    /// Sends a hint when `chunk` moved at least the propagation interval
    /// past the last hint, or when `force` is set.
    pub fn propagate_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
        chunk: u64,
        substate: RekeySubstate,
        force: bool,
    ) -> bool {
        let due = match self.last_propagated_chunk {
            None => true,
            Some(last) => chunk.saturating_sub(last) >= self.interval_chunks,
        };
        if !(due || force) || self.link.is_none() {
            return false;
        }
        self.sequence += 1;
        let sequence = self.sequence;
        if !self.send(PeerMessage::CheckpointHint {
            sequence,
            checkpoint,
            substate,
        }) {
            return false;
        }
        self.last_propagated_chunk = Some(chunk);
        if self.pending.is_none() {
            self.pending = Some((sequence, Instant::now()));
        }
        debug!("Propagated checkpoint {checkpoint} (hint {sequence})");
        true
    }

    pub fn request_rejoin(&mut self) -> bool {
        info!("Requesting state sync from peer");
        self.send(PeerMessage::RejoinRequest)
    }

    pub fn send_state_sync(&mut self, checkpoint: Checkpoint, substate: RekeySubstate) -> bool {
        self.send(PeerMessage::StateSync { checkpoint, substate })
    }

    /// Drops the link. The view keeps the last hint, which is all a
    /// survivor may use, and only to widen its verification range.
    pub fn peer_lost(&mut self) {
        if self.link.take().is_some() {
            warn!("Peer lost, last hint {}", self.view.checkpoint);
        }
        self.pending = None;
    }

    /// Drains incoming messages and checks the pending acknowledgement.
    pub fn poll(&mut self) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        loop {
            let Some(link) = &self.link else {
                break;
            };
            let message = match link.rx.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.peer_lost();
                    events.push(PeerEvent::Lost);
                    break;
                }
            };
            match message {
                PeerMessage::CheckpointHint {
                    sequence,
                    checkpoint,
                    substate,
                } => {
                    self.view = PeerRekeyView {
                        checkpoint,
                        substate: Some(substate),
                        sequence,
                    };
                    self.send(PeerMessage::HintAck { sequence });
                }
                PeerMessage::HintAck { sequence } => {
                    if self.pending.is_some_and(|(pending, _)| sequence >= pending) {
                        self.pending = None;
                        self.responsive = true;
                    }
                }
                PeerMessage::RejoinRequest => events.push(PeerEvent::RejoinRequested),
                PeerMessage::StateSync { checkpoint, substate } => {
                    self.view = PeerRekeyView {
                        checkpoint,
                        substate: Some(substate),
                        sequence: self.view.sequence,
                    };
                    events.push(PeerEvent::Synced { checkpoint, substate });
                }
            }
        }

        if let Some((sequence, since)) = self.pending {
            if since.elapsed() >= self.ack_timeout {
                debug!("Hint {sequence} unacknowledged after {:?}", self.ack_timeout);
                self.pending = None;
                self.responsive = false;
                self.ack_timeouts += 1;
                events.push(PeerEvent::AckTimeout { sequence });
            }
        }
        events
    }
}
