//! Topology decisions
//!
//! Pure mapping from the current mode and participant count to the
//! transition the session should apply.

use crate::protocol::{ControlMessage, Mode};

/// What a membership change does to the conference topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do
    Stay,
    /// One client left alone: relay path, notify that client
    Solo,
    /// Exactly two clients: start a P2P handoff
    PeerToPeer,
    /// More than two clients: back to the relay path
    ClientServer,
}

impl Transition {
    /// Mode after the transition is applied
    pub fn target_mode(&self, current: Mode) -> Mode {
        match self {
            Transition::Stay => current,
            Transition::PeerToPeer => Mode::PeerToPeer,
            Transition::Solo | Transition::ClientServer => Mode::ClientServer,
        }
    }

    /// Message sent to every remaining client
    pub fn notice(&self) -> Option<ControlMessage> {
        match self {
            Transition::Stay => None,
            Transition::PeerToPeer => Some(ControlMessage::SwitchToP2p),
            Transition::Solo | Transition::ClientServer => Some(ControlMessage::SwitchToCs),
        }
    }
}

/// Decide the transition for `participants` text-connected clients
pub fn plan(current: Mode, participants: usize) -> Transition {
    match participants {
        0 => Transition::Stay,
        1 => Transition::Solo,
        2 if current == Mode::PeerToPeer => Transition::Stay,
        2 => Transition::PeerToPeer,
        _ if current == Mode::ClientServer => Transition::Stay,
        _ => Transition::ClientServer,
    }
}
