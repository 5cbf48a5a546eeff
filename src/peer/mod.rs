mod negotiation;

pub use negotiation::{
    admissible, check_admissible, negotiation_table, NegotiationTarget, PeerEvent, PeerPhase,
};

use crate::wire::Message;

/// Choke/interest flags for one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl PeerState {
    /// Folds a message received from the peer into the flags.
    pub fn apply_inbound(&mut self, message: &Message) {
        match message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            _ => {}
        }
    }

    /// Folds a message we sent to the peer into the flags.
    pub fn apply_outbound(&mut self, message: &Message) {
        match message {
            Message::Choke => self.am_choking = true,
            Message::Unchoke => self.am_choking = false,
            Message::Interested => self.am_interested = true,
            Message::NotInterested => self.am_interested = false,
            _ => {}
        }
    }
}
