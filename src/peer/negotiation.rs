//! Connection negotiation, driven through the generic state machine.
//!
//! The phase gates which wire messages are admissible: possession
//! summaries (bitfield, have-all, have-none) are only legal as the first
//! message after the handshake, and nothing is legal before the handshake
//! completes. An inadmissible message is a protocol violation that is
//! fatal to the offending connection.

use crate::error::{Result, SwarmError};
use crate::machine::{Action, Ordinal, TransitionTable};
use crate::wire::Message;
use std::sync::Arc;

/// Lifecycle phase of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// TCP connect in flight.
    Connecting,
    /// Socket up, handshakes being exchanged.
    Handshaking,
    /// Handshake done; the next message may be a possession summary.
    Established,
    /// Steady-state message exchange.
    Ready,
    Closed,
}

impl Ordinal for PeerPhase {
    const CARDINALITY: usize = 5;

    fn ordinal(self) -> usize {
        match self {
            PeerPhase::Connecting => 0,
            PeerPhase::Handshaking => 1,
            PeerPhase::Established => 2,
            PeerPhase::Ready => 3,
            PeerPhase::Closed => 4,
        }
    }

    fn from_ordinal(ordinal: usize) -> Option<Self> {
        match ordinal {
            0 => Some(PeerPhase::Connecting),
            1 => Some(PeerPhase::Handshaking),
            2 => Some(PeerPhase::Established),
            3 => Some(PeerPhase::Ready),
            4 => Some(PeerPhase::Closed),
            _ => None,
        }
    }
}

/// Events feeding the negotiation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    SocketConnected,
    HandshakeReceived,
    /// Bitfield, have-all or have-none consumed.
    PossessionReceived,
    /// Any other first message; the possession summary is forfeited.
    MessageReceived,
    Failure,
}

impl Ordinal for PeerEvent {
    const CARDINALITY: usize = 5;

    fn ordinal(self) -> usize {
        match self {
            PeerEvent::SocketConnected => 0,
            PeerEvent::HandshakeReceived => 1,
            PeerEvent::PossessionReceived => 2,
            PeerEvent::MessageReceived => 3,
            PeerEvent::Failure => 4,
        }
    }

    fn from_ordinal(ordinal: usize) -> Option<Self> {
        match ordinal {
            0 => Some(PeerEvent::SocketConnected),
            1 => Some(PeerEvent::HandshakeReceived),
            2 => Some(PeerEvent::PossessionReceived),
            3 => Some(PeerEvent::MessageReceived),
            4 => Some(PeerEvent::Failure),
            _ => None,
        }
    }
}

/// What the machine's actions ask of the surrounding session.
pub trait NegotiationTarget: Send + Sync {
    fn send_handshake(&self);
    /// Send our own possession summary (bitfield, have-all or have-none).
    fn send_possession(&self);
    /// Negotiation finished; interest and request traffic may start.
    fn begin_requesting(&self);
    fn teardown(&self);
}

/// Builds the negotiation transition table for one target type.
pub fn negotiation_table<T: NegotiationTarget + 'static>() -> TransitionTable<PeerPhase, PeerEvent, T>
{
    let teardown: Action<T> = Arc::new(|t: &T| t.teardown());
    TransitionTable::builder()
        .rule(
            PeerPhase::Connecting,
            PeerEvent::SocketConnected,
            Some(PeerPhase::Handshaking),
            Some(Arc::new(|t: &T| t.send_handshake())),
        )
        .rule(
            PeerPhase::Handshaking,
            PeerEvent::HandshakeReceived,
            Some(PeerPhase::Established),
            Some(Arc::new(|t: &T| t.send_possession())),
        )
        .rule(
            PeerPhase::Established,
            PeerEvent::PossessionReceived,
            Some(PeerPhase::Ready),
            Some(Arc::new(|t: &T| t.begin_requesting())),
        )
        .rule(
            PeerPhase::Established,
            PeerEvent::MessageReceived,
            Some(PeerPhase::Ready),
            Some(Arc::new(|t: &T| t.begin_requesting())),
        )
        .rule(
            PeerPhase::Connecting,
            PeerEvent::Failure,
            Some(PeerPhase::Closed),
            Some(Arc::clone(&teardown)),
        )
        .rule(
            PeerPhase::Handshaking,
            PeerEvent::Failure,
            Some(PeerPhase::Closed),
            Some(Arc::clone(&teardown)),
        )
        .rule(
            PeerPhase::Established,
            PeerEvent::Failure,
            Some(PeerPhase::Closed),
            Some(Arc::clone(&teardown)),
        )
        .rule(
            PeerPhase::Ready,
            PeerEvent::Failure,
            Some(PeerPhase::Closed),
            Some(teardown),
        )
        .build()
}

/// Checks whether `message` is legal in `phase`.
pub fn admissible(phase: PeerPhase, message: &Message) -> bool {
    let possession_summary = matches!(
        message,
        Message::Bitfield(_) | Message::HaveAll | Message::HaveNone
    );
    match phase {
        PeerPhase::Connecting | PeerPhase::Handshaking | PeerPhase::Closed => false,
        PeerPhase::Established => true,
        PeerPhase::Ready => !possession_summary,
    }
}

/// [`admissible`] as a result, for `?`-style propagation.
pub fn check_admissible(phase: PeerPhase, message: &Message) -> Result<()> {
    if admissible(phase, message) {
        return Ok(());
    }
    Err(SwarmError::ProtocolViolation(format!(
        "{:?} not admissible in phase {:?}",
        message, phase
    )))
}
