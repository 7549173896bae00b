//! Negotiation phase machine

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Connection state reported by the audio transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Where the audio channel is in its lifetime.
/// `Disconnected` is terminal until the owning session is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPhase {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Disconnected,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::Negotiating => "negotiating",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// What a transport notification means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEffect {
    /// Nothing observable changed
    Unchanged,
    /// Phase changed; the session keeps running
    Changed,
    /// The transport is gone; recording must be cleared and the session stopped
    Lost,
}

#[derive(Debug, Default)]
pub struct PhaseMachine {
    phase: NegotiationPhase,
}

impl PhaseMachine {
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Idle -> Negotiating. False from any other phase.
    pub fn begin(&mut self) -> bool {
        if self.phase != NegotiationPhase::Idle {
            warn!(phase = %self.phase, "Cannot begin negotiation");
            return false;
        }
        self.set(NegotiationPhase::Negotiating);
        true
    }

    /// Negotiating -> Connected, once the remote answer is applied
    pub fn established(&mut self) -> bool {
        if self.phase != NegotiationPhase::Negotiating {
            return false;
        }
        self.set(NegotiationPhase::Connected);
        true
    }

    /// A negotiation attempt failed or was abandoned
    pub fn fail(&mut self) {
        if self.phase == NegotiationPhase::Negotiating {
            self.set(NegotiationPhase::Idle);
        }
    }

    pub fn on_transport(&mut self, state: TransportState) -> TransportEffect {
        debug!(?state, phase = %self.phase, "Transport state");
        match (self.phase, state) {
            (NegotiationPhase::Disconnected | NegotiationPhase::Idle, _) => TransportEffect::Unchanged,
            (NegotiationPhase::Negotiating, TransportState::Connected) => {
                self.set(NegotiationPhase::Connected);
                TransportEffect::Changed
            }
            (_, TransportState::Failed | TransportState::Disconnected | TransportState::Closed) => {
                warn!(?state, "Audio transport lost");
                self.set(NegotiationPhase::Idle);
                TransportEffect::Lost
            }
            _ => TransportEffect::Unchanged,
        }
    }

    /// Final teardown. Stays here until `reset`.
    pub fn teardown(&mut self) {
        if self.phase != NegotiationPhase::Disconnected {
            self.set(NegotiationPhase::Disconnected);
        }
    }

    /// Leave `Disconnected` for a new session. No transition is logged.
    pub fn reset(&mut self) {
        self.phase = NegotiationPhase::Idle;
    }

    fn set(&mut self, next: NegotiationPhase) {
        info!(from = %self.phase, to = %next, "Negotiation phase");
        self.phase = next;
    }
}
