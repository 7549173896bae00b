//! Agent activity derived from transcript traffic and explicit state messages

use super::model::Speaker;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentActivity {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl fmt::Display for AgentActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentActivity::Idle => "idle",
            AgentActivity::Listening => "listening",
            AgentActivity::Thinking => "thinking",
            AgentActivity::Speaking => "speaking",
        };
        f.write_str(label)
    }
}

/// Holds the current activity. Explicit state messages and the transcript heuristic
/// both overwrite it; whichever arrived last wins.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    current: AgentActivity,
}

impl ActivityTracker {
    pub fn current(&self) -> AgentActivity {
        self.current
    }

    /// Heuristic update from a transcript fragment. Returns true on change.
    pub fn on_transcript(&mut self, speaker: Speaker, is_final: bool) -> bool {
        let next = match (speaker, is_final) {
            (Speaker::Agent, false) => AgentActivity::Speaking,
            (Speaker::Agent, true) => AgentActivity::Idle,
            (Speaker::User, _) => AgentActivity::Listening,
        };
        self.set(next)
    }

    /// Explicit `agent_state` message. Returns true on change.
    pub fn set_explicit(&mut self, state: AgentActivity) -> bool {
        self.set(state)
    }

    /// Force idle, e.g. when updates can no longer be trusted
    pub fn reset(&mut self) -> bool {
        self.set(AgentActivity::Idle)
    }

    fn set(&mut self, next: AgentActivity) -> bool {
        let changed = self.current != next;
        self.current = next;
        changed
    }
}
