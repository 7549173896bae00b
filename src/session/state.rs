//! Per-session view state, driven by event channel traffic

use super::activity::{ActivityTracker, AgentActivity};
use super::display::{Display, DisplayState};
use super::model::AssetManifest;
use super::transcript::{Transcript, TranscriptEntry};
use super::SessionUpdate;
use crate::channel::ServerEvent;
use tracing::trace;

#[derive(Debug, Default)]
pub struct SessionState {
    transcript: Transcript,
    display: Display,
    activity: ActivityTracker,
}

impl SessionState {
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn display(&self) -> &DisplayState {
        self.display.state()
    }

    pub fn activity(&self) -> AgentActivity {
        self.activity.current()
    }

    /// Apply one inbound event and report what changed, in order
    pub fn apply(&mut self, manifest: &AssetManifest, event: ServerEvent) -> Vec<SessionUpdate> {
        trace!(kind = event.kind(), "Applying event");
        let mut updates = Vec::new();
        match event {
            ServerEvent::Transcript {
                speaker,
                text,
                is_final,
            } => {
                let entry: TranscriptEntry = self.transcript.apply(speaker, &text, is_final).clone();
                updates.push(SessionUpdate::Transcript(entry));
                if self.activity.on_transcript(speaker, is_final) {
                    updates.push(SessionUpdate::Activity(self.activity.current()));
                }
            }
            ServerEvent::AgentState { state } => {
                if self.activity.set_explicit(state) {
                    updates.push(SessionUpdate::Activity(state));
                }
            }
            ServerEvent::ShowAsset {
                asset_id,
                asset,
                start_time,
                end_time,
            } => {
                if self
                    .display
                    .show(manifest, &asset_id, asset, start_time, end_time)
                {
                    updates.push(SessionUpdate::Display(self.display.state().clone()));
                }
            }
            ServerEvent::HideAsset => {
                if self.display.hide() {
                    updates.push(SessionUpdate::Display(DisplayState::Empty));
                }
            }
            ServerEvent::Pong => {}
        }
        updates
    }

    /// Clear what can no longer be kept current: the display and agent activity.
    /// The transcript is kept.
    pub fn clear_live_view(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        if self.display.hide() {
            updates.push(SessionUpdate::Display(DisplayState::Empty));
        }
        if self.activity.reset() {
            updates.push(SessionUpdate::Activity(AgentActivity::Idle));
        }
        updates
    }
}
