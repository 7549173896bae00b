//! Transcript reconciliation
//!
//! Interim fragments refine the speaker's open utterance in place; a final fragment
//! closes it. Closed entries are never reopened, so a later fragment from the same
//! speaker always starts a new entry.

use super::model::Speaker;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One utterance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    /// Local sequence id, in first-observed order
    pub seq: u64,
    pub speaker: Speaker,
    pub text: String,
    /// When the first fragment of this utterance arrived
    pub first_seen: DateTime<Utc>,
    pub is_final: bool,
}

/// Display names used when rendering the transcript as text
#[derive(Debug, Clone)]
pub struct SpeakerLabels {
    pub user: String,
    pub agent: String,
}

impl SpeakerLabels {
    pub fn label(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Agent => &self.agent,
        }
    }
}

impl Default for SpeakerLabels {
    fn default() -> Self {
        Self {
            user: "User".to_string(),
            agent: "Agent".to_string(),
        }
    }
}

/// Ordered, append-only transcript log
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_seq: u64,
}

impl Transcript {
    /// Apply a transcript fragment and return the entry it created or updated
    pub fn apply(&mut self, speaker: Speaker, text: &str, is_final: bool) -> &TranscriptEntry {
        let open = self
            .entries
            .iter()
            .rposition(|e| e.speaker == speaker && !e.is_final);

        let index = match open {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.text = text.to_string();
                entry.is_final = is_final;
                index
            }
            None => {
                self.next_seq += 1;
                self.entries.push(TranscriptEntry {
                    seq: self.next_seq,
                    speaker,
                    text: text.to_string(),
                    first_seen: Utc::now(),
                    is_final,
                });
                self.entries.len() - 1
            }
        };

        &self.entries[index]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn final_entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter().filter(|e| e.is_final)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render finalized utterances as `Speaker: text`, one per line
    pub fn render_text(&self, labels: &SpeakerLabels) -> String {
        self.final_entries()
            .map(|e| format!("{}: {}", labels.label(e.speaker), e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_seq = 0;
    }
}
