//! Append-only log of transcription fragments.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    /// The caller's speech, recognised by the service.
    Input,
    /// The service's own synthesized reply.
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Fragments are kept exactly as they arrive, one entry each. Grouping into
/// sentences or turns is left to whoever displays them.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: TranscriptRole, text: impl Into<String>) -> &TranscriptEntry {
        self.push_at(role, text, Utc::now())
    }

    pub fn push_at(&mut self, role: TranscriptRole, text: impl Into<String>, received_at: DateTime<Utc>) -> &TranscriptEntry {
        self.entries.push(TranscriptEntry {
            role,
            text: text.into(),
            received_at,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }
}
