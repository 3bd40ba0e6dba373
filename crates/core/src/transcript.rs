//! Transcript model and its mutation rules.
//!
//! The transcript is append/replace-only: entries are never reordered or
//! deleted except by an explicit clear. The single mutation that is not an
//! append is the trailing-partial replace performed by [`Transcript::upsert`].

/// Entry classification, mirrored to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Message,
    ToolStart,
    ToolComplete,
    Thinking,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub text: String,
    pub is_user: bool,
    pub timestamp: f64,
    pub is_partial: bool,
    pub kind: EntryKind,
    pub tool_name: Option<String>,
    pub tool_success: Option<bool>,
}

impl TranscriptEntry {
    pub fn message(text: impl Into<String>, is_user: bool, is_partial: bool, timestamp: f64) -> Self {
        Self {
            text: text.into(),
            is_user,
            timestamp,
            is_partial,
            kind: EntryKind::Message,
            tool_name: None,
            tool_success: None,
        }
    }

    pub fn thinking(text: impl Into<String>, is_partial: bool, timestamp: f64) -> Self {
        Self {
            kind: EntryKind::Thinking,
            ..Self::message(text, false, is_partial, timestamp)
        }
    }

    pub fn tool_start(tool_name: impl Into<String>, timestamp: f64) -> Self {
        let tool_name = tool_name.into();
        Self {
            text: tool_name.clone(),
            is_user: false,
            timestamp,
            is_partial: false,
            kind: EntryKind::ToolStart,
            tool_name: Some(tool_name),
            tool_success: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    /// Indices of `ToolStart` entries not yet matched by a completion.
    pending_tools: Vec<usize>,
}

impl Transcript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_tools.clear();
    }

    /// Applies the upsert rule to a new entry `E` against the last entry `L`:
    ///
    /// - `L` is a same-speaker trailing partial of the same kind, or a partial
    ///   `Message` while `E` is `Thinking` (the mid-stream thinking upgrade):
    ///   replace `L` in place;
    /// - `L` carries identical text/speaker/kind: drop `E` as a duplicate;
    /// - otherwise append.
    pub fn upsert(&mut self, entry: TranscriptEntry) {
        if let Some(last) = self.entries.last_mut() {
            let upgrade = last.kind == EntryKind::Message && entry.kind == EntryKind::Thinking;
            if last.is_user == entry.is_user
                && last.is_partial
                && (last.kind == entry.kind || upgrade)
            {
                *last = entry;
                return;
            }
            if last.text == entry.text && last.is_user == entry.is_user && last.kind == entry.kind {
                return;
            }
        }
        self.entries.push(entry);
    }

    /// Appends a tool-start entry and remembers it as pending.
    pub fn push_tool_start(&mut self, entry: TranscriptEntry) {
        debug_assert_eq!(entry.kind, EntryKind::ToolStart);
        self.entries.push(entry);
        self.pending_tools.push(self.entries.len() - 1);
    }

    /// Resolves a tool completion against the most recent unmatched start for
    /// the same name, flipping that entry to `ToolComplete` in place. Falls
    /// back to appending a standalone completion entry when no start matches.
    /// Returns true when an existing entry was flipped.
    pub fn complete_tool(&mut self, tool_name: &str, success: bool, timestamp: f64) -> bool {
        if let Some(pos) = self
            .pending_tools
            .iter()
            .rposition(|&i| self.entries[i].tool_name.as_deref() == Some(tool_name))
        {
            let idx = self.pending_tools.remove(pos);
            let entry = &mut self.entries[idx];
            entry.kind = EntryKind::ToolComplete;
            entry.is_partial = false;
            entry.tool_success = Some(success);
            return true;
        }
        self.entries.push(TranscriptEntry {
            text: tool_name.to_owned(),
            is_user: false,
            timestamp,
            is_partial: false,
            kind: EntryKind::ToolComplete,
            tool_name: Some(tool_name.to_owned()),
            tool_success: Some(success),
        });
        false
    }

    /// Freezes every partial entry in the trailing run belonging to one side,
    /// so subsequent content starts a fresh entry instead of replacing them.
    pub fn finalize_trailing_partials(&mut self, is_user: bool) {
        for entry in self.entries.iter_mut().rev() {
            if entry.is_user != is_user {
                break;
            }
            entry.is_partial = false;
        }
    }
}
