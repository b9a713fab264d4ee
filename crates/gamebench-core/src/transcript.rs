//! Transcript rendering for persisted episodes.

use crate::recorder::{Action, InteractionLog};
use serde_json::Value;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

/// File name written by [`MarkdownTranscript`].
pub const MARKDOWN_TRANSCRIPT_FILE: &str = "transcript.md";

/// Renders a human-readable view of an interaction log into an episode directory.
pub trait TranscriptRenderer {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Writes the transcript for `log` into `dir`.
    fn render(&self, log: &InteractionLog, dir: &Path) -> io::Result<()>;
}

/// Writes `transcript.md`, one section per turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownTranscript;

impl MarkdownTranscript {
    /// Renders the transcript as a Markdown string.
    pub fn to_markdown(log: &InteractionLog) -> String {
        let mut out = String::from("# Interaction transcript\n\n## Players\n\n");
        for (identity, description) in &log.players {
            let _ = writeln!(out, "- **{}**: {}", identity, display_value(description));
        }

        for (turn, events) in log.turns.iter().enumerate() {
            let _ = write!(out, "\n## Turn {}\n\n", turn);
            for event in events {
                let content = display_value(&event.action.content);
                if event.action.kind == Action::SEND_MESSAGE
                    || event.action.kind == Action::GET_MESSAGE
                {
                    let _ = writeln!(out, "**{} → {}**\n", event.from, event.to);
                    for line in content.lines() {
                        let _ = writeln!(out, "> {}", line);
                    }
                    out.push('\n');
                } else {
                    let _ = writeln!(out, "*{} [{}]: {}*\n", event.from, event.action.kind, content);
                }
            }
        }

        if !log.keys.is_empty() {
            out.push_str("\n## Episode keys\n\n");
            for (key, value) in &log.keys {
                let _ = writeln!(out, "- {}: {}", key, display_value(value));
            }
        }
        out
    }
}

impl TranscriptRenderer for MarkdownTranscript {
    fn name(&self) -> &str {
        "markdown"
    }

    fn render(&self, log: &InteractionLog, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(MARKDOWN_TRANSCRIPT_FILE), Self::to_markdown(log))
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
