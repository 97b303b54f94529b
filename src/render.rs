//! Terminal rendering for transcripts, comparison results and reports.

use std::io::{self, Write};

use colored::*;

use crate::api::{ComparisonResult, ReportRecord};
use crate::transcript::{Role, TranscriptEvent, Turn};

pub fn role_label(role: Role) -> ColoredString {
    match role {
        Role::User => "you".bright_cyan().bold(),
        Role::Assistant => "assistant".bright_magenta().bold(),
    }
}

pub fn print_turn(turn: &Turn) {
    println!("{}: {}", role_label(turn.role), turn.content);
}

pub fn print_transcript(turns: &[Turn]) {
    if turns.is_empty() {
        println!("{}", "No chat history.".dimmed());
        return;
    }
    for turn in turns {
        print_turn(turn);
    }
}

pub fn print_comparison(result: &ComparisonResult) {
    println!("{}", "Server Result".bright_green().bold());
    println!("{}: {}", "Files".bright_yellow(), result.file_names.join(" , "));
    if let Some(summary) = &result.diff_summary {
        println!("\n{}", "Document Diff Summary".bright_magenta());
        println!("{}", summary);
    }
    if let Some(summary) = &result.code_combined_summary {
        println!("\n{}", "Code Combined Summary".bright_magenta());
        println!("{}", summary);
    }
    if result.processed {
        println!(
            "\n{}: {}",
            "Chat context options".bright_yellow(),
            result.context_options().join(", ")
        );
    } else {
        println!("\n{}", "Chat is disabled: the backend did not finish processing.".bright_red());
    }
}

pub fn print_reports(reports: &[ReportRecord]) {
    if reports.is_empty() {
        println!("{}", "No reports yet.".dimmed());
        return;
    }
    for report in reports {
        println!(
            "{}  {}  {}",
            report.id.bright_white().bold(),
            report.title,
            report.blob_reference.dimmed()
        );
    }
}

/// Prints a live transcript incrementally: a header when a turn is appended,
/// then only the newly arrived suffix of the streaming turn on each update.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    active: Option<usize>,
    printed: usize,
}

impl StreamPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of `event` not yet shown for the tracked turn.
    pub fn delta(&mut self, event: &TranscriptEvent) -> Option<String> {
        match event {
            TranscriptEvent::Appended { index, turn } if turn.streaming => {
                self.active = Some(*index);
                self.printed = 0;
                None
            }
            TranscriptEvent::Updated { index, turn } if self.active == Some(*index) => {
                let fresh = turn.content.get(self.printed..).unwrap_or_default().to_string();
                self.printed = turn.content.len();
                if !turn.streaming {
                    self.active = None;
                }
                (!fresh.is_empty()).then_some(fresh)
            }
            TranscriptEvent::Cleared => {
                self.active = None;
                self.printed = 0;
                None
            }
            _ => None,
        }
    }

    pub fn handle(&mut self, event: &TranscriptEvent) {
        if let TranscriptEvent::Appended { turn, .. } = event {
            if turn.streaming {
                print!("{}: ", role_label(turn.role));
            } else {
                print_turn(turn);
            }
        }
        let finished = matches!(event, TranscriptEvent::Updated { turn, .. } if !turn.streaming);
        let tracked = self.active.is_some();
        if let Some(text) = self.delta(event) {
            print!("{}", text);
        }
        if tracked && finished {
            println!();
        }
        let _ = io::stdout().flush();
    }
}
