use crate::model::{ControllerEvent, StepId, StepStatus};
use crate::orchestrator::Snapshot;
use ratatui::{
    style::Color,
    style::Style,
    text::{Line, Span},
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;

const MAX_LOG: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Local wall clock, `HH:MM:SS`.
    pub at: String,
    pub text: String,
    pub is_error: bool,
}

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub snapshot: Snapshot,
    /// Newest first.
    pub log: VecDeque<LogEntry>,
    pub candidate_selected: usize,
    /// Some while the user is typing a path.
    pub path_input: Option<String>,
    pub monitoring: bool,
    pub stall_after: Duration,
    /// Step currently active, the generation that started it, and when we first saw it.
    active_since: Option<(StepId, u64, Instant)>,
    stall_sent: bool,
}

impl UiState {
    pub fn new(stall_after: Duration, monitoring: bool) -> Self {
        Self {
            tab: 0,
            info: String::new(),
            snapshot: Snapshot::default(),
            log: VecDeque::new(),
            candidate_selected: 0,
            path_input: None,
            monitoring,
            stall_after,
            active_since: None,
            stall_sent: false,
        }
    }

    pub fn push_log(&mut self, text: String, is_error: bool) {
        self.log.push_front(LogEntry {
            at: clock(),
            text,
            is_error,
        });
        self.log.truncate(MAX_LOG);
    }

    pub fn apply_event(&mut self, ev: &ControllerEvent) {
        let text = ev.to_message();
        self.info = text.clone();
        self.push_log(text, ev.is_error());
    }

    pub fn apply_snapshot(&mut self, snap: Snapshot, now: Instant) {
        let active = snap.steps.active().map(|s| (s, snap.generation));
        match (active, self.active_since) {
            (Some((step, gen)), Some((seen, seen_gen, _))) if step == seen && gen == seen_gen => {}
            (Some((step, gen)), _) => {
                self.active_since = Some((step, gen, now));
                self.stall_sent = false;
            }
            (None, _) => {
                self.active_since = None;
                self.stall_sent = false;
            }
        }
        if self.candidate_selected >= snap.candidates.len() {
            self.candidate_selected = snap.candidates.len().saturating_sub(1);
        }
        self.snapshot = snap;
    }

    /// Active step that has waited longer than `stall_after`. Reported once per activation.
    pub fn take_stalled(&mut self, now: Instant) -> Option<StepId> {
        let (step, _, since) = self.active_since?;
        if self.stall_sent || now.duration_since(since) < self.stall_after {
            return None;
        }
        self.stall_sent = true;
        Some(step)
    }

    pub fn selected_candidate(&self) -> Option<&str> {
        self.snapshot
            .candidates
            .get(self.candidate_selected)
            .map(String::as_str)
    }

    pub fn select_next(&mut self) {
        if self.candidate_selected + 1 < self.snapshot.candidates.len() {
            self.candidate_selected += 1;
        }
    }

    pub fn select_prev(&mut self) {
        self.candidate_selected = self.candidate_selected.saturating_sub(1);
    }
}

fn clock() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

pub fn status_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Pending => Color::DarkGray,
        StepStatus::Active => Color::Cyan,
        StepStatus::Complete => Color::Green,
        StepStatus::Error => Color::Red,
        StepStatus::Stalled => Color::Yellow,
    }
}

pub fn push_wrapped_status_kv(
    out: &mut Vec<Line<'static>>,
    label: &str,
    value: &str,
    status_area_width: u16,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    // Account for borders (2 chars on each side)
    let usable_width = status_area_width.saturating_sub(4).max(1);
    let label_text = format!("{label}:");
    let label_width = label_text.chars().count() as u16;

    let value_chars: Vec<char> = value.chars().collect();
    let mut remaining = value_chars.as_slice();
    let mut first = true;

    while !remaining.is_empty() {
        let line_width = if first {
            usable_width.saturating_sub(label_width + 1).max(1)
        } else {
            usable_width.saturating_sub(2).max(1)
        };

        let take = (remaining.len() as u16).min(line_width) as usize;
        let (line_chars, rest) = remaining.split_at(take);
        let line_text: String = line_chars.iter().collect();

        if first {
            out.push(Line::from(vec![
                Span::styled(label_text.clone(), Style::default().fg(Color::Gray)),
                Span::raw(" "),
                Span::raw(line_text),
            ]));
            first = false;
        } else {
            out.push(Line::from(vec![Span::raw("  "), Span::raw(line_text)]));
        }

        remaining = rest;
    }
}
