//! Text summary builder for CLI output.
//!
//! Formats a [`Snapshot`] into human-readable lines for text mode.

use crate::model::{ServerStatus, StepId};
use crate::orchestrator::{Activity, Snapshot};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn or_dash(v: Option<&str>) -> &str {
    v.unwrap_or("-")
}

fn step_title(step: StepId) -> &'static str {
    match step {
        StepId::CheckCompatibility => "Check compatibility",
        StepId::FixCompatibility => "Fix compatibility",
        StepId::Restore => "Restore original",
    }
}

pub(crate) fn build_text_summary(snap: &Snapshot) -> TextSummary {
    let state = &snap.state;
    let mut lines = Vec::new();

    lines.push(format!(
        "Emby Server path: {}",
        or_dash(snap.selected_path.as_deref())
    ));
    lines.push(format!(
        "System architecture: {}",
        or_dash(state.system_architecture.as_deref())
    ));
    lines.push(format!(
        "FFMPEG architecture: {}",
        or_dash(state.ffmpeg_architecture.as_deref())
    ));
    let compat = match state.is_compatible {
        Some(true) => "Compatible",
        Some(false) => "Incompatible",
        None => "Unknown",
    };
    lines.push(format!("Compatibility: {compat}"));
    lines.push(format!(
        "Original backup: {}",
        if state.has_backup { "present" } else { "none" }
    ));
    lines.push(format!(
        "Process: {}",
        if state.process_running {
            "running"
        } else {
            "stopped"
        }
    ));
    let server = match state.server_status {
        ServerStatus::Unknown => "unknown",
        ServerStatus::Healthy => "up",
        ServerStatus::Down => "down",
    };
    lines.push(format!("Server: {server}"));

    for (step, st) in snap.steps.iter() {
        lines.push(format!(
            "  {:<20} {:>3}% {}",
            step_title(step),
            st.progress,
            st.status.as_str()
        ));
    }

    if let Activity::Busy { action, .. } = snap.activity {
        lines.push(format!("In progress: {action}"));
    }
    if let Some(op) = state.last_operation.as_deref() {
        lines.push(format!("Last operation: {op}"));
    }
    if let Some(err) = state.last_error.as_deref() {
        lines.push(format!("Last error: {err}"));
    }

    TextSummary { lines }
}
