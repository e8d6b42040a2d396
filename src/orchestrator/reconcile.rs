//! Maps observed facts (operation results, log lines) to state patches.

use crate::backend::{BackupStatus, CompatibilityReport, OperationMessage};
use crate::model::{Action, EventCategory, LogEvent, ServerStatus, StatePatch};

/// Payload of a successful workflow action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionData {
    Compatibility(CompatibilityReport),
    Backup(BackupStatus),
    Done(OperationMessage),
}

pub(crate) fn patch_for_success(action: Action, data: &ActionData) -> StatePatch {
    let mut patch = StatePatch::operation(action.label());
    // Any answer at all means the backend is up.
    patch.server_status = Some(ServerStatus::Healthy);
    match (action, data) {
        (_, ActionData::Compatibility(report)) => {
            patch.system_architecture = Some(Some(report.system_architecture.clone()));
            patch.ffmpeg_architecture = Some(Some(report.ffmpeg_architecture.clone()));
            patch.is_compatible = Some(Some(report.is_compatible));
        }
        (_, ActionData::Backup(status)) => {
            patch.has_backup = Some(status.has_backup);
        }
        (Action::ForceArchitecture(arch), ActionData::Done(_)) => {
            patch.ffmpeg_architecture = Some(Some(arch.to_string()));
            patch.is_compatible = Some(None);
        }
        (Action::StopProcess, ActionData::Done(_)) => {
            patch.process_running = Some(false);
        }
        (Action::Fix | Action::Restore, ActionData::Done(_)) => {
            // Binaries changed; the follow-up check decides.
            patch.is_compatible = Some(None);
        }
        _ => {}
    }
    patch
}

pub(crate) fn success_message(action: Action, data: &ActionData) -> String {
    match data {
        ActionData::Compatibility(report) => format!(
            "System Architecture: {}, FFMPEG Architecture: {}, Compatibility Status: {}",
            report.system_architecture,
            report.ffmpeg_architecture,
            if report.is_compatible {
                "Compatible"
            } else {
                "Incompatible"
            }
        ),
        ActionData::Backup(status) if status.has_backup => "Original FFMPEG backup found".into(),
        ActionData::Backup(_) => "No original FFMPEG backup found".into(),
        ActionData::Done(OperationMessage { message: Some(m) }) if !m.trim().is_empty() => {
            m.clone()
        }
        ActionData::Done(_) => format!("{action} completed"),
    }
}

fn text_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let idx = line.find(marker)?;
    let value = line[idx + marker.len()..].trim();
    (!value.is_empty()).then_some(value)
}

pub(crate) fn patch_for_log(ev: &LogEvent) -> StatePatch {
    let mut patch = StatePatch::default();
    match ev.category {
        EventCategory::Error => patch.last_error = Some(Some(ev.raw_line.clone())),
        EventCategory::ProcessStarted => patch.process_running = Some(true),
        EventCategory::ProcessStopped => patch.process_running = Some(false),
        EventCategory::ArchDetected => {
            if let Some(arch) = text_after(&ev.raw_line, "FFMPEG Architecture:") {
                patch.ffmpeg_architecture = Some(Some(arch.to_string()));
            }
        }
        EventCategory::ShutdownInitiated => {
            patch.last_operation = Some(Some("shutdown-initiated".into()));
        }
        EventCategory::ServerStarted => patch.server_status = Some(ServerStatus::Healthy),
        EventCategory::BackupFound => patch.has_backup = Some(true),
        EventCategory::BackupMissing => patch.has_backup = Some(false),
        EventCategory::FixStarted => patch.last_operation = Some(Some("fix-started".into())),
        EventCategory::FixCompleted => {
            patch.last_operation = Some(Some("fix-completed".into()));
        }
        EventCategory::RestoreStarted => {
            patch.last_operation = Some(Some("restore-started".into()));
        }
        EventCategory::RestoreCompleted => {
            patch.last_operation = Some(Some("restore-completed".into()));
        }
        EventCategory::Uncategorized => {}
    }
    patch
}
