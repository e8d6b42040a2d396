use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub log_poll_interval: Duration,
    pub health_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub recheck_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub stall_after: Duration,
    pub monitor_logs: bool,
    pub user_agent: String,
}

/// Named phase of the maintenance workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    CheckCompatibility,
    FixCompatibility,
    Restore,
}

impl StepId {
    pub const ALL: [StepId; 3] = [
        StepId::CheckCompatibility,
        StepId::FixCompatibility,
        StepId::Restore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::CheckCompatibility => "check-compatibility",
            StepId::FixCompatibility => "fix-compatibility",
            StepId::Restore => "restore",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            StepId::CheckCompatibility => 0,
            StepId::FixCompatibility => 1,
            StepId::Restore => 2,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Complete,
    Error,
    Stalled,
}

impl StepStatus {
    /// Complete and error are only left through a new `begin`.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Active => "active",
            StepStatus::Complete => "complete",
            StepStatus::Error => "error",
            StepStatus::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub progress: u8,
    pub status: StepStatus,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            progress: 0,
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Healthy,
    Down,
}

/// Target architecture for the forced test mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x86_64" | "x86-64" | "amd64" => Ok(Architecture::X86_64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(format!("unsupported architecture: {other}")),
        }
    }
}

/// Process-wide snapshot. Only the orchestrator writes it, through `merge`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub process_running: bool,
    pub ffmpeg_architecture: Option<String>,
    pub system_architecture: Option<String>,
    pub is_compatible: Option<bool>,
    pub has_backup: bool,
    pub last_error: Option<String>,
    pub last_operation: Option<String>,
    pub server_status: ServerStatus,
}

/// A set of field writes applied atomically to `ApplicationState`.
///
/// `None` leaves a field alone. For nullable fields the inner option is the new value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub process_running: Option<bool>,
    pub ffmpeg_architecture: Option<Option<String>>,
    pub system_architecture: Option<Option<String>>,
    pub is_compatible: Option<Option<bool>>,
    pub has_backup: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub last_operation: Option<Option<String>>,
    pub server_status: Option<ServerStatus>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        *self == StatePatch::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn operation(name: impl Into<String>) -> Self {
        Self {
            last_operation: Some(Some(name.into())),
            ..Default::default()
        }
    }
}

impl ApplicationState {
    /// Last write wins per field.
    pub fn merge(&mut self, patch: StatePatch) {
        let StatePatch {
            process_running,
            ffmpeg_architecture,
            system_architecture,
            is_compatible,
            has_backup,
            last_error,
            last_operation,
            server_status,
        } = patch;
        if let Some(v) = process_running {
            self.process_running = v;
        }
        if let Some(v) = ffmpeg_architecture {
            self.ffmpeg_architecture = v;
        }
        if let Some(v) = system_architecture {
            self.system_architecture = v;
        }
        if let Some(v) = is_compatible {
            self.is_compatible = v;
        }
        if let Some(v) = has_backup {
            self.has_backup = v;
        }
        if let Some(v) = last_error {
            self.last_error = v;
        }
        if let Some(v) = last_operation {
            self.last_operation = v;
        }
        if let Some(v) = server_status {
            self.server_status = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    Error,
    ProcessStarted,
    ProcessStopped,
    ArchDetected,
    ShutdownInitiated,
    ServerStarted,
    BackupFound,
    BackupMissing,
    FixStarted,
    FixCompleted,
    RestoreStarted,
    RestoreCompleted,
    Uncategorized,
}

/// One classified line from the backend log. Lives for a single reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: String,
    pub raw_line: String,
    pub category: EventCategory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollCursor {
    pub last_seen_timestamp: Option<String>,
}

/// User-triggered workflow action. Only one may be in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Check,
    Fix,
    BackupCheck,
    Restore,
    ForceArchitecture(Architecture),
    StopProcess,
}

impl Action {
    /// Step driven by this action, if it has one.
    pub fn step(self) -> Option<StepId> {
        match self {
            Action::Check => Some(StepId::CheckCompatibility),
            Action::Fix => Some(StepId::FixCompatibility),
            Action::Restore => Some(StepId::Restore),
            Action::BackupCheck | Action::ForceArchitecture(_) | Action::StopProcess => None,
        }
    }

    /// Initial progress on `begin`. The check is pre-bumped so the bar moves immediately.
    pub fn seed_progress(self) -> u8 {
        match self {
            Action::Check => 10,
            _ => 0,
        }
    }

    /// Progress recorded once the backend has answered, before the answer is applied.
    pub fn response_progress(self) -> Option<u8> {
        match self {
            Action::Check => Some(50),
            _ => None,
        }
    }

    pub fn label(self) -> String {
        match self {
            Action::Check => "check-compatibility".into(),
            Action::Fix => "fix-compatibility".into(),
            Action::BackupCheck => "check-backup".into(),
            Action::Restore => "restore".into(),
            Action::ForceArchitecture(arch) => format!("force-architecture:{arch}"),
            Action::StopProcess => "stop-process".into(),
        }
    }

    pub fn started_message(self) -> String {
        match self {
            Action::Check => "Checking FFMPEG compatibility...".into(),
            Action::Fix => "Fixing FFMPEG Compatibility...".into(),
            Action::BackupCheck => "Checking for FFMPEG backup...".into(),
            Action::Restore => "Restoring original FFMPEG binaries...".into(),
            Action::ForceArchitecture(arch) => format!("Forcing {arch} architecture for testing..."),
            Action::StopProcess => "Stopping process...".into(),
        }
    }

    /// Shown when the backend gives no message of its own.
    pub fn fallback_error(self) -> &'static str {
        match self {
            Action::Check => "Failed to check compatibility",
            Action::Fix => "An error occurred while fixing FFMPEG compatibility",
            Action::BackupCheck => "An error occurred while checking for backup",
            Action::Restore => "An error occurred while restoring FFMPEG binaries",
            Action::ForceArchitecture(_) => "An error occurred while forcing architecture",
            Action::StopProcess => "Failed to stop process",
        }
    }

    /// Successful fix, restore and force all change the binaries, so the check is re-run.
    pub fn triggers_recheck(self) -> bool {
        matches!(
            self,
            Action::Fix | Action::Restore | Action::ForceArchitecture(_)
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Stages reported by the shutdown sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStage {
    Stopping,
    ProcessStopped,
    ShutdownRequested { acknowledged: bool },
    HealthProbe { attempt: u32, server_up: bool },
}

impl ShutdownStage {
    pub fn to_message(&self) -> String {
        match self {
            ShutdownStage::Stopping => "Stopping process...".into(),
            ShutdownStage::ProcessStopped => "Process stopped successfully".into(),
            ShutdownStage::ShutdownRequested { acknowledged: true } => {
                "Server shutdown initiated".into()
            }
            ShutdownStage::ShutdownRequested { acknowledged: false } => {
                "Server shutdown requested (no reply, assuming accepted)".into()
            }
            ShutdownStage::HealthProbe {
                attempt,
                server_up: true,
            } => format!("Health check {attempt}: server still up"),
            ShutdownStage::HealthProbe {
                attempt,
                server_up: false,
            } => format!("Health check {attempt}: server is down"),
        }
    }
}

/// How the health loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownOutcome {
    /// A health probe failed, meaning the server is gone.
    Confirmed { attempts: u32 },
    /// The server kept answering until the attempts ran out.
    Assumed { attempts: u32 },
}

impl ShutdownOutcome {
    pub fn attempts(self) -> u32 {
        match self {
            ShutdownOutcome::Confirmed { attempts } | ShutdownOutcome::Assumed { attempts } => {
                attempts
            }
        }
    }
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    PathAccepted { path: String },
    DefaultPath { path: String },
    Candidates { paths: Vec<String> },
    StaleResult { action: Action },
    LogFetchFailed { reason: String },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::PathAccepted { path } => format!("Selected Emby Server path: {path}"),
            InfoEvent::DefaultPath { path } => format!("Found default Emby Server path: {path}"),
            InfoEvent::Candidates { paths } if paths.is_empty() => {
                "No Emby Server installations detected".into()
            }
            InfoEvent::Candidates { paths } => {
                format!("Detected Emby Server installations: {}", paths.join(", "))
            }
            InfoEvent::StaleResult { action } => {
                format!("Discarded late result of {action}")
            }
            InfoEvent::LogFetchFailed { reason } => format!("Error checking logs: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerEvent {
    Info(InfoEvent),
    ActionStarted { action: Action },
    ActionSucceeded { action: Action, message: String },
    ActionFailed { action: Action, message: String },
    Log(LogEvent),
    Shutdown(ShutdownStage),
    ShutdownAborted { message: String },
    ShutdownCompleted { outcome: ShutdownOutcome },
}

impl ControllerEvent {
    pub fn to_message(&self) -> String {
        match self {
            ControllerEvent::Info(info) => info.to_message(),
            ControllerEvent::ActionStarted { action } => action.started_message(),
            ControllerEvent::ActionSucceeded { message, .. } => message.clone(),
            ControllerEvent::ActionFailed { message, .. } => format!("Error: {message}"),
            ControllerEvent::Log(ev) => ev.raw_line.clone(),
            ControllerEvent::Shutdown(stage) => stage.to_message(),
            ControllerEvent::ShutdownAborted { message } => {
                format!("Error during shutdown: {message}")
            }
            ControllerEvent::ShutdownCompleted { outcome } => match outcome {
                ShutdownOutcome::Confirmed { attempts } => {
                    format!("Server is down after {attempts} health check(s)")
                }
                ShutdownOutcome::Assumed { attempts } => {
                    format!("Server still answering after {attempts} health checks, giving up")
                }
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ControllerEvent::ActionFailed { .. }
                | ControllerEvent::ShutdownAborted { .. }
                | ControllerEvent::Info(InfoEvent::LogFetchFailed { .. })
        ) || matches!(self, ControllerEvent::Log(ev) if ev.category == EventCategory::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_last_write_wins_per_field() {
        let mut state = ApplicationState {
            last_error: Some("old".into()),
            has_backup: true,
            ..Default::default()
        };
        state.merge(StatePatch {
            process_running: Some(true),
            last_error: Some(None),
            ..Default::default()
        });
        assert!(state.process_running);
        assert!(state.has_backup);
        assert_eq!(state.last_error, None);

        state.merge(StatePatch::error("boom"));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(state.process_running);
    }

    #[test]
    fn architecture_parses_common_aliases() {
        assert_eq!("aarch64".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert_eq!("x86_64".parse::<Architecture>(), Ok(Architecture::X86_64));
        assert!("mips".parse::<Architecture>().is_err());
    }

    #[test]
    fn snapshot_serializes_in_camel_case() {
        let state = ApplicationState {
            server_status: ServerStatus::Healthy,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["serverStatus"], "healthy");
        assert_eq!(json["processRunning"], false);
    }
}
