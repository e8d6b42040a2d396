//! The single writer of application state and the step table.
//!
//! Nothing here awaits. Callers start an action with [`Orchestrator::begin`], run the
//! remote call wherever they like, then hand the result to [`Orchestrator::settle`].
//! Every new action, path change or reset bumps a generation counter; a result carrying
//! an older generation is discarded instead of overwriting newer state.

use super::reconcile::{patch_for_log, patch_for_success, success_message, ActionData};
use crate::backend::normalize_path;
use crate::error::{ApiError, OrchestratorError, StepError};
use crate::model::{
    Action, ApplicationState, LogEvent, ServerStatus, ShutdownOutcome, StatePatch, StepId,
};
use crate::steps::StepTable;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Activity {
    Idle,
    Busy { action: Action, generation: u64 },
}

/// Handle for one in-flight action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub action: Action,
    pub generation: u64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// A newer action, path or reset superseded this result.
    Stale { action: Action },
    Succeeded {
        action: Action,
        message: String,
        recheck: bool,
    },
    Failed {
        action: Action,
        message: String,
        error: ApiError,
    },
}

/// Read-only copy handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub state: ApplicationState,
    pub steps: StepTable,
    pub activity: Activity,
    pub operations_enabled: bool,
    pub selected_path: Option<String>,
    pub candidates: Vec<String>,
    pub generation: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Orchestrator::new().snapshot()
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    state: ApplicationState,
    steps: StepTable,
    activity: Activity,
    operations_enabled: bool,
    selected_path: Option<String>,
    candidates: Vec<String>,
    generation: u64,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: ApplicationState::default(),
            steps: StepTable::default(),
            activity: Activity::Idle,
            operations_enabled: true,
            selected_path: None,
            candidates: Vec::new(),
            generation: 0,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            steps: self.steps,
            activity: self.activity,
            operations_enabled: self.operations_enabled,
            selected_path: self.selected_path.clone(),
            candidates: self.candidates.clone(),
            generation: self.generation,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ApplicationState {
        &self.state
    }

    #[cfg(test)]
    pub fn steps(&self) -> &StepTable {
        &self.steps
    }

    #[cfg(test)]
    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn selected_path(&self) -> Option<&str> {
        self.selected_path.as_deref()
    }

    pub fn is_idle(&self) -> bool {
        self.activity == Activity::Idle && self.operations_enabled
    }

    /// The only way application state changes.
    pub fn merge(&mut self, patch: StatePatch) {
        if patch.is_empty() {
            return;
        }
        debug!(?patch, "merge");
        self.state.merge(patch);
    }

    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn set_candidates(&mut self, paths: Vec<String>) {
        self.candidates = paths;
    }

    /// Path accepted by the backend. Anything in flight for the old path becomes stale.
    pub fn accept_path(&mut self, path: &str) {
        let path = normalize_path(path);
        info!(%path, "path accepted");
        self.selected_path = Some(path);
        self.bump();
        self.activity = Activity::Idle;
        self.steps.reset_all();
        self.merge(StatePatch {
            ffmpeg_architecture: Some(None),
            is_compatible: Some(None),
            has_backup: Some(false),
            ..Default::default()
        });
    }

    /// Abandons whatever is in flight and returns every step to pending.
    pub fn reset(&mut self) {
        self.bump();
        self.activity = Activity::Idle;
        self.steps.reset_all();
    }

    pub fn stall(&mut self, step: StepId) -> Result<(), StepError> {
        self.steps.stall(step)
    }

    /// Refuses once a shutdown sequence has started.
    pub fn ensure_operational(&self) -> Result<(), OrchestratorError> {
        if self.operations_enabled {
            Ok(())
        } else {
            Err(OrchestratorError::ShuttingDown)
        }
    }

    pub fn begin(&mut self, action: Action) -> Result<Ticket, OrchestratorError> {
        self.ensure_operational()?;
        if let Activity::Busy { action: current, .. } = self.activity {
            return Err(OrchestratorError::Busy { current });
        }
        let path = self
            .selected_path
            .clone()
            .ok_or(OrchestratorError::NoPathSelected)?;
        if action == Action::Fix && self.state.is_compatible == Some(true) {
            return Err(OrchestratorError::AlreadyCompatible);
        }
        if let Some(step) = action.step() {
            self.steps.begin(step, action.seed_progress())?;
        }
        let generation = self.bump();
        self.activity = Activity::Busy { action, generation };
        info!(%action, generation, "action started");
        Ok(Ticket {
            action,
            generation,
            path,
        })
    }

    pub fn settle(
        &mut self,
        ticket: &Ticket,
        result: Result<ActionData, ApiError>,
    ) -> Settlement {
        let action = ticket.action;
        if ticket.generation != self.generation {
            info!(%action, generation = ticket.generation, current = self.generation, "discarding stale result");
            return Settlement::Stale { action };
        }

        if let (Some(step), Some(progress)) = (action.step(), action.response_progress()) {
            let answered = match &result {
                Ok(_) => true,
                Err(e) => e.reached_backend(),
            };
            if answered {
                if let Err(e) = self.steps.advance(step, progress) {
                    debug!(error = %e, "progress not recorded");
                }
            }
        }

        let settlement = match result {
            Ok(data) => {
                if let Some(step) = action.step() {
                    if let Err(e) = self.steps.complete(step) {
                        warn!(error = %e, "step already settled");
                    }
                }
                self.merge(patch_for_success(action, &data));
                Settlement::Succeeded {
                    action,
                    message: success_message(action, &data),
                    recheck: action.triggers_recheck(),
                }
            }
            Err(error) => {
                if let Some(step) = action.step() {
                    if let Err(e) = self.steps.fail(step) {
                        warn!(error = %e, "step already settled");
                    }
                }
                let message = error.user_message(action.fallback_error());
                warn!(%action, endpoint = error.endpoint(), %error, "action failed");
                self.merge(StatePatch::error(message.clone()));
                Settlement::Failed {
                    action,
                    message,
                    error,
                }
            }
        };

        self.activity = Activity::Idle;
        self.steps.release_unsettled();
        settlement
    }

    /// Applies a classified log line. Returns whether anything changed.
    pub fn reconcile(&mut self, ev: &LogEvent) -> bool {
        let patch = patch_for_log(ev);
        if patch.is_empty() {
            return false;
        }
        let before = self.state.clone();
        self.merge(patch);
        before != self.state
    }

    /// Disables every workflow action ahead of the shutdown sequence.
    pub fn seal_for_shutdown(&mut self) -> Result<String, OrchestratorError> {
        self.ensure_operational()?;
        let path = self
            .selected_path
            .clone()
            .ok_or(OrchestratorError::NoPathSelected)?;
        self.operations_enabled = false;
        Ok(path)
    }

    /// The sequence failed: surface the error and hand control back.
    pub fn abort_shutdown(&mut self, error: &OrchestratorError) -> String {
        let message = error.user_message();
        self.operations_enabled = true;
        self.merge(StatePatch::error(message.clone()));
        message
    }

    pub fn finish_shutdown(&mut self, outcome: ShutdownOutcome) {
        info!(?outcome, attempts = outcome.attempts(), "shutdown sequence finished");
        self.merge(StatePatch {
            process_running: Some(false),
            server_status: Some(ServerStatus::Down),
            last_operation: Some(Some("shutdown".into())),
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackupStatus, OperationMessage};
    use crate::engine::LogTail;
    use crate::model::{Architecture, StepStatus};
    use crate::testing::{network_error, protocol_error, report};

    fn ready() -> Orchestrator {
        let mut orch = Orchestrator::new();
        orch.accept_path("/Applications/EmbyServer.app");
        orch
    }

    #[test]
    fn actions_need_a_selected_path() {
        let mut orch = Orchestrator::new();
        assert_eq!(
            orch.begin(Action::Check),
            Err(OrchestratorError::NoPathSelected)
        );
        assert_eq!(orch.activity(), Activity::Idle);
    }

    #[test]
    fn only_one_action_in_flight() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        assert_eq!(
            orch.begin(Action::BackupCheck),
            Err(OrchestratorError::Busy {
                current: Action::Check
            })
        );
        assert_eq!(
            orch.steps().get(StepId::CheckCompatibility),
            crate::model::StepState {
                progress: 10,
                status: StepStatus::Active
            }
        );
        orch.settle(&ticket, Ok(ActionData::Compatibility(report("arm64", "arm64"))));
        assert!(orch.is_idle());
    }

    #[test]
    fn incompatible_check_leaves_fix_eligible_and_restore_untouched() {
        let mut orch = ready();
        let restore_before = orch.steps().get(StepId::Restore);
        let ticket = orch.begin(Action::Check).unwrap();

        let settled = orch.settle(
            &ticket,
            Ok(ActionData::Compatibility(report("arm64", "x86_64"))),
        );

        assert!(matches!(settled, Settlement::Succeeded { recheck: false, .. }));
        assert_eq!(orch.state().is_compatible, Some(false));
        assert_eq!(orch.state().system_architecture.as_deref(), Some("arm64"));
        assert_eq!(orch.state().ffmpeg_architecture.as_deref(), Some("x86_64"));
        assert_eq!(
            orch.steps().get(StepId::CheckCompatibility).status,
            StepStatus::Complete
        );
        assert!(orch.steps().can_begin(StepId::FixCompatibility));
        assert_eq!(orch.steps().get(StepId::Restore), restore_before);

        let fix = orch.begin(Action::Fix).unwrap();
        assert_eq!(fix.action, Action::Fix);
    }

    #[test]
    fn fix_is_refused_when_already_compatible() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        orch.settle(&ticket, Ok(ActionData::Compatibility(report("arm64", "arm64"))));
        assert_eq!(
            orch.begin(Action::Fix),
            Err(OrchestratorError::AlreadyCompatible)
        );
    }

    #[test]
    fn failure_marks_step_error_and_records_message() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Fix).unwrap();

        let settled = orch.settle(
            &ticket,
            Err(protocol_error("/api/fix-ffmpeg", "Emby Server path does not exist")),
        );

        assert!(matches!(settled, Settlement::Failed { .. }));
        assert_eq!(
            orch.steps().get(StepId::FixCompatibility),
            crate::model::StepState {
                progress: 0,
                status: StepStatus::Error
            }
        );
        assert_eq!(
            orch.state().last_error.as_deref(),
            Some("Emby Server path does not exist")
        );
        assert!(orch.is_idle());
        // Still usable after a failure.
        assert!(orch.begin(Action::Fix).is_ok());
    }

    #[test]
    fn failed_check_freezes_where_the_answer_left_it() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        orch.settle(&ticket, Err(protocol_error("/api/check-compatibility", "bad path")));
        assert_eq!(orch.steps().get(StepId::CheckCompatibility).progress, 50);

        let ticket = orch.begin(Action::Check).unwrap();
        orch.settle(&ticket, Err(network_error("/api/check-compatibility")));
        assert_eq!(orch.steps().get(StepId::CheckCompatibility).progress, 10);
    }

    #[test]
    fn failure_without_message_uses_fallback() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Restore).unwrap();
        orch.settle(
            &ticket,
            Err(ApiError::Protocol {
                endpoint: "/api/restore-ffmpeg",
                message: None,
            }),
        );
        assert_eq!(
            orch.state().last_error.as_deref(),
            Some(Action::Restore.fallback_error())
        );
    }

    #[test]
    fn successful_fix_asks_for_a_recheck() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Fix).unwrap();
        let settled = orch.settle(&ticket, Ok(ActionData::Done(OperationMessage::default())));
        assert!(matches!(settled, Settlement::Succeeded { recheck: true, .. }));
    }

    #[test]
    fn result_after_path_change_is_stale() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        orch.accept_path("/Applications/Emby Server.app");

        let settled = orch.settle(
            &ticket,
            Ok(ActionData::Compatibility(report("arm64", "x86_64"))),
        );

        assert_eq!(
            settled,
            Settlement::Stale {
                action: Action::Check
            }
        );
        assert_eq!(orch.state().ffmpeg_architecture, None);
        assert_eq!(
            orch.steps().get(StepId::CheckCompatibility).status,
            StepStatus::Pending
        );
    }

    #[test]
    fn stale_result_does_not_clobber_newer_action() {
        let mut orch = ready();
        let old = orch.begin(Action::BackupCheck).unwrap();
        orch.reset();
        let new = orch.begin(Action::Check).unwrap();

        let settled = orch.settle(
            &old,
            Ok(ActionData::Backup(BackupStatus {
                has_backup: true,
                message: None,
            })),
        );

        assert!(matches!(settled, Settlement::Stale { .. }));
        assert!(!orch.state().has_backup);
        assert_eq!(
            orch.activity(),
            Activity::Busy {
                action: Action::Check,
                generation: new.generation
            }
        );
    }

    #[test]
    fn settlement_resets_steps_left_active() {
        let mut orch = ready();
        let check = orch.begin(Action::Check).unwrap();
        orch.settle(&check, Ok(ActionData::Compatibility(report("arm64", "x86_64"))));
        let stop = orch.begin(Action::StopProcess).unwrap();
        orch.settle(&stop, Err(network_error("/api/stop-process")));

        assert_eq!(
            orch.steps().get(StepId::CheckCompatibility).status,
            StepStatus::Complete
        );
        assert_eq!(
            orch.steps().get(StepId::FixCompatibility).status,
            StepStatus::Pending
        );
    }

    #[test]
    fn stalled_step_is_released_on_settlement() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        orch.stall(StepId::CheckCompatibility).unwrap();
        orch.settle(&ticket, Err(network_error("/api/check-compatibility")));
        assert_eq!(
            orch.steps().get(StepId::CheckCompatibility).status,
            StepStatus::Error
        );
    }

    #[test]
    fn log_lines_drive_process_running() {
        let mut orch = ready();
        let mut tail = LogTail::default();
        let full = "10:00:00 Process is currently running\n10:00:05 Process stopped successfully";

        let first = tail.ingest("10:00:00 Process is currently running").unwrap();
        assert!(orch.reconcile(&first));
        assert!(orch.state().process_running);

        let second = tail.ingest(full).unwrap();
        assert!(orch.reconcile(&second));
        assert!(!orch.state().process_running);
        assert_eq!(
            tail.cursor().last_seen_timestamp.as_deref(),
            Some("10:00:05")
        );
    }

    #[test]
    fn shutdown_disables_actions_until_aborted() {
        let mut orch = ready();
        let path = orch.seal_for_shutdown().unwrap();
        assert_eq!(path, "/Applications/EmbyServer.app");
        assert_eq!(orch.begin(Action::Check), Err(OrchestratorError::ShuttingDown));
        assert_eq!(orch.seal_for_shutdown(), Err(OrchestratorError::ShuttingDown));

        let msg = orch.abort_shutdown(&OrchestratorError::SequenceAborted(protocol_error(
            "/api/stop-process",
            "busy",
        )));
        assert_eq!(msg, "busy");
        assert!(orch.begin(Action::Check).is_ok());
    }

    #[test]
    fn shutdown_is_allowed_while_an_action_is_in_flight() {
        let mut orch = ready();
        let ticket = orch.begin(Action::Check).unwrap();
        assert!(orch.seal_for_shutdown().is_ok());
        // The in-flight result still lands.
        let settled = orch.settle(&ticket, Ok(ActionData::Compatibility(report("arm64", "arm64"))));
        assert!(matches!(settled, Settlement::Succeeded { .. }));
        orch.finish_shutdown(ShutdownOutcome::Confirmed { attempts: 2 });
        assert_eq!(orch.state().server_status, ServerStatus::Down);
    }

    #[test]
    fn forced_architecture_needs_no_step() {
        let mut orch = ready();
        let ticket = orch
            .begin(Action::ForceArchitecture(Architecture::X86_64))
            .unwrap();
        assert_eq!(orch.steps().active(), None);
        let settled = orch.settle(&ticket, Ok(ActionData::Done(OperationMessage::default())));
        assert!(matches!(settled, Settlement::Succeeded { recheck: true, .. }));
    }
}
