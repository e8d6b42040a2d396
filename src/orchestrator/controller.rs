//! Command loop around the [`Orchestrator`].
//!
//! Remote calls run as spawned tasks and report back over a channel, so the loop is the
//! only place state changes. Consumers see a [`Snapshot`] on a watch channel and a stream
//! of [`ControllerEvent`]s.

use super::reconcile::ActionData;
use super::state::{Orchestrator, Settlement, Snapshot, Ticket};
use crate::backend::{MaintenanceApi, OperationMessage};
use crate::engine::{run_shutdown_sequence, LogMonitor, PollerEvent, ShutdownPolicy};
use crate::error::{ApiError, OrchestratorError};
use crate::model::{
    Action, ControllerEvent, InfoEvent, RunConfig, ShutdownOutcome, StatePatch, StepId,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands emitted by UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Ask the backend for its default path and known installations.
    Discover,
    /// Known installations first, the native folder picker when there are none.
    Browse,
    SelectPath(String),
    Run(Action),
    Reset,
    Stall(StepId),
    StartLogMonitoring,
    StopLogMonitoring,
    Shutdown,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControllerExit {
    Quit,
    ShutdownComplete(ShutdownOutcome),
}

/// Results of spawned work, delivered back to the loop.
enum Completion {
    Action {
        ticket: Ticket,
        result: Result<ActionData, ApiError>,
    },
    PathSelected {
        path: String,
        result: Result<OperationMessage, ApiError>,
    },
    Discovered {
        default: Result<Option<String>, ApiError>,
        candidates: Result<Vec<String>, ApiError>,
    },
    Browsed {
        candidates: Vec<String>,
        picked: Result<Option<String>, ApiError>,
    },
    Recheck {
        generation: u64,
    },
}

/// Runs one workflow action against the backend.
pub(crate) async fn execute(
    api: &dyn MaintenanceApi,
    action: Action,
    path: &str,
) -> Result<ActionData, ApiError> {
    Ok(match action {
        Action::Check => ActionData::Compatibility(api.check_compatibility(path).await?),
        Action::Fix => ActionData::Done(api.fix_incompatibility(path).await?),
        Action::BackupCheck => ActionData::Backup(api.check_backup_exists(path).await?),
        Action::Restore => ActionData::Done(api.restore_backup(path).await?),
        Action::ForceArchitecture(arch) => {
            ActionData::Done(api.force_architecture(path, arch).await?)
        }
        Action::StopProcess => ActionData::Done(api.stop_process(path).await?),
    })
}

/// Begin, execute and settle in one go. Used by the one-shot CLI runners.
pub(crate) async fn perform(
    orch: &mut Orchestrator,
    api: &dyn MaintenanceApi,
    action: Action,
) -> Result<Settlement, OrchestratorError> {
    let ticket = orch.begin(action)?;
    let result = execute(api, action, &ticket.path).await;
    Ok(orch.settle(&ticket, result))
}

struct Controller {
    api: Arc<dyn MaintenanceApi>,
    cfg: RunConfig,
    orch: Orchestrator,
    monitor: LogMonitor,
    snapshot_tx: watch::Sender<Snapshot>,
    event_tx: UnboundedSender<ControllerEvent>,
    done_tx: UnboundedSender<Completion>,
    poll_tx: UnboundedSender<PollerEvent>,
}

impl Controller {
    fn emit(&self, ev: ControllerEvent) {
        let _ = self.event_tx.send(ev);
    }

    fn info(&self, msg: impl Into<String>) {
        self.emit(ControllerEvent::Info(InfoEvent::Message(msg.into())));
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.orch.snapshot());
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let _ = done.send(fut.await);
        });
    }

    fn discover(&self) {
        let api = self.api.clone();
        self.spawn(async move {
            let default = api.default_path().await;
            let candidates = api.list_candidate_paths().await;
            Completion::Discovered {
                default,
                candidates,
            }
        });
    }

    fn browse(&self) {
        let api = self.api.clone();
        self.spawn(async move {
            let candidates = match api.list_candidate_paths().await {
                Ok(paths) => paths,
                Err(e) => {
                    debug!(error = %e, "listing installations failed, falling back to picker");
                    Vec::new()
                }
            };
            let picked = if candidates.is_empty() {
                api.browse_path().await
            } else {
                Ok(None)
            };
            Completion::Browsed { candidates, picked }
        });
    }

    fn select_path(&self, path: String) {
        if let Err(e) = self.orch.ensure_operational() {
            info!(%path, reason = %e, "path selection refused");
            self.info(e.to_string());
            return;
        }
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.select_path(&path).await;
            Completion::PathSelected { path, result }
        });
    }

    fn run(&mut self, action: Action) {
        match self.orch.begin(action) {
            Ok(ticket) => {
                self.emit(ControllerEvent::ActionStarted { action });
                let api = self.api.clone();
                self.spawn(async move {
                    let result = execute(api.as_ref(), ticket.action, &ticket.path).await;
                    Completion::Action { ticket, result }
                });
            }
            Err(e) => {
                info!(%action, reason = %e, "action refused");
                self.info(e.to_string());
            }
        }
    }

    fn schedule_recheck(&self) {
        let generation = self.orch.generation();
        let delay = self.cfg.recheck_delay;
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            Completion::Recheck { generation }
        });
    }

    fn start_shutdown(&mut self) -> Option<JoinHandle<Result<ShutdownOutcome, OrchestratorError>>> {
        let path = match self.orch.seal_for_shutdown() {
            Ok(path) => path,
            Err(e) => {
                self.info(e.to_string());
                return None;
            }
        };
        info!(%path, "starting shutdown sequence");
        let api = self.api.clone();
        let policy = ShutdownPolicy::from_config(&self.cfg);
        let events = self.event_tx.clone();
        Some(tokio::spawn(async move {
            run_shutdown_sequence(api.as_ref(), &path, policy, move |stage| {
                let _ = events.send(ControllerEvent::Shutdown(stage));
            })
            .await
        }))
    }

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Action { ticket, result } => match self.orch.settle(&ticket, result) {
                Settlement::Stale { action } => {
                    self.emit(ControllerEvent::Info(InfoEvent::StaleResult { action }));
                }
                Settlement::Succeeded {
                    action,
                    message,
                    recheck,
                } => {
                    self.emit(ControllerEvent::ActionSucceeded { action, message });
                    if recheck {
                        self.schedule_recheck();
                    }
                }
                Settlement::Failed {
                    action, message, ..
                } => {
                    self.emit(ControllerEvent::ActionFailed { action, message });
                }
            },
            Completion::PathSelected { path, result } => match result {
                Ok(_) if self.orch.ensure_operational().is_err() => {
                    info!(%path, "path accepted by the backend after shutdown started, ignoring");
                }
                Ok(_) => {
                    self.orch.accept_path(&path);
                    let accepted = self.orch.selected_path().unwrap_or(&path).to_string();
                    self.emit(ControllerEvent::Info(InfoEvent::PathAccepted {
                        path: accepted,
                    }));
                    self.run(Action::Check);
                }
                Err(e) => {
                    let message = e.user_message("Failed to select path");
                    warn!(%path, error = %e, "path rejected");
                    self.orch.merge(StatePatch::error(message.clone()));
                    self.info(format!("Error: {message}"));
                }
            },
            Completion::Discovered {
                default,
                candidates,
            } => {
                match candidates {
                    Ok(paths) => {
                        self.orch.set_candidates(paths.clone());
                        self.emit(ControllerEvent::Info(InfoEvent::Candidates { paths }));
                    }
                    Err(e) => warn!(error = %e, "listing installations failed"),
                }
                match default {
                    Ok(Some(path)) => {
                        self.emit(ControllerEvent::Info(InfoEvent::DefaultPath {
                            path: path.clone(),
                        }));
                        if self.orch.selected_path().is_none() {
                            self.select_path(path);
                        }
                    }
                    Ok(None) => debug!("backend has no default path"),
                    Err(e) => warn!(error = %e, "default path lookup failed"),
                }
            }
            Completion::Browsed { candidates, picked } => {
                if !candidates.is_empty() {
                    self.orch.set_candidates(candidates.clone());
                    self.emit(ControllerEvent::Info(InfoEvent::Candidates {
                        paths: candidates,
                    }));
                    return;
                }
                match picked {
                    Ok(Some(path)) => self.select_path(path),
                    Ok(None) => self.info("No folder selected"),
                    Err(e) => self.info(format!(
                        "Error: {}",
                        e.user_message("Failed to open folder browser")
                    )),
                }
            }
            Completion::Recheck { generation } => {
                if generation == self.orch.generation() && self.orch.is_idle() {
                    self.run(Action::Check);
                } else {
                    debug!(generation, "skipping re-check, state moved on");
                }
            }
        }
    }

    fn on_poll(&mut self, ev: PollerEvent) {
        if !self.monitor.is_current(&ev) {
            debug!(epoch = ev.epoch(), "dropping event from a replaced poller");
            return;
        }
        match ev {
            PollerEvent::Line { event, .. } => {
                self.orch.reconcile(&event);
                self.emit(ControllerEvent::Log(event));
            }
            PollerEvent::FetchFailed { reason, .. } => {
                self.emit(ControllerEvent::Info(InfoEvent::LogFetchFailed { reason }));
            }
        }
    }
}

/// Drive the orchestrator from UI commands until quit or a completed shutdown.
pub(crate) async fn run_controller(
    api: Arc<dyn MaintenanceApi>,
    cfg: RunConfig,
    snapshot_tx: watch::Sender<Snapshot>,
    event_tx: UnboundedSender<ControllerEvent>,
    mut cmd_rx: UnboundedReceiver<Command>,
) -> Result<ControllerExit> {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
    let (poll_tx, mut poll_rx) = mpsc::unbounded_channel::<PollerEvent>();
    let monitor = LogMonitor::new(api.clone(), cfg.log_poll_interval);
    let mut ctl = Controller {
        api,
        cfg,
        orch: Orchestrator::new(),
        monitor,
        snapshot_tx,
        event_tx,
        done_tx,
        poll_tx,
    };

    if ctl.cfg.monitor_logs {
        ctl.monitor.start(ctl.poll_tx.clone());
    }
    match ctl.cfg.path.clone() {
        Some(path) => ctl.select_path(path),
        None => ctl.discover(),
    }
    ctl.publish();

    let mut shutdown: Option<JoinHandle<Result<ShutdownOutcome, OrchestratorError>>> = None;
    let mut quit_pending = false;
    // A closed command channel is always ready; stop polling it once it reports `None`.
    let mut cmd_open = true;

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if cmd_open => {
                let closed = cmd.is_none();
                match cmd {
                    Some(Command::Discover) => ctl.discover(),
                    Some(Command::Browse) => ctl.browse(),
                    Some(Command::SelectPath(path)) => ctl.select_path(path),
                    Some(Command::Run(action)) => ctl.run(action),
                    Some(Command::Reset) => {
                        ctl.orch.reset();
                        ctl.info("Steps reset");
                    }
                    Some(Command::Stall(step)) => {
                        if let Err(e) = ctl.orch.stall(step) {
                            debug!(error = %e, "stall ignored");
                        }
                    }
                    Some(Command::StartLogMonitoring) => ctl.monitor.start(ctl.poll_tx.clone()),
                    Some(Command::StopLogMonitoring) => ctl.monitor.stop(),
                    Some(Command::Shutdown) => {
                        if shutdown.is_none() {
                            shutdown = ctl.start_shutdown();
                        }
                    }
                    Some(Command::Quit) | None => {
                        if closed {
                            cmd_open = false;
                        }
                        // The shutdown sequence cannot be cancelled; quit waits for it.
                        if shutdown.is_none() {
                            break Ok(ControllerExit::Quit);
                        }
                        if !quit_pending {
                            quit_pending = true;
                            ctl.info("Waiting for shutdown to finish…");
                        }
                    }
                }
            }
            Some(done) = done_rx.recv() => ctl.on_completion(done),
            Some(ev) = poll_rx.recv() => ctl.on_poll(ev),
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            finished = async {
                if let Some(h) = shutdown.as_mut() {
                    return h.await;
                }
                futures::future::pending().await
            } => {
                shutdown = None;
                match finished {
                    Ok(Ok(outcome)) => {
                        ctl.monitor.stop();
                        ctl.orch.finish_shutdown(outcome);
                        ctl.emit(ControllerEvent::ShutdownCompleted { outcome });
                        ctl.publish();
                        break Ok(ControllerExit::ShutdownComplete(outcome));
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "shutdown sequence failed");
                        let message = ctl.orch.abort_shutdown(&e);
                        ctl.emit(ControllerEvent::ShutdownAborted { message });
                        if quit_pending {
                            ctl.publish();
                            break Ok(ControllerExit::Quit);
                        }
                    }
                    Err(e) => {
                        ctl.publish();
                        break Err(anyhow::anyhow!("shutdown task failed: {e}"));
                    }
                }
            }
        }
        ctl.publish();
    };

    ctl.monitor.stop();
    res
}
