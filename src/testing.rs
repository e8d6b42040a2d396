//! Scripted backend used by unit tests.

use crate::backend::{BackupStatus, CompatibilityReport, HealthStatus, MaintenanceApi, OperationMessage};
use crate::error::ApiError;
use crate::model::Architecture;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

type Reply<T> = Result<T, ApiError>;

pub(crate) fn network_error(endpoint: &'static str) -> ApiError {
    ApiError::Network {
        endpoint,
        reason: "connection refused".into(),
    }
}

pub(crate) fn protocol_error(endpoint: &'static str, message: &str) -> ApiError {
    ApiError::Protocol {
        endpoint,
        message: Some(message.into()),
    }
}

pub(crate) fn healthy() -> HealthStatus {
    HealthStatus {
        status: "healthy".into(),
        timestamp: None,
    }
}

pub(crate) fn report(system: &str, ffmpeg: &str) -> CompatibilityReport {
    CompatibilityReport {
        system_architecture: system.into(),
        ffmpeg_architecture: ffmpeg.into(),
        is_compatible: system == ffmpeg,
        message: None,
    }
}

pub(crate) fn said(message: &str) -> OperationMessage {
    OperationMessage {
        message: Some(message.into()),
    }
}

#[derive(Default)]
struct Script {
    select: VecDeque<Reply<OperationMessage>>,
    check: VecDeque<Reply<CompatibilityReport>>,
    fix: VecDeque<Reply<OperationMessage>>,
    backup: VecDeque<Reply<BackupStatus>>,
    restore: VecDeque<Reply<OperationMessage>>,
    stop: VecDeque<Reply<OperationMessage>>,
    shutdown: VecDeque<Reply<()>>,
    health: VecDeque<Reply<HealthStatus>>,
    logs: VecDeque<Reply<String>>,
    candidates: VecDeque<Reply<Vec<String>>>,
    force: VecDeque<Reply<OperationMessage>>,
    default_path: VecDeque<Reply<Option<String>>>,
}

/// Pops one scripted reply per call; falls back to a benign default when the queue is empty.
/// An empty health queue means the server is gone.
#[derive(Default)]
pub(crate) struct FakeApi {
    script: Mutex<Script>,
    calls: Mutex<HashMap<&'static str, usize>>,
    paths: Mutex<Vec<String>>,
    /// When set, compatibility checks wait for a `release_check` before answering.
    gate_checks: Mutex<bool>,
    gate: Notify,
}

macro_rules! pusher {
    ($name:ident, $field:ident, $ty:ty) => {
        pub(crate) fn $name(&self, reply: Reply<$ty>) {
            self.script.lock().unwrap().$field.push_back(reply);
        }
    };
}

impl FakeApi {
    pusher!(push_select, select, OperationMessage);
    pusher!(push_check, check, CompatibilityReport);
    pusher!(push_fix, fix, OperationMessage);
    pusher!(push_backup, backup, BackupStatus);
    pusher!(push_restore, restore, OperationMessage);
    pusher!(push_stop, stop, OperationMessage);
    pusher!(push_shutdown, shutdown, ());
    pusher!(push_health, health, HealthStatus);
    pusher!(push_logs, logs, String);
    pusher!(push_candidates, candidates, Vec<String>);
    pusher!(push_force, force, OperationMessage);
    pusher!(push_default_path, default_path, Option<String>);

    pub(crate) fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Paths received by path-taking operations, in call order.
    pub(crate) fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub(crate) fn hold_checks(&self) {
        *self.gate_checks.lock().unwrap() = true;
    }

    pub(crate) fn release_check(&self) {
        self.gate.notify_one();
    }

    fn record(&self, op: &'static str, path: Option<&str>) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        if let Some(p) = path {
            self.paths.lock().unwrap().push(p.to_string());
        }
    }

    fn pop<T>(&self, take: impl FnOnce(&mut Script) -> Option<Reply<T>>, fallback: impl FnOnce() -> Reply<T>) -> Reply<T> {
        let next = take(&mut self.script.lock().unwrap());
        next.unwrap_or_else(fallback)
    }
}

#[async_trait]
impl MaintenanceApi for FakeApi {
    async fn select_path(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.record("select_path", Some(path));
        self.pop(|s| s.select.pop_front(), || Ok(said("Path selected successfully")))
    }

    async fn check_compatibility(&self, path: &str) -> Result<CompatibilityReport, ApiError> {
        self.record("check_compatibility", Some(path));
        let gated = *self.gate_checks.lock().unwrap();
        if gated {
            self.gate.notified().await;
        }
        self.pop(|s| s.check.pop_front(), || Ok(report("arm64", "arm64")))
    }

    async fn fix_incompatibility(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.record("fix_incompatibility", Some(path));
        self.pop(
            |s| s.fix.pop_front(),
            || Ok(said("FFMPEG compatibility fixed successfully")),
        )
    }

    async fn check_backup_exists(&self, path: &str) -> Result<BackupStatus, ApiError> {
        self.record("check_backup_exists", Some(path));
        self.pop(
            |s| s.backup.pop_front(),
            || {
                Ok(BackupStatus {
                    has_backup: false,
                    message: None,
                })
            },
        )
    }

    async fn restore_backup(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.record("restore_backup", Some(path));
        self.pop(
            |s| s.restore.pop_front(),
            || Ok(said("Original FFMPEG binaries restored successfully")),
        )
    }

    async fn stop_process(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.record("stop_process", Some(path));
        self.pop(
            |s| s.stop.pop_front(),
            || Ok(said("Process stopped and initial state restored successfully")),
        )
    }

    async fn request_shutdown(&self) -> Result<(), ApiError> {
        self.record("request_shutdown", None);
        self.pop(|s| s.shutdown.pop_front(), || Ok(()))
    }

    async fn check_health(&self) -> Result<HealthStatus, ApiError> {
        self.record("check_health", None);
        self.pop(|s| s.health.pop_front(), || Err(network_error("/health")))
    }

    async fn fetch_log_tail(&self) -> Result<String, ApiError> {
        self.record("fetch_log_tail", None);
        self.pop(|s| s.logs.pop_front(), || Ok(String::new()))
    }

    async fn list_candidate_paths(&self) -> Result<Vec<String>, ApiError> {
        self.record("list_candidate_paths", None);
        self.pop(|s| s.candidates.pop_front(), || Ok(Vec::new()))
    }

    async fn force_architecture(
        &self,
        path: &str,
        arch: Architecture,
    ) -> Result<OperationMessage, ApiError> {
        self.record("force_architecture", Some(path));
        self.pop(
            |s| s.force.pop_front(),
            || Ok(said(&format!("Success: forced {arch}"))),
        )
    }

    async fn default_path(&self) -> Result<Option<String>, ApiError> {
        self.record("default_path", None);
        self.pop(|s| s.default_path.pop_front(), || Ok(None))
    }

    async fn browse_path(&self) -> Result<Option<String>, ApiError> {
        self.record("browse_path", None);
        Ok(None)
    }

    async fn download_log(&self) -> Result<Bytes, ApiError> {
        self.record("download_log", None);
        Ok(Bytes::from_static(b"10:00:00 Server started\n"))
    }
}
