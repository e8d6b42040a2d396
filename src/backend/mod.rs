//! Typed access to the fixer backend.
//!
//! Every call returns the operation's payload or an [`ApiError`]; nothing here retries or
//! holds state beyond the HTTP client.

mod client;
mod envelope;

pub use client::BackendClient;

use crate::error::ApiError;
use crate::model::Architecture;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub system_architecture: String,
    pub ffmpeg_architecture: String,
    pub is_compatible: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub has_backup: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[async_trait]
pub trait MaintenanceApi: Send + Sync {
    async fn select_path(&self, path: &str) -> Result<OperationMessage, ApiError>;
    async fn check_compatibility(&self, path: &str) -> Result<CompatibilityReport, ApiError>;
    async fn fix_incompatibility(&self, path: &str) -> Result<OperationMessage, ApiError>;
    async fn check_backup_exists(&self, path: &str) -> Result<BackupStatus, ApiError>;
    async fn restore_backup(&self, path: &str) -> Result<OperationMessage, ApiError>;
    async fn stop_process(&self, path: &str) -> Result<OperationMessage, ApiError>;
    /// The backend may drop the connection before answering.
    async fn request_shutdown(&self) -> Result<(), ApiError>;
    async fn check_health(&self) -> Result<HealthStatus, ApiError>;
    /// Full log text, newline-delimited and chronological.
    async fn fetch_log_tail(&self) -> Result<String, ApiError>;
    async fn list_candidate_paths(&self) -> Result<Vec<String>, ApiError>;
    async fn force_architecture(
        &self,
        path: &str,
        arch: Architecture,
    ) -> Result<OperationMessage, ApiError>;
    async fn default_path(&self) -> Result<Option<String>, ApiError>;
    /// Opens the backend's native folder picker.
    async fn browse_path(&self) -> Result<Option<String>, ApiError>;
    /// Raw log file as served for download.
    async fn download_log(&self) -> Result<Bytes, ApiError>;
}

/// Paths always travel with forward slashes.
pub fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/")
}
