use super::envelope::{decode, message_of};
use super::{
    normalize_path, BackupStatus, CompatibilityReport, HealthStatus, MaintenanceApi,
    OperationMessage,
};
use crate::error::ApiError;
use crate::model::{Architecture, RunConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_PATH: &str = "/api/get-default-path";
const LIST_SERVERS: &str = "/api/list-emby-servers";
const BROWSE: &str = "/api/browse-emby";
const SELECT: &str = "/api/select-emby";
const CHECK_COMPATIBILITY: &str = "/api/check-compatibility";
const FIX: &str = "/api/fix-ffmpeg";
const CHECK_BACKUP: &str = "/api/check-backup";
const RESTORE: &str = "/api/restore-ffmpeg";
const FORCE_TEST_MODE: &str = "/api/force-test-mode";
const STOP_PROCESS: &str = "/api/stop-process";
const SHUTDOWN: &str = "/shutdown";
const HEALTH: &str = "/health";
const GET_LOGS: &str = "/api/get-logs";
const DOWNLOAD_LOG: &str = "/api/download-log";

#[derive(Serialize)]
struct PathBody {
    path: String,
}

#[derive(Serialize)]
struct ForceBody {
    path: String,
    architecture: Architecture,
}

#[derive(Deserialize)]
struct PathReply {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct ServersReply {
    #[serde(default)]
    servers: Vec<String>,
}

#[derive(Deserialize)]
struct LogsReply {
    logs: String,
}

/// HTTP implementation of [`MaintenanceApi`].
#[derive(Clone)]
pub struct BackendClient {
    pub(crate) http: reqwest::Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid backend URL: {}", cfg.base_url))?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { http, base_url })
    }

    fn url(&self, endpoint: &'static str) -> Result<Url, ApiError> {
        self.base_url
            .join(endpoint)
            .map_err(|e| ApiError::Network {
                endpoint,
                reason: format!("invalid URL: {e}"),
            })
    }

    /// Send and read the body of a 2xx response.
    async fn send(&self, endpoint: &'static str, req: RequestBuilder) -> Result<Bytes, ApiError> {
        let resp = req.send().await.map_err(|e| ApiError::Network {
            endpoint,
            reason: e.to_string(),
        })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| ApiError::Network {
            endpoint,
            reason: e.to_string(),
        })?;
        debug!(endpoint, %status, bytes = body.len(), "backend response");
        if !status.is_success() {
            let reason = match message_of(&body) {
                Some(msg) => format!("HTTP {status}: {msg}"),
                None => format!("HTTP {status}"),
            };
            return Err(ApiError::Network { endpoint, reason });
        }
        Ok(body)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &'static str) -> Result<T, ApiError> {
        let url = self.url(endpoint)?;
        let body = self.send(endpoint, self.http.get(url)).await?;
        decode(endpoint, &body)
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        endpoint: &'static str,
        payload: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(endpoint)?;
        let body = self
            .send(endpoint, self.http.post(url).json(payload))
            .await?;
        decode(endpoint, &body)
    }

    async fn post_path<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
    ) -> Result<T, ApiError> {
        let payload = PathBody {
            path: normalize_path(path),
        };
        self.post(endpoint, &payload).await
    }
}

/// A `success: false` reply means "nothing found" for the discovery endpoints.
fn optional_path(res: Result<PathReply, ApiError>) -> Result<Option<String>, ApiError> {
    match res {
        Ok(reply) => Ok(reply.path.filter(|p| !p.trim().is_empty())),
        Err(ApiError::Protocol { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl MaintenanceApi for BackendClient {
    async fn select_path(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.post_path(SELECT, path).await
    }

    async fn check_compatibility(&self, path: &str) -> Result<CompatibilityReport, ApiError> {
        self.post_path(CHECK_COMPATIBILITY, path).await
    }

    async fn fix_incompatibility(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.post_path(FIX, path).await
    }

    async fn check_backup_exists(&self, path: &str) -> Result<BackupStatus, ApiError> {
        self.post_path(CHECK_BACKUP, path).await
    }

    async fn restore_backup(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.post_path(RESTORE, path).await
    }

    async fn stop_process(&self, path: &str) -> Result<OperationMessage, ApiError> {
        self.post_path(STOP_PROCESS, path).await
    }

    async fn request_shutdown(&self) -> Result<(), ApiError> {
        let url = self.url(SHUTDOWN)?;
        self.send(SHUTDOWN, self.http.post(url).json(&serde_json::json!({})))
            .await
            .map(|_| ())
    }

    async fn check_health(&self) -> Result<HealthStatus, ApiError> {
        let url = self.url(HEALTH)?;
        let body = self.send(HEALTH, self.http.get(url)).await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::MalformedResponse {
            endpoint: HEALTH,
            reason: e.to_string(),
        })
    }

    async fn fetch_log_tail(&self) -> Result<String, ApiError> {
        let reply: LogsReply = self.get(GET_LOGS).await?;
        Ok(reply.logs)
    }

    async fn list_candidate_paths(&self) -> Result<Vec<String>, ApiError> {
        let reply: ServersReply = self.get(LIST_SERVERS).await?;
        Ok(reply.servers)
    }

    async fn force_architecture(
        &self,
        path: &str,
        arch: Architecture,
    ) -> Result<OperationMessage, ApiError> {
        let payload = ForceBody {
            path: normalize_path(path),
            architecture: arch,
        };
        self.post(FORCE_TEST_MODE, &payload).await
    }

    async fn default_path(&self) -> Result<Option<String>, ApiError> {
        optional_path(self.get(DEFAULT_PATH).await)
    }

    async fn browse_path(&self) -> Result<Option<String>, ApiError> {
        optional_path(self.get(BROWSE).await)
    }

    async fn download_log(&self) -> Result<Bytes, ApiError> {
        let url = self.url(DOWNLOAD_LOG)?;
        self.send(DOWNLOAD_LOG, self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_config(base_url: String) -> RunConfig {
        RunConfig {
            base_url,
            path: None,
            request_timeout: Duration::from_secs(5),
            log_poll_interval: Duration::from_secs(2),
            health_attempts: 10,
            health_interval: Duration::from_millis(500),
            health_initial_delay: Duration::from_secs(1),
            recheck_delay: Duration::from_secs(1),
            stall_after: Duration::from_secs(60),
            monitor_logs: false,
            user_agent: "emby-ffmpeg-fixer-test".into(),
        }
    }

    async fn serve(app: Router) -> BackendClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        BackendClient::new(&test_config(format!("http://{addr}"))).unwrap()
    }

    #[tokio::test]
    async fn check_compatibility_posts_normalized_path() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let seen2 = seen.clone();
        let app = Router::new().route(
            "/api/check-compatibility",
            post(move |Json(body): Json<Value>| {
                let seen = seen2.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(json!({
                        "success": true,
                        "system_architecture": "arm64",
                        "ffmpeg_architecture": "x86_64",
                        "is_compatible": false,
                        "message": "FFMPEG architecture (x86_64) does not match system architecture (arm64)"
                    }))
                }
            }),
        );
        let client = serve(app).await;

        let report = client
            .check_compatibility(r"C:\Emby\Server")
            .await
            .unwrap();

        assert!(!report.is_compatible);
        assert_eq!(report.ffmpeg_architecture, "x86_64");
        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["path"], "C:/Emby/Server");
    }

    #[tokio::test]
    async fn non_2xx_is_network_error_with_server_message() {
        let app = Router::new().route(
            "/api/select-emby",
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"success": false, "message": "Path does not exist: /nope"})),
                )
            }),
        );
        let client = serve(app).await;

        let err = client.select_path("/nope").await.unwrap_err();
        match err {
            ApiError::Network { endpoint, reason } => {
                assert_eq!(endpoint, "/api/select-emby");
                assert!(reason.contains("404"));
                assert!(reason.contains("Path does not exist"));
            }
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_false_is_protocol_error() {
        let app = Router::new().route(
            "/api/fix-ffmpeg",
            post(|| async {
                Json(json!({"success": false, "message": "Emby Server path does not exist"}))
            }),
        );
        let client = serve(app).await;

        let err = client.fix_incompatibility("/srv/emby").await.unwrap_err();
        assert_eq!(err.server_message(), Some("Emby Server path does not exist"));
    }

    #[tokio::test]
    async fn html_body_is_malformed() {
        let app = Router::new().route("/api/get-logs", get(|| async { "<html></html>" }));
        let client = serve(app).await;

        let err = client.fetch_log_tail().await.unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn force_architecture_sends_wire_name() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let seen2 = seen.clone();
        let app = Router::new().route(
            "/api/force-test-mode",
            post(move |Json(body): Json<Value>| {
                let seen = seen2.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(json!({"success": true, "message": "Success: forced x86_64"}))
                }
            }),
        );
        let client = serve(app).await;

        let reply = client
            .force_architecture("/Applications/EmbyServer.app", Architecture::X86_64)
            .await
            .unwrap();
        assert_eq!(reply.message.as_deref(), Some("Success: forced x86_64"));
        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["architecture"], "x86_64");
    }

    #[tokio::test]
    async fn discovery_endpoints() {
        let app = Router::new()
            .route(
                "/api/get-default-path",
                get(|| async {
                    Json(json!({"success": false, "message": "No default Emby Server path found"}))
                }),
            )
            .route(
                "/api/list-emby-servers",
                get(|| async {
                    Json(json!({"success": true, "servers": ["/Applications/EmbyServer.app"]}))
                }),
            );
        let client = serve(app).await;

        assert_eq!(client.default_path().await.unwrap(), None);
        assert_eq!(
            client.list_candidate_paths().await.unwrap(),
            vec!["/Applications/EmbyServer.app".to_string()]
        );
    }

    #[tokio::test]
    async fn health_and_logs() {
        let app = Router::new()
            .route(
                "/health",
                get(|| async { Json(json!({"status": "healthy", "timestamp": "2024-01-01T10:00:00"})) }),
            )
            .route(
                "/api/get-logs",
                get(|| async { Json(json!({"success": true, "logs": "10:00:00 a\n10:00:01 b"})) }),
            )
            .route("/api/download-log", get(|| async { "raw log file" }));
        let client = serve(app).await;

        assert!(client.check_health().await.unwrap().is_healthy());
        assert_eq!(client.fetch_log_tail().await.unwrap(), "10:00:00 a\n10:00:01 b");
        assert_eq!(&client.download_log().await.unwrap()[..], b"raw log file");
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = BackendClient::new(&test_config(format!("http://{addr}"))).unwrap();

        let err = client.check_health().await.unwrap_err();
        assert!(matches!(err, ApiError::Network { endpoint: "/health", .. }));
    }
}
