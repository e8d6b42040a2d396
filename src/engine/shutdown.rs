//! Stop, shut down, then wait for the backend to disappear.
//!
//! The sequence runs to completion once it has passed the stop step. It takes no
//! cancellation token: callers must not start it speculatively.

use crate::backend::MaintenanceApi;
use crate::error::OrchestratorError;
use crate::model::{RunConfig, ShutdownOutcome, ShutdownStage};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub health_attempts: u32,
    pub health_interval: Duration,
    /// Grace period before the first health probe.
    pub initial_delay: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            health_attempts: 10,
            health_interval: Duration::from_millis(500),
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl ShutdownPolicy {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            health_attempts: cfg.health_attempts.max(1),
            health_interval: cfg.health_interval,
            initial_delay: cfg.health_initial_delay,
        }
    }
}

/// Runs the sequence, reporting each stage through `progress`.
///
/// Fails with [`OrchestratorError::SequenceAborted`] only when `stop_process` fails;
/// nothing after it has been attempted then.
pub async fn run_shutdown_sequence<F>(
    api: &dyn MaintenanceApi,
    path: &str,
    policy: ShutdownPolicy,
    mut progress: F,
) -> Result<ShutdownOutcome, OrchestratorError>
where
    F: FnMut(ShutdownStage) + Send,
{
    progress(ShutdownStage::Stopping);
    api.stop_process(path)
        .await
        .map_err(OrchestratorError::SequenceAborted)?;
    progress(ShutdownStage::ProcessStopped);

    // The backend tears itself down and may hang up before replying; any result is acceptance.
    let acknowledged = match api.request_shutdown().await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "shutdown request got no clean reply");
            false
        }
    };
    info!(acknowledged, "server shutdown requested");
    progress(ShutdownStage::ShutdownRequested { acknowledged });

    let outcome = wait_until_down(api, policy, &mut progress).await;
    Ok(outcome)
}

/// A failing health call is the expected way out of this loop.
async fn wait_until_down<F>(
    api: &dyn MaintenanceApi,
    policy: ShutdownPolicy,
    progress: &mut F,
) -> ShutdownOutcome
where
    F: FnMut(ShutdownStage) + Send,
{
    let attempts = policy.health_attempts.max(1);
    for attempt in 1..=attempts {
        let delay = if attempt == 1 {
            policy.initial_delay
        } else {
            policy.health_interval
        };
        tokio::time::sleep(delay).await;

        let server_up = match api.check_health().await {
            Ok(status) => {
                debug!(attempt, healthy = status.is_healthy(), "server still answering");
                true
            }
            Err(_) => false,
        };
        progress(ShutdownStage::HealthProbe { attempt, server_up });
        if !server_up {
            info!(attempt, "server is down");
            return ShutdownOutcome::Confirmed { attempts: attempt };
        }
    }
    warn!(attempts, "server still answering health checks, treating it as down");
    ShutdownOutcome::Assumed { attempts }
}
