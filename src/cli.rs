use crate::backend::{BackendClient, MaintenanceApi};
use crate::engine::{classify, leading_timestamp, run_shutdown_sequence, ShutdownPolicy};
use crate::model::{Action, Architecture, LogEvent, RunConfig, ShutdownOutcome};
use crate::orchestrator::{perform, Orchestrator, Settlement};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "emby-ffmpeg-fixer",
    version,
    about = "Check and fix FFMPEG architecture compatibility of an Emby Server install"
)]
pub struct Cli {
    /// Base URL of the fixer backend
    #[arg(long, default_value = "http://127.0.0.1:5050")]
    pub base_url: String,

    /// Emby Server install path (asks the backend for its default when omitted)
    #[arg(long)]
    pub path: Option<String>,

    /// Print the final state as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// How often the backend log is polled
    #[arg(long, default_value = "2s")]
    pub log_poll_interval: humantime::Duration,

    /// Health checks made after a shutdown request before giving up
    #[arg(long, default_value_t = 10)]
    pub health_attempts: u32,

    /// Pause between health checks
    #[arg(long, default_value = "500ms")]
    pub health_interval: humantime::Duration,

    /// Pause before the first health check
    #[arg(long, default_value = "1s")]
    pub health_initial_delay: humantime::Duration,

    /// Delay before the automatic check that follows a fix, restore or forced architecture
    #[arg(long, default_value = "1s")]
    pub recheck_delay: humantime::Duration,

    /// Timeout for a single backend request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Mark an active step as stalled after this long without an answer (TUI only)
    #[arg(long, default_value = "60s")]
    pub stall_after: humantime::Duration,

    /// Log file for the interactive UI
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not poll the backend log
    #[arg(long)]
    pub no_monitor: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// List Emby Server installations known to the backend
    Servers,
    /// Check FFMPEG compatibility
    Check,
    /// Replace FFMPEG with binaries matching this system
    Fix,
    /// Report whether an original FFMPEG backup exists
    Backup,
    /// Restore the original FFMPEG binaries
    Restore,
    /// Force a specific FFMPEG architecture (for testing)
    ForceArch {
        /// x86_64 or arm64
        arch: Architecture,
    },
    /// Stop the running process and restore the initial state
    Stop,
    /// Stop the process, shut the backend down and wait until it is gone
    Shutdown,
    /// Print the backend log, newest line first
    Logs {
        /// Save the raw log file here instead of printing it
        #[arg(long)]
        download: Option<PathBuf>,
    },
}

impl Cli {
    /// True when the run opens the interactive UI.
    pub fn is_interactive(&self) -> bool {
        self.command.is_none() && !self.json && !self.text && cfg!(feature = "tui")
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text cannot be used together"));
    }

    #[cfg(feature = "tui")]
    if args.is_interactive() {
        return crate::tui::run(args).await;
    }

    run_oneshot(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        path: args.path.clone(),
        request_timeout: Duration::from(args.request_timeout),
        log_poll_interval: Duration::from(args.log_poll_interval),
        health_attempts: args.health_attempts,
        health_interval: Duration::from(args.health_interval),
        health_initial_delay: Duration::from(args.health_initial_delay),
        recheck_delay: Duration::from(args.recheck_delay),
        stall_after: Duration::from(args.stall_after),
        monitor_logs: !args.no_monitor,
        user_agent: format!("emby-ffmpeg-fixer/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Actions run for a one-shot command, in order.
fn actions_for(command: Option<&CliCommand>) -> Vec<Action> {
    match command {
        None => vec![Action::Check, Action::BackupCheck],
        Some(CliCommand::Check) => vec![Action::Check],
        Some(CliCommand::Fix) => vec![Action::Fix],
        Some(CliCommand::Backup) => vec![Action::BackupCheck],
        Some(CliCommand::Restore) => vec![Action::Restore],
        Some(CliCommand::ForceArch { arch }) => vec![Action::ForceArchitecture(*arch)],
        Some(CliCommand::Stop) => vec![Action::StopProcess],
        Some(CliCommand::Servers | CliCommand::Shutdown | CliCommand::Logs { .. }) => Vec::new(),
    }
}

struct Output {
    tx: mpsc::UnboundedSender<OutputLine>,
    json: bool,
}

impl Output {
    /// Progress goes to stderr and is muted in JSON mode.
    fn progress(&self, msg: impl Into<String>) {
        if !self.json {
            let _ = self.tx.send(OutputLine::Stderr(msg.into()));
        }
    }

    fn stdout(&self, msg: impl Into<String>) {
        let _ = self.tx.send(OutputLine::Stdout(msg.into()));
    }

    fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.stdout(serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

async fn run_oneshot(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let client = BackendClient::new(&cfg).context("failed to build HTTP client")?;
    let (tx, out_handle) = spawn_output_writer();
    let out = Output {
        tx,
        json: args.json,
    };

    let res = match args.command.as_ref() {
        Some(CliCommand::Servers) => run_servers(&client, &out).await,
        Some(CliCommand::Logs { download }) => run_logs(&client, &out, download.as_ref()).await,
        Some(CliCommand::Shutdown) => run_shutdown(&client, &cfg, &out).await,
        cmd => run_actions(&client, &cfg, &out, &actions_for(cmd)).await,
    };

    drop(out);
    let _ = out_handle.await;
    res
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerList {
    default_path: Option<String>,
    candidates: Vec<String>,
}

async fn run_servers(api: &dyn MaintenanceApi, out: &Output) -> Result<()> {
    let default_path = api
        .default_path()
        .await
        .context("failed to get default path")?;
    let candidates = api
        .list_candidate_paths()
        .await
        .context("failed to list Emby Server installations")?;

    if out.json {
        return out.json(&ServerList {
            default_path,
            candidates,
        });
    }
    if let Some(p) = default_path.as_deref() {
        out.stdout(format!("default: {p}"));
    }
    if candidates.is_empty() {
        out.progress("No Emby Server installations detected");
    }
    for p in candidates {
        out.stdout(p);
    }
    Ok(())
}

/// Newest first, the way the full log view shows it.
pub(crate) fn newest_first(text: &str) -> Vec<LogEvent> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .rev()
        .map(|line| LogEvent {
            timestamp: leading_timestamp(line).to_string(),
            raw_line: line.to_string(),
            category: classify(line),
        })
        .collect()
}

async fn run_logs(
    api: &dyn MaintenanceApi,
    out: &Output,
    download: Option<&PathBuf>,
) -> Result<()> {
    if let Some(dest) = download {
        let bytes = api.download_log().await.context("failed to download log")?;
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        info!(path = %dest.display(), bytes = bytes.len(), "log downloaded");
        out.progress(format!("Saved: {}", dest.display()));
        return Ok(());
    }

    let text = api.fetch_log_tail().await.context("failed to fetch logs")?;
    let events = newest_first(&text);
    if out.json {
        return out.json(&events);
    }
    for ev in events {
        out.stdout(ev.raw_line);
    }
    Ok(())
}

/// Takes `--path` or the backend's default, and registers it with the backend.
async fn accept_path(
    api: &dyn MaintenanceApi,
    cfg: &RunConfig,
    orch: &mut Orchestrator,
    out: &Output,
) -> Result<()> {
    let path = match cfg.path.clone() {
        Some(p) => p,
        None => api
            .default_path()
            .await
            .context("failed to get default path")?
            .context("backend reported no default Emby Server path, pass --path")?,
    };
    api.select_path(&path)
        .await
        .with_context(|| format!("backend rejected path {path}"))?;
    orch.accept_path(&path);
    out.progress(format!(
        "Selected Emby Server path: {}",
        orch.selected_path().unwrap_or(&path)
    ));
    Ok(())
}

async fn run_actions(
    api: &dyn MaintenanceApi,
    cfg: &RunConfig,
    out: &Output,
    actions: &[Action],
) -> Result<()> {
    let mut orch = Orchestrator::new();
    accept_path(api, cfg, &mut orch, out).await?;

    let mut failure: Option<String> = None;
    for &action in actions {
        out.progress(action.started_message());
        match perform(&mut orch, api, action).await? {
            Settlement::Succeeded {
                message, recheck, ..
            } => {
                out.progress(message);
                if recheck {
                    tokio::time::sleep(cfg.recheck_delay).await;
                    out.progress(Action::Check.started_message());
                    match perform(&mut orch, api, Action::Check).await? {
                        Settlement::Succeeded { message, .. } => out.progress(message),
                        Settlement::Failed { message, .. } => {
                            out.progress(format!("Error: {message}"));
                            failure = Some(message);
                        }
                        Settlement::Stale { .. } => {}
                    }
                }
            }
            Settlement::Failed { message, .. } => {
                out.progress(format!("Error: {message}"));
                failure = Some(message);
                break;
            }
            Settlement::Stale { .. } => {}
        }
    }

    let snap = orch.snapshot();
    if out.json {
        out.json(&snap)?;
    } else {
        for line in crate::text_summary::build_text_summary(&snap).lines {
            out.stdout(line);
        }
    }

    match failure {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}

async fn run_shutdown(api: &dyn MaintenanceApi, cfg: &RunConfig, out: &Output) -> Result<()> {
    let mut orch = Orchestrator::new();
    accept_path(api, cfg, &mut orch, out).await?;
    let path = orch.seal_for_shutdown()?;

    let res = run_shutdown_sequence(api, &path, ShutdownPolicy::from_config(cfg), |stage| {
        out.progress(stage.to_message());
    })
    .await;

    match res {
        Ok(outcome) => {
            orch.finish_shutdown(outcome);
            match outcome {
                ShutdownOutcome::Confirmed { attempts } => {
                    out.progress(format!("Server is down after {attempts} health check(s)"));
                }
                ShutdownOutcome::Assumed { attempts } => out.progress(format!(
                    "Server still answering after {attempts} health checks, giving up"
                )),
            }
            if out.json {
                out.json(&orch.snapshot())?;
            }
            Ok(())
        }
        Err(e) => {
            let message = orch.abort_shutdown(&e);
            Err(anyhow::Error::new(e).context(format!("Error during shutdown: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::testing::{protocol_error, report, FakeApi};
    use crate::model::EventCategory;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("emby-ffmpeg-fixer").chain(args.iter().copied()))
    }

    fn output(json: bool) -> (Output, mpsc::UnboundedReceiver<OutputLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Output { tx, json }, rx)
    }

    fn stdout_lines(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            if let OutputLine::Stdout(l) = line {
                lines.push(l);
            }
        }
        lines
    }

    #[test]
    fn defaults_match_the_backend() {
        let cfg = build_config(&parse(&[]));
        assert_eq!(cfg.base_url, "http://127.0.0.1:5050");
        assert_eq!(cfg.log_poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.health_attempts, 10);
        assert_eq!(cfg.health_interval, Duration::from_millis(500));
        assert_eq!(cfg.health_initial_delay, Duration::from_secs(1));
        assert!(cfg.monitor_logs);
    }

    #[test]
    fn subcommands_parse() {
        let cli = parse(&["--path", "/srv/emby", "force-arch", "aarch64"]);
        assert_eq!(
            cli.command,
            Some(CliCommand::ForceArch {
                arch: Architecture::Arm64
            })
        );
        assert!(!cli.is_interactive());

        let cli = parse(&["logs", "--download", "out.log"]);
        assert_eq!(
            cli.command,
            Some(CliCommand::Logs {
                download: Some(PathBuf::from("out.log"))
            })
        );
        assert!(Cli::try_parse_from(["emby-ffmpeg-fixer", "force-arch", "mips"]).is_err());
    }

    #[test]
    fn humantime_flags_are_accepted() {
        let cfg = build_config(&parse(&["--health-interval", "250ms", "--no-monitor"]));
        assert_eq!(cfg.health_interval, Duration::from_millis(250));
        assert!(!cfg.monitor_logs);
    }

    #[test]
    fn full_log_is_newest_first() {
        let events = newest_first("10:00:00 Server started\n\n10:00:05 Process stopped successfully\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, "10:00:05");
        assert_eq!(events[0].category, EventCategory::ProcessStopped);
        assert_eq!(events[1].category, EventCategory::ServerStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn fix_is_followed_by_a_check() {
        let api = FakeApi::default();
        api.push_check(Ok(report("arm64", "arm64")));
        let mut cfg = build_config(&parse(&[]));
        cfg.path = Some("/srv/emby".into());
        let (out, mut rx) = output(false);

        run_actions(&api, &cfg, &out, &[Action::Fix]).await.unwrap();

        assert_eq!(api.calls("fix_incompatibility"), 1);
        assert_eq!(api.calls("check_compatibility"), 1);
        let lines = stdout_lines(&mut rx);
        assert!(lines.contains(&"Compatibility: Compatible".to_string()));
    }

    #[tokio::test]
    async fn failed_action_is_an_error() {
        let api = FakeApi::default();
        api.push_backup(Err(protocol_error("/api/check-backup", "Path not set")));
        let mut cfg = build_config(&parse(&[]));
        cfg.path = Some("/srv/emby".into());
        let (out, _rx) = output(true);

        let err = run_actions(&api, &cfg, &out, &[Action::BackupCheck])
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Path not set");
    }

    #[tokio::test]
    async fn missing_default_path_is_reported() {
        let api = FakeApi::default();
        let cfg = build_config(&parse(&[]));
        let (out, _rx) = output(false);

        let err = run_actions(&api, &cfg, &out, &[Action::Check])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("pass --path"));
        assert_eq!(api.calls("check_compatibility"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_stages() {
        let api = FakeApi::default();
        let mut cfg = build_config(&parse(&[]));
        cfg.path = Some("/srv/emby".into());
        let (out, mut rx) = output(false);

        run_shutdown(&api, &cfg, &out).await.unwrap();

        let mut stderr = Vec::new();
        while let Ok(OutputLine::Stderr(l)) | Ok(OutputLine::Stdout(l)) = rx.try_recv() {
            stderr.push(l);
        }
        assert!(stderr.contains(&"Server shutdown initiated".to_string()));
        assert_eq!(
            stderr.last().map(String::as_str),
            Some("Server is down after 1 health check(s)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_fails_the_shutdown_command() {
        let api = FakeApi::default();
        api.push_stop(Err(protocol_error("/api/stop-process", "Failed to stop")));
        let mut cfg = build_config(&parse(&[]));
        cfg.path = Some("/srv/emby".into());
        let (out, _rx) = output(false);

        let err = run_shutdown(&api, &cfg, &out).await.unwrap_err();

        assert_eq!(err.to_string(), "Error during shutdown: Failed to stop");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::SequenceAborted(_))
        ));
        assert_eq!(api.calls("request_shutdown"), 0);
    }

    #[tokio::test]
    async fn download_writes_the_raw_log() {
        let api = FakeApi::default();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("emby.log");
        let (out, _rx) = output(false);

        run_logs(&api, &out, Some(&dest)).await.unwrap();

        let saved = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(saved, "10:00:00 Server started\n");
    }
}
