mod help;
mod state;

use crate::backend::{BackendClient, MaintenanceApi};
use crate::cli::{build_config, Cli};
use crate::model::{Action, Architecture, ControllerEvent, RunConfig, ServerStatus, StepId};
use crate::orchestrator::{self, Activity, Command, ControllerExit, Snapshot};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use help::draw_help;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{push_wrapped_status_kv, status_color, UiState};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let api: Arc<dyn MaintenanceApi> =
        Arc::new(BackendClient::new(&cfg).context("failed to build HTTP client")?);

    // Unbounded channels avoid backpressure between the controller and the render loop.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ControllerEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_cfg = cfg.clone();
    let ui_handle =
        std::thread::spawn(move || run_threaded(ui_cfg, snapshot_rx, event_rx, cmd_tx));

    let res = orchestrator::run_controller(api, cfg, snapshot_tx, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    if let ControllerExit::ShutdownComplete(outcome) = res? {
        println!(
            "{}",
            ControllerEvent::ShutdownCompleted { outcome }.to_message()
        );
    }
    Ok(())
}

/// What a key press asks for, apart from quitting.
fn command_for_key(code: KeyCode) -> Option<Command> {
    let cmd = match code {
        KeyCode::Char('c') => Command::Run(Action::Check),
        KeyCode::Char('f') => Command::Run(Action::Fix),
        KeyCode::Char('b') => Command::Run(Action::BackupCheck),
        KeyCode::Char('r') => Command::Run(Action::Restore),
        KeyCode::Char('x') => Command::Run(Action::ForceArchitecture(Architecture::X86_64)),
        KeyCode::Char('a') => Command::Run(Action::ForceArchitecture(Architecture::Arm64)),
        KeyCode::Char('s') => Command::Run(Action::StopProcess),
        KeyCode::Char('D') => Command::Shutdown,
        KeyCode::Char('R') => Command::Reset,
        KeyCode::Char('o') => Command::Browse,
        KeyCode::Char('g') => Command::Discover,
        _ => return None,
    };
    Some(cmd)
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    cfg: RunConfig,
    mut snapshot_rx: watch::Receiver<Snapshot>,
    mut event_rx: UnboundedReceiver<ControllerEvent>,
    cmd_tx: UnboundedSender<Command>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only.
    let mut state = UiState::new(cfg.stall_after, cfg.monitor_logs);
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep the UI responsive.
        let mut disconnected = false;
        loop {
            match event_rx.try_recv() {
                Ok(ev) => state.apply_event(&ev),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }
        if disconnected {
            // Controller is gone (shutdown finished).
            break Ok(());
        }

        if snapshot_rx.has_changed().unwrap_or(false) {
            let snap = snapshot_rx.borrow_and_update().clone();
            state.apply_snapshot(snap, Instant::now());
        }
        if let Some(step) = state.take_stalled(Instant::now()) {
            let _ = cmd_tx.send(Command::Stall(step));
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if !event::poll(Duration::from_millis(10)).unwrap_or(false) {
            continue;
        }
        let Ok(Event::Key(k)) = event::read() else {
            continue;
        };
        if k.kind != KeyEventKind::Press {
            continue;
        }
        if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
            let _ = cmd_tx.send(Command::Quit);
            break Ok(());
        }

        if let Some(input) = state.path_input.as_mut() {
            match k.code {
                KeyCode::Enter => {
                    let path = input.trim().to_string();
                    state.path_input = None;
                    if !path.is_empty() {
                        let _ = cmd_tx.send(Command::SelectPath(path));
                    }
                }
                KeyCode::Esc => state.path_input = None,
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(ch) => input.push(ch),
                _ => {}
            }
            continue;
        }

        match k.code {
            KeyCode::Char('q') => {
                let _ = cmd_tx.send(Command::Quit);
                // A running shutdown cannot be abandoned; the controller closes us when done.
                if state.snapshot.operations_enabled {
                    break Ok(());
                }
            }
            KeyCode::Char('m') => {
                state.monitoring = !state.monitoring;
                let cmd = if state.monitoring {
                    Command::StartLogMonitoring
                } else {
                    Command::StopLogMonitoring
                };
                let _ = cmd_tx.send(cmd);
                state.info = if state.monitoring {
                    "Log monitoring on".into()
                } else {
                    "Log monitoring off".into()
                };
            }
            KeyCode::Char('p') => {
                state.path_input =
                    Some(state.snapshot.selected_path.clone().unwrap_or_default());
            }
            KeyCode::Up | KeyCode::Char('k') => state.select_prev(),
            KeyCode::Down | KeyCode::Char('j') => state.select_next(),
            KeyCode::Enter => {
                if let Some(path) = state.selected_candidate() {
                    let _ = cmd_tx.send(Command::SelectPath(path.to_string()));
                }
            }
            KeyCode::Tab => state.tab = (state.tab + 1) % 2,
            KeyCode::Char('?') => state.tab = 1,
            code => {
                if let Some(cmd) = command_for_key(code) {
                    let _ = cmd_tx.send(cmd);
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Dashboard"), Line::from("Help")])
        .select(state.tab)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("emby-ffmpeg-fixer"),
        )
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        _ => draw_help(chunks[1], f),
    }
    draw_footer(chunks[2], f, state);
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(11), Constraint::Min(0)].as_ref())
        .split(area);
    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(rows[0]);

    draw_steps(top[0], f, state);
    draw_status(top[1], f, state);

    let bottom = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)].as_ref())
        .split(rows[1]);
    draw_log(bottom[0], f, state);
    draw_candidates(bottom[1], f, state);
}

fn step_title(step: StepId) -> &'static str {
    match step {
        StepId::CheckCompatibility => "1. Check compatibility",
        StepId::FixCompatibility => "2. Fix compatibility",
        StepId::Restore => "3. Restore original",
    }
}

fn draw_steps(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Steps");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let slots = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3); 3].as_ref())
        .split(inner);

    for ((step, st), slot) in state.snapshot.steps.iter().zip(slots.iter()) {
        let color = status_color(st.status);
        let gauge = Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("{} ({})", step_title(step), st.status.as_str())),
            )
            .gauge_style(Style::default().fg(color))
            .percent(u16::from(st.progress.min(100)));
        f.render_widget(gauge, *slot);
    }
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let snap = &state.snapshot;
    let app = &snap.state;
    let mut lines: Vec<Line<'static>> = Vec::new();

    let path = snap.selected_path.as_deref().unwrap_or("-");
    push_wrapped_status_kv(&mut lines, "Path", path, area.width);
    push_wrapped_status_kv(
        &mut lines,
        "System",
        app.system_architecture.as_deref().unwrap_or("-"),
        area.width,
    );
    push_wrapped_status_kv(
        &mut lines,
        "FFMPEG",
        app.ffmpeg_architecture.as_deref().unwrap_or("-"),
        area.width,
    );

    let (compat, compat_color) = match app.is_compatible {
        Some(true) => ("Compatible", Color::Green),
        Some(false) => ("Incompatible", Color::Red),
        None => ("Unknown", Color::DarkGray),
    };
    lines.push(Line::from(vec![
        Span::styled("Compatibility:", Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(compat, Style::default().fg(compat_color)),
    ]));

    let (server, server_color) = match app.server_status {
        ServerStatus::Unknown => ("unknown", Color::DarkGray),
        ServerStatus::Healthy => ("up", Color::Green),
        ServerStatus::Down => ("down", Color::Red),
    };
    lines.push(Line::from(vec![
        Span::styled("Server:", Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(server, Style::default().fg(server_color)),
        Span::raw(if app.process_running {
            "  process running"
        } else {
            "  process stopped"
        }),
    ]));
    push_wrapped_status_kv(
        &mut lines,
        "Backup",
        if app.has_backup { "present" } else { "none" },
        area.width,
    );
    if let Some(op) = app.last_operation.as_deref() {
        push_wrapped_status_kv(&mut lines, "Last op", op, area.width);
    }
    if let Some(err) = app.last_error.as_deref() {
        lines.push(Line::from(Span::styled(
            format!("Error: {err}"),
            Style::default().fg(Color::Red),
        )));
    }

    let title = match snap.activity {
        Activity::Busy { action, .. } => format!("Status ({action}…)"),
        Activity::Idle if !snap.operations_enabled => "Status (shutting down)".into(),
        Activity::Idle => "Status".into(),
    };
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_log(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .iter()
        .take(height)
        .map(|entry| {
            let style = if entry.is_error {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(format!("{} ", entry.at), Style::default().fg(Color::DarkGray)),
                Span::styled(entry.text.clone(), style),
            ])
        })
        .collect();
    let title = if state.monitoring {
        "Activity (log monitoring on)"
    } else {
        "Activity"
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_candidates(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let lines: Vec<Line> = state
        .snapshot
        .candidates
        .iter()
        .enumerate()
        .map(|(i, path)| {
            if i == state.candidate_selected {
                Line::from(Span::styled(
                    format!("> {path}"),
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD),
                ))
            } else {
                Line::from(format!("  {path}"))
            }
        })
        .collect();
    let p = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Installations"));
    f.render_widget(p, area);
}

fn draw_footer(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let line = match state.path_input.as_deref() {
        Some(input) => Line::from(vec![
            Span::styled("Path: ", Style::default().fg(Color::Magenta)),
            Span::raw(input.to_string()),
            Span::styled("█", Style::default().fg(Color::Gray)),
        ]),
        None if state.info.is_empty() => Line::from(Span::styled(
            "c check  f fix  r restore  s stop  D shutdown  ? help  q quit",
            Style::default().fg(Color::DarkGray),
        )),
        None => Line::from(state.info.clone()),
    };
    let p = Paragraph::new(line).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}
