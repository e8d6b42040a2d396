use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

const KEYS: &[(&str, &str)] = &[
    ("q / Ctrl-C", "Quit"),
    ("c", "Check compatibility"),
    ("f", "Fix compatibility"),
    ("b", "Check for original backup"),
    ("r", "Restore original FFMPEG"),
    ("x / a", "Force x86_64 / arm64 (testing)"),
    ("s", "Stop process"),
    ("D", "Stop process and shut the backend down"),
    ("R", "Reset steps"),
    ("m", "Toggle log monitoring"),
    ("p", "Type a server path"),
    ("o", "Browse for installations"),
    ("g", "Ask the backend for its default path"),
    ("↑/↓ j/k", "Pick a detected installation"),
    ("enter", "Use the picked installation"),
    ("tab", "Switch tabs"),
    ("?", "Show this help"),
];

fn key_line(key: &str, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(what.to_string()),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = vec![Line::from("Keybinds:")];
    lines.extend(KEYS.iter().map(|(k, what)| key_line(k, what)));
    lines.push(Line::from(""));
    lines.push(Line::from(
        "A step turns yellow when the backend has not answered in time.",
    ));
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
