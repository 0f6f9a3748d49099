use crate::app::App;
use crate::sample::format_bytes;
use devrun_core::{Phase, Status};
use devrun_supervisor::Project;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph},
    Frame,
};
use std::time::Duration;

const COMPACT_WIDTH: u16 = 90;

#[derive(Clone, Copy)]
pub(crate) struct Theme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

pub(crate) fn theme() -> Theme {
    Theme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

fn narrow(width: u16) -> bool {
    width < COMPACT_WIDTH
}

fn status_color(status: Status, theme: Theme) -> Color {
    match status {
        Status::Running => theme.ok,
        Status::Success => theme.accent,
        Status::Error => theme.critical,
        Status::Stopped => theme.muted,
        Status::Pending => theme.warn,
    }
}

fn panel(title: impl Into<String>, theme: Theme, bg: Color) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(bg))
        .title(Span::styled(
            title.into(),
            Style::default().fg(theme.title).add_modifier(Modifier::BOLD),
        ))
}

fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{keep}…")
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

pub fn render_ui(frame: &mut Frame, app: &App) {
    let size = frame.size();
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(size);
    frame.render_widget(render_header(app, theme, size.width), layout[0]);

    if app.focused {
        if let Some(project) = app.selected_project() {
            render_logs(frame, app, project, theme, layout[1]);
        }
    } else if app.compact {
        frame.render_widget(render_projects(app, theme, size.width), layout[1]);
    } else {
        let rows = app.projects.len() as u16 + 2;
        let body = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(rows.min(layout[1].height / 2)), Constraint::Min(0)])
            .split(layout[1]);
        frame.render_widget(render_projects(app, theme, size.width), body[0]);
        if let Some(project) = app.selected_project() {
            render_logs(frame, app, project, theme, body[1]);
        }
    }
    frame.render_widget(render_footer(app, theme), layout[2]);
}

fn render_header(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let running = app
        .projects
        .iter()
        .filter(|project| project.status() == Status::Running)
        .count();
    let mut fields = vec![
        Span::styled(
            format!("{} ", app.spinner()),
            Style::default().fg(theme.accent),
        ),
        Span::styled(
            format!("{}/{} running", running, app.projects.len()),
            Style::default().fg(theme.text),
        ),
    ];
    if let Some(celsius) = app.temperature {
        let color = if celsius >= 85.0 {
            theme.critical
        } else if celsius >= 70.0 {
            theme.warn
        } else {
            theme.muted
        };
        fields.push(Span::raw("  "));
        fields.push(Span::styled(format!("{celsius:.0}°C"), Style::default().fg(color)));
    }
    if let Some(note) = app.status_note.as_deref() {
        fields.push(Span::raw("  "));
        fields.push(Span::styled(
            ellipsize(note, (width as usize).saturating_sub(30).max(12)),
            Style::default().fg(theme.muted),
        ));
    }
    Paragraph::new(Line::from(fields))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel(app.title.clone(), theme, theme.bg))
}

fn project_line(app: &App, index: usize, project: &Project, theme: Theme, narrow: bool) -> Line<'static> {
    let selected = index == app.selected;
    let status = project.status();
    let marker = if selected { "▶ " } else { "  " };
    let name_width = if narrow { 14 } else { 22 };
    let mut spans = vec![
        Span::styled(marker, Style::default().fg(theme.accent)),
        Span::styled(
            format!("{:<name_width$}", ellipsize(project.name(), name_width)),
            if selected {
                Style::default().fg(theme.text).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(theme.text)
            },
        ),
        Span::styled(
            format!(" {:<7}", project.phase().as_str()),
            Style::default().fg(theme.muted),
        ),
        Span::styled(
            format!(" {:<8}", status.as_str()),
            Style::default().fg(status_color(status, theme)),
        ),
    ];
    if !narrow {
        let uptime = project
            .uptime()
            .filter(|_| status == Status::Running)
            .map(format_uptime)
            .unwrap_or_else(|| "-".to_string());
        spans.push(Span::styled(format!(" {uptime:>7}"), Style::default().fg(theme.muted)));
        let usage = app
            .samples
            .get(&index)
            .map(|sample| format!(" {:>5.1}% {:>6}", sample.cpu_percent, format_bytes(sample.memory_bytes)))
            .unwrap_or_else(|| format!(" {:>6} {:>6}", "-", "-"));
        spans.push(Span::styled(usage, Style::default().fg(theme.muted)));
    }
    if let Some(url) = project.url() {
        spans.push(Span::styled(format!("  {url}"), Style::default().fg(theme.accent)));
    } else if project.phase() == Phase::Error {
        if let Some(code) = project.exit_code() {
            spans.push(Span::styled(
                format!("  exit {code}"),
                Style::default().fg(theme.critical),
            ));
        }
    }
    Line::from(spans)
}

fn render_projects(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let narrow = narrow(width) || app.compact;
    let lines: Vec<Line> = app
        .projects
        .iter()
        .enumerate()
        .map(|(index, project)| project_line(app, index, project, theme, narrow))
        .collect();
    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel("Projects", theme, theme.surface))
}

/// Visible window of `total` lines, `scroll` lines up from the tail.
pub(crate) fn visible_range(total: usize, height: usize, scroll: usize) -> (usize, usize) {
    let end = total.saturating_sub(scroll);
    let start = end.saturating_sub(height);
    (start, end)
}

fn render_logs(frame: &mut Frame, app: &App, project: &Project, theme: Theme, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let logs = project.logs();
    let (start, end) = visible_range(logs.len(), height, app.scroll);
    let lines: Vec<Line> = logs[start..end]
        .iter()
        .map(|line| {
            let lower = line.to_ascii_lowercase();
            let color = if lower.contains("error") || lower.contains("[devrun]") {
                theme.warn
            } else {
                theme.text
            };
            Line::from(Span::styled(line.clone(), Style::default().fg(color)))
        })
        .collect();
    let mut title = format!("Logs · {}", project.name());
    if app.scroll > 0 {
        title.push_str(&format!(" (+{} newer)", app.scroll));
    }
    frame.render_widget(
        Paragraph::new(Text::from(lines))
            .style(Style::default().fg(theme.text).bg(theme.surface))
            .block(panel(title, theme, theme.surface)),
        area,
    );
}

fn render_footer(app: &App, theme: Theme) -> Paragraph<'static> {
    let hint = if app.stopping {
        "stopping projects…"
    } else if app.focused {
        "Esc back · ↑/↓ PgUp/PgDn scroll · o open · q quit"
    } else {
        "↑/↓ select · Enter logs · c compact · o open · q quit"
    };
    Paragraph::new(Span::styled(hint, Style::default().fg(theme.muted)))
        .style(Style::default().bg(theme.bg))
}
