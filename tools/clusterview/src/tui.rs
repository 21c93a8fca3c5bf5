use crate::console::quit_warning;
use crate::engine::{MessageLevel, ViewSnapshot};
use crate::errors::ClusterViewError;
use crate::hotkeys::{dashboard_controls_legend, FILTER_INPUT_LEGEND};
use crate::model::{Entity, Guest, Node, Task, ViewKind};
use crate::pending::PendingKey;
use crate::refresh::RefreshPhase;
use ratatui::backend::TestBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use ratatui::{Frame, Terminal};

/// Terminal-side state that never reaches the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputState {
    /// Text being typed into the filter prompt, if open.
    pub filter_draft: Option<String>,
    /// Set after the first `q` while console sessions are active.
    pub quit_armed: bool,
}

fn gib(bytes: u64) -> String {
    format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

pub fn refresh_summary(view: &ViewSnapshot) -> String {
    let refresh = &view.refresh;
    let mut text = match (refresh.enabled, refresh.phase) {
        (_, RefreshPhase::Fetching) | (_, RefreshPhase::Applying) => "Refreshing...".to_string(),
        (true, _) => format!("Next refresh in {}s", refresh.countdown),
        (false, _) => "Auto-refresh off".to_string(),
    };
    if refresh.last_error.is_some() {
        text.push_str(" (last refresh failed)");
    }
    text
}

fn header_line(view: &ViewSnapshot) -> Line<'static> {
    let mut spans = vec![
        Span::styled(
            "clusterview",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("  {}", refresh_summary(view))),
    ];
    if view.console_sessions > 0 {
        spans.push(Span::styled(
            format!("  consoles={}", view.console_sessions),
            Style::default().fg(Color::Yellow),
        ));
    }
    if !view.pending.is_empty() {
        spans.push(Span::styled(
            format!("  busy={}", view.pending.len()),
            Style::default().fg(Color::Magenta),
        ));
    }
    Line::from(spans)
}

fn tabs_line(view: &ViewSnapshot) -> Line<'static> {
    let spans = ViewKind::ALL
        .into_iter()
        .flat_map(|kind| {
            let total = view.totals.get(&kind).copied().unwrap_or(0);
            let label = format!(" {} {}/{} ", kind.as_str(), view.row_count(kind), total);
            let style = if kind == view.active_view {
                Style::default().fg(Color::Black).bg(Color::Cyan)
            } else {
                Style::default()
            };
            [Span::styled(label, style), Span::raw(" ")]
        })
        .collect::<Vec<_>>();
    Line::from(spans)
}

pub fn node_row(node: &Node) -> String {
    let mut row = format!(
        "{:<12} {:<8} cpu {:>5.1}%  mem {}/{}",
        node.name,
        node.status(),
        node.cpu_usage * 100.0,
        gib(node.memory_used),
        gib(node.memory_total)
    );
    if let Some(version) = &node.details.version {
        row.push_str(&format!("  pve {version}"));
    }
    row
}

pub fn guest_row(guest: &Guest, pending_label: Option<&str>) -> String {
    let mut row = format!(
        "{:>5} {:<16} {:<4} {:<8} {:<8} {}",
        guest.vmid,
        guest.name,
        guest.guest_type.as_str(),
        guest.status,
        guest.node,
        guest.tags
    );
    if let Some(label) = pending_label {
        row.push_str(&format!("  [{label}...]"));
    }
    row
}

pub fn task_row(task: &Task) -> String {
    format!(
        "{:<8} {:<12} {:<10} {:<12} {}",
        task.node,
        task.task_type,
        task.status,
        task.user,
        task.vmid.map(|vmid| vmid.to_string()).unwrap_or_default()
    )
}

fn rows_for(view: &ViewSnapshot) -> Vec<String> {
    match view.active_view {
        ViewKind::Nodes => view.nodes.iter().map(node_row).collect(),
        ViewKind::Guests => view
            .guests
            .iter()
            .map(|guest| {
                let key = PendingKey::Guest(guest.key());
                guest_row(guest, view.pending_label(&key))
            })
            .collect(),
        ViewKind::Tasks => view.tasks.iter().map(task_row).collect(),
    }
}

fn empty_placeholder(view: &ViewSnapshot) -> &'static str {
    if !view.loaded {
        "Loading..."
    } else if view.filter(view.active_view).is_empty() {
        "Nothing to show"
    } else {
        "No rows match the current filter"
    }
}

fn filter_line(view: &ViewSnapshot, input: &InputState) -> String {
    if let Some(draft) = &input.filter_draft {
        return format!("/{draft}_");
    }
    let filter = view.filter(view.active_view);
    if filter.is_empty() {
        return "Filter: none".to_string();
    }
    let mut parts = Vec::new();
    if !filter.text.is_empty() {
        parts.push(format!("text={}", filter.text));
    }
    let structured = &filter.structured;
    for (name, value) in [
        ("status", &structured.status),
        ("type", &structured.kind),
        ("node", &structured.node),
        ("tag", &structured.tag_contains),
    ] {
        if !value.is_empty() && value != crate::filter::ANY {
            parts.push(format!("{name}={value}"));
        }
    }
    format!("Filter: {}", parts.join(" "))
}

fn message_line(view: &ViewSnapshot, input: &InputState) -> Line<'static> {
    if input.quit_armed {
        if let Some(warning) = quit_warning(view.console_sessions) {
            return Line::from(Span::styled(warning, Style::default().fg(Color::Yellow)));
        }
    }
    match &view.message {
        Some(message) => {
            let color = match message.level {
                MessageLevel::Info => Color::Gray,
                MessageLevel::Warn => Color::Yellow,
                MessageLevel::Error => Color::Red,
            };
            Line::from(Span::styled(
                message.text.clone(),
                Style::default().fg(color),
            ))
        }
        None => Line::from(""),
    }
}

pub fn draw(frame: &mut Frame<'_>, view: &ViewSnapshot, input: &InputState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(1),
            Constraint::Length(4),
        ])
        .split(frame.area());

    frame.render_widget(
        Paragraph::new(header_line(view)).block(Block::default().borders(Borders::ALL)),
        chunks[0],
    );
    frame.render_widget(Paragraph::new(tabs_line(view)), chunks[1]);
    draw_rows(frame, view, chunks[2]);
    frame.render_widget(Paragraph::new(filter_line(view, input)), chunks[3]);

    let legend = if input.filter_draft.is_some() {
        FILTER_INPUT_LEGEND.to_string()
    } else {
        dashboard_controls_legend(view.active_view == ViewKind::Guests)
    };
    let footer = Paragraph::new(vec![message_line(view, input), Line::from(legend)])
        .wrap(ratatui::widgets::Wrap { trim: true })
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(footer, chunks[4]);
}

fn draw_rows(frame: &mut Frame<'_>, view: &ViewSnapshot, area: Rect) {
    let title = match view.active_view {
        ViewKind::Nodes => "Nodes",
        ViewKind::Guests => "Guests",
        ViewKind::Tasks => "Tasks",
    };
    let block = Block::default().borders(Borders::ALL).title(title);
    let rows = rows_for(view);
    if rows.is_empty() {
        frame.render_widget(Paragraph::new(empty_placeholder(view)).block(block), area);
        return;
    }
    let items = rows.into_iter().map(ListItem::new).collect::<Vec<_>>();
    let list = List::new(items)
        .block(block)
        .highlight_symbol("> ")
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = ListState::default().with_selected(view.cursor(view.active_view).index());
    frame.render_stateful_widget(list, area, &mut state);
}

/// Renders one frame off-screen and returns it as text, one line per row.
pub fn render_dashboard(
    view: &ViewSnapshot,
    input: &InputState,
    width: u16,
    height: u16,
) -> Result<String, ClusterViewError> {
    let backend = TestBackend::new(width, height);
    let mut terminal = Terminal::new(backend).map_err(|e| ClusterViewError::Io(e.to_string()))?;
    terminal
        .draw(|frame| draw(frame, view, input))
        .map_err(|e| ClusterViewError::Io(e.to_string()))?;

    let mut out = String::new();
    let buffer = terminal.backend().buffer();
    for y in 0..height {
        for x in 0..width {
            out.push_str(buffer[(x, y)].symbol());
        }
        out.push('\n');
    }
    Ok(out)
}
