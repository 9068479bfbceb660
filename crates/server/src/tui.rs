use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState};

use crate::server::{PeerInfo, ServerStats};

const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

pub struct TuiState {
    log: VecDeque<(LogLevel, String)>,
    selected: usize,
    pending_kick: Option<SocketAddr>,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            log: VecDeque::new(),
            selected: 0,
            pending_kick: None,
        }
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    fn push(&mut self, level: LogLevel, message: String) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }

    pub fn select_prev(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + count - 1) % count;
        }
    }

    pub fn select_next(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + 1) % count;
        }
    }

    pub fn request_kick(&mut self, peers: &[PeerInfo]) {
        self.pending_kick = peers.get(self.selected).map(|p| p.addr);
    }

    pub fn take_pending_kick(&mut self) -> Option<SocketAddr> {
        self.pending_kick.take()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &ServerStats) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(5),
            Constraint::Length(8),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_capacity(frame, chunks[1], stats);
    render_network(frame, chunks[2], stats);
    render_peers(frame, chunks[3], state, stats);
    render_log(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn bordered(title: &str, color: Color) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color))
}

fn render_header(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let title = format!(" Meridian Server - Uptime: {} ", format_duration(stats.uptime));
    let text = format!(
        "Tick: {}  |  Peers: {}  |  Entities: {}",
        stats.tick, stats.client_count, stats.entity_count
    );
    let paragraph = Paragraph::new(text)
        .block(bordered(&title, Color::Cyan))
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let max = stats.max_clients.max(1);
    let gauge = Gauge::default()
        .block(bordered(" Capacity ", Color::Green))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio((stats.client_count as f64 / max as f64).min(1.0))
        .label(format!("{}/{} peers", stats.client_count, stats.max_clients));
    frame.render_widget(gauge, area);
}

fn render_network(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let net = &stats.socket;
    let resent: u64 = stats.peers.iter().map(|p| p.stats.messages_resent).sum();
    let dropped: u64 = stats.peers.iter().map(|p| p.stats.messages_dropped).sum();

    let row = |label: &'static str, value: String| {
        Line::from(vec![
            Span::styled(label, Style::default().fg(Color::Gray)),
            Span::styled(value, Style::default().fg(Color::White)),
        ])
    };
    let lines = vec![
        row(
            "Packets: ",
            format!("{} sent / {} recv", net.packets_sent, net.packets_received),
        ),
        row(
            "Bytes: ",
            format!(
                "{} sent / {} recv",
                format_bytes(net.bytes_sent),
                format_bytes(net.bytes_received)
            ),
        ),
        row("Resent: ", resent.to_string()),
        row("Duplicates dropped: ", dropped.to_string()),
    ];

    frame.render_widget(
        Paragraph::new(lines).block(bordered(" Network ", Color::Yellow)),
        area,
    );
}

fn render_peers(frame: &mut Frame, area: Rect, state: &TuiState, stats: &ServerStats) {
    let header = Row::new(["Address", "Entity", "Ping", "Jitter", "Unacked", "Neighbors"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = stats.peers.iter().map(|peer| {
        Row::new([
            peer.addr.to_string(),
            peer.entity.map_or_else(|| "-".into(), |e| e.to_string()),
            peer.ping_ms.map_or_else(|| "-".into(), |p| format!("{p:.1}ms")),
            format!("{:.1}ms", peer.jitter_ms),
            peer.unacked.to_string(),
            peer.neighbors.to_string(),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(22),
            Constraint::Length(10),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(10),
        ],
    )
    .header(header)
    .block(bordered(" Peers ", Color::Magenta))
    .row_highlight_style(Style::default().bg(Color::DarkGray));

    let mut table_state = TableState::default();
    if !stats.peers.is_empty() {
        table_state.select(Some(state.selected.min(stats.peers.len() - 1)));
    }
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .iter()
        .skip(state.log.len().saturating_sub(visible))
        .map(|(level, message)| {
            let color = match level {
                LogLevel::Info => Color::White,
                LogLevel::Warn => Color::Yellow,
            };
            Line::styled(message.as_str(), Style::default().fg(color))
        })
        .collect();

    frame.render_widget(
        Paragraph::new(lines).block(bordered(" Log ", Color::Blue)),
        area,
    );
}

fn render_help(frame: &mut Frame, area: Rect) {
    let text = Paragraph::new("q/Esc quit  |  Up/Down select peer  |  k kick")
        .block(bordered(" Controls ", Color::DarkGray))
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );
    frame.render_widget(text, area);
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_and_duration_formatting() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0MB");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn log_is_bounded() {
        let mut state = TuiState::new();
        for i in 0..MAX_LOG_LINES + 10 {
            state.log_info(format!("line {i}"));
        }
        assert_eq!(state.log.len(), MAX_LOG_LINES);
        assert_eq!(state.log.front().map(|(_, m)| m.as_str()), Some("line 10"));
    }

    #[test]
    fn selection_wraps() {
        let mut state = TuiState::new();
        state.select_prev(3);
        assert_eq!(state.selected, 2);
        state.select_next(3);
        assert_eq!(state.selected, 0);
    }
}
