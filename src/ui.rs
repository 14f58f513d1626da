use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::AppState;
use crate::channel::{ChannelSnapshot, ChannelState};
use crate::interface::InterfaceMode;
use crate::register_map::{ChannelId, RegisterRole};

pub fn render_ui(frame: &mut Frame, app: &AppState) {
    let mut constraints = vec![
        Constraint::Length(1),
        Constraint::Length(3),
        Constraint::Length(10),
    ];
    if app.show_registers {
        let table_lines = app.registers.len().div_ceil(2);
        let table_height = u16::try_from(table_lines + 2).unwrap_or(u16::MAX);
        constraints.push(Constraint::Length(table_height));
    }
    constraints.push(Constraint::Length(3));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(frame.area());

    let mut index = 0;
    render_header(frame, chunks[index]);
    index += 1;
    render_status(frame, chunks[index], app);
    index += 1;
    render_channels(frame, chunks[index], app);
    index += 1;
    if app.show_registers {
        render_registers(frame, chunks[index], app);
        index += 1;
    }
    render_help(frame, chunks[index]);
}

fn render_header(frame: &mut Frame, area: Rect) {
    let title = Line::from(vec![Span::styled(
        "VIAFLO Pipette Bridge",
        Style::default()
            .fg(Color::LightMagenta)
            .add_modifier(Modifier::BOLD),
    )]);

    let paragraph = Paragraph::new(title).alignment(Alignment::Center);
    frame.render_widget(paragraph, area);
}

fn render_status(frame: &mut Frame, area: Rect, app: &AppState) {
    let mode_color = if app.interface == InterfaceMode::Simulation {
        Color::Yellow
    } else {
        Color::Blue
    };

    let mut spans = vec![
        Span::styled("Modbus: ", Style::default().fg(Color::Gray)),
        Span::raw(app.bind.to_string()),
        Span::raw("  "),
        Span::styled("Mode: ", Style::default().fg(Color::Gray)),
        Span::styled(
            app.interface.label(),
            Style::default().fg(mode_color).add_modifier(Modifier::BOLD),
        ),
    ];
    if let Some(notice) = &app.notice {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            notice.clone(),
            Style::default().fg(Color::LightYellow),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Status")
            .border_style(Style::default().fg(Color::LightMagenta)),
    );
    frame.render_widget(paragraph, area);
}

fn render_channels(frame: &mut Frame, area: Rect, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    for id in ChannelId::ALL {
        render_channel(frame, chunks[id.index()], app.channel(id));
    }
}

fn state_style(state: ChannelState) -> Style {
    let color = match state {
        ChannelState::Idle => Color::Green,
        ChannelState::Busy => Color::LightYellow,
        ChannelState::Faulted => Color::Red,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn render_channel(frame: &mut Frame, area: Rect, snapshot: &ChannelSnapshot) {
    let label = |text: &'static str| Span::styled(text, Style::default().fg(Color::Gray));
    let command = snapshot
        .current_command
        .map_or_else(|| "-".to_string(), |command| command.to_string());
    let completion = if snapshot.completion { "yes" } else { "no" };

    let mut lines = vec![
        Line::from(vec![
            label("State: "),
            Span::styled(snapshot.state.label(), state_style(snapshot.state)),
            Span::raw("  "),
            label("Complete: "),
            Span::raw(completion),
        ]),
        Line::from(vec![label("Running: "), Span::raw(command)]),
        Line::from(vec![
            label("Volume: "),
            Span::raw(snapshot.params.volume.to_string()),
            Span::raw("  "),
            label("Dispense: "),
            Span::raw(snapshot.params.dispense_amount.to_string()),
            Span::raw("  "),
            label("Speed: "),
            Span::raw(snapshot.params.speed.to_string()),
        ]),
        Line::from(vec![
            label("Accepted: "),
            Span::raw(snapshot.accepted.to_string()),
            Span::raw("  "),
            label("Rejected: "),
            Span::raw(snapshot.rejected.to_string()),
        ]),
        Line::from(vec![
            label("Completed: "),
            Span::raw(snapshot.completed.to_string()),
            Span::raw("  "),
            label("Faults: "),
            Span::raw(snapshot.faults.to_string()),
        ]),
    ];
    if let Some(err) = &snapshot.last_error {
        lines.push(Line::from(vec![
            label("Last error: "),
            Span::styled(err.clone(), Style::default().fg(Color::Red)),
        ]));
    }

    let title = format!("Channel {}", snapshot.id.number());
    let paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(Color::LightCyan)),
        )
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn render_registers(frame: &mut Frame, area: Rect, app: &AppState) {
    let column_width: usize = 36;
    let mut lines = Vec::new();
    let mut row_spans: Vec<Span> = Vec::new();

    for (index, (address, role)) in app.registers.iter().enumerate() {
        let value = live_value(app, *role).map_or_else(String::new, |value| format!("= {value}"));
        let address = format!("{address:>5} ");
        let rest = format!("{:<22} {value}", role.to_string());
        let entry_len = address.len() + rest.len();

        row_spans.push(Span::styled(
            address,
            Style::default()
                .fg(Color::LightCyan)
                .add_modifier(Modifier::BOLD),
        ));
        row_spans.push(Span::raw(rest));

        if index % 2 == 0 {
            let padding = column_width.saturating_sub(entry_len);
            row_spans.push(Span::raw(" ".repeat(padding)));
        } else {
            lines.push(Line::from(row_spans));
            row_spans = Vec::new();
        }
    }
    if !row_spans.is_empty() {
        lines.push(Line::from(row_spans));
    }

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Registers")
            .border_style(Style::default().fg(Color::LightGreen)),
    );
    frame.render_widget(paragraph, area);
}

fn live_value(app: &AppState, role: RegisterRole) -> Option<u16> {
    match role {
        RegisterRole::Completion(id) => Some(u16::from(app.channel(id).completion)),
        RegisterRole::Status(id) => Some(app.channel(id).state.code()),
        RegisterRole::Command(..) | RegisterRole::Reset(_) => None,
    }
}

fn render_help(frame: &mut Frame, area: Rect) {
    let text = Line::from(vec![
        Span::styled("1/2", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" reset faulted channel  "),
        Span::styled("d", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" registers  "),
        Span::styled("q", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(" quit"),
    ]);
    let paragraph = Paragraph::new(text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Controls")
                .border_style(Style::default().fg(Color::LightMagenta)),
        )
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
