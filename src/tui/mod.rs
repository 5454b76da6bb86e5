// src/tui/mod.rs
use crate::core::engine::EngineStatus;
use crate::types::{Action, TradeStatus, UiEvent};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use std::{io, time::Duration};
use tokio::sync::mpsc;

const MAX_ROWS: usize = 50;

fn push_bounded(rows: &mut Vec<String>, row: String) {
    rows.push(row);
    if rows.len() > MAX_ROWS {
        rows.remove(0);
    }
}

pub struct App {
    pub symbol: String,
    pub current_price: Option<f64>,
    pub decisions: Vec<String>,
    pub trades: Vec<String>,
    pub logs: Vec<String>,
    pub status: Option<EngineStatus>,
}

impl App {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            current_price: None,
            decisions: Vec::new(),
            trades: Vec::new(),
            logs: Vec::new(),
            status: None,
        }
    }

    pub fn on_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::PriceUpdate { symbol, price } => {
                self.symbol = symbol;
                self.current_price = Some(price);
            }
            UiEvent::Decision(d) => {
                let msg = format!(
                    "{} {:.6} ({}%) {}",
                    d.action.to_string().to_uppercase(),
                    d.amount,
                    d.confidence,
                    d.reason
                );
                push_bounded(&mut self.decisions, msg);
            }
            UiEvent::TradeExecuted(t) => {
                let tag = match t.status {
                    TradeStatus::Filled => "",
                    TradeStatus::Simulated => " [sim]",
                };
                let msg = format!(
                    "{} {} {:.6} @ {:.2} pnl {:.2}{}",
                    t.timestamp.format("%H:%M:%S"),
                    t.side.as_str().to_uppercase(),
                    t.amount,
                    t.price,
                    t.profit,
                    tag
                );
                push_bounded(&mut self.trades, msg);
            }
            UiEvent::Status(status) => {
                self.status = Some(*status);
            }
            UiEvent::Log(msg) => push_bounded(&mut self.logs, msg),
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<UiEvent>, symbol: String) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(symbol);

    loop {
        terminal.draw(|f| ui(f, &app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if let KeyCode::Char('q') = key.code {
                    break;
                }
            }
        }

        while let Ok(event) = rx.try_recv() {
            app.on_event(event);
        }
    }

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    Ok(())
}

fn status_line(status: &Option<EngineStatus>) -> String {
    match status {
        Some(s) => format!(
            "{:?}{} | trades {} | win {:.1}% | net {:.2} | roi {:.2}% | dd {:.2}% | pos {:.6} @ {:.2} | cache hits {}",
            s.state,
            if s.dry_run { " (dry run)" } else { "" },
            s.total_trades,
            s.win_rate * 100.0,
            s.net_profit,
            s.roi * 100.0,
            s.current_drawdown * 100.0,
            s.position.amount,
            s.position.entry_price,
            s.advisor_cache_hits
        ),
        None => "Waiting for first tick...".to_string(),
    }
}

fn ui(f: &mut ratatui::Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(8),
            ]
            .as_ref(),
        )
        .split(f.size());

    let price_text = match app.current_price {
        Some(p) => format!("${:.2}", p),
        None => "Waiting for data...".to_string(),
    };

    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!("AI Trader [{}]", app.symbol),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | Price: "),
        Span::styled(
            price_text,
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    ]))
    .block(Block::default().borders(Borders::ALL).title("Market"));
    f.render_widget(header, chunks[0]);

    let status = Paragraph::new(status_line(&app.status))
        .block(Block::default().borders(Borders::ALL).title("Engine"));
    f.render_widget(status, chunks[1]);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(chunks[2]);

    let decisions: Vec<ListItem> = app
        .decisions
        .iter()
        .rev()
        .map(|s| {
            let color = if s.starts_with(&Action::Buy.to_string().to_uppercase()) {
                Color::Green
            } else if s.starts_with(&Action::Sell.to_string().to_uppercase()) {
                Color::Red
            } else {
                Color::Gray
            };
            ListItem::new(Line::from(Span::styled(s, Style::default().fg(color))))
        })
        .collect();
    let decisions_list = List::new(decisions)
        .block(Block::default().borders(Borders::ALL).title("Decisions"));
    f.render_widget(decisions_list, middle[0]);

    let trades: Vec<ListItem> = app
        .trades
        .iter()
        .rev()
        .map(|s| ListItem::new(Line::from(Span::styled(s, Style::default().fg(Color::Cyan)))))
        .collect();
    let trades_list =
        List::new(trades).block(Block::default().borders(Borders::ALL).title("Trades"));
    f.render_widget(trades_list, middle[1]);

    let logs: Vec<ListItem> = app
        .logs
        .iter()
        .rev()
        .map(|s| ListItem::new(Line::from(Span::raw(s))))
        .collect();

    let logs_list =
        List::new(logs).block(Block::default().borders(Borders::ALL).title("System Logs"));
    f.render_widget(logs_list, chunks[3]);
}
