//! Interactive terminal dashboard
//!
//! Rendering happens on its own OS thread; the bus side only pushes updates
//! into a channel. `q` or Ctrl-C asks the session to stop.

use std::collections::VecDeque;
use std::io::{self, IsTerminal, Stdout};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};

use crate::events::{Observer, SessionEvent};
use crate::models::Transaction;
use crate::transport::ShutdownTrigger;

use super::UiContext;

const TICK: Duration = Duration::from_millis(100);
/// Rows kept for display
const MAX_ROWS: usize = 500;

pub fn construct(ctx: &UiContext) -> Result<Arc<dyn Observer>> {
    if !io::stdout().is_terminal() {
        bail!("stdout is not a terminal");
    }
    Ok(Arc::new(TerminalUi::spawn(ctx.shutdown.clone())?))
}

enum Update {
    Transaction(Arc<Transaction>),
    Status(String),
    Finished(String),
}

pub struct TerminalUi {
    updates: Mutex<Sender<Update>>,
    render_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalUi {
    fn spawn(shutdown: ShutdownTrigger) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("tapline-tui".into())
            .spawn(move || {
                if let Err(e) = run(rx, shutdown) {
                    tracing::error!("Terminal ui stopped: {:#}", e);
                }
            })?;
        Ok(Self {
            updates: Mutex::new(tx),
            render_thread: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, update: Update) -> Result<()> {
        self.updates
            .lock()
            .map_err(|_| anyhow!("terminal ui channel poisoned"))?
            .send(update)
            .map_err(|_| anyhow!("terminal ui has exited"))
    }

    /// Wait for the render thread so the terminal is restored before exit.
    fn join(&self) {
        let handle = self.render_thread.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Observer for TerminalUi {
    fn name(&self) -> &str {
        "terminal-ui"
    }

    fn on_event(&self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::TransactionObserved(tx) => self.send(Update::Transaction(tx.clone())),
            SessionEvent::SessionStarted(info) => {
                let mut status = format!("{}", info.mode);
                if let Some(addr) = info.proxy {
                    status.push_str(&format!(" | proxy {addr}"));
                }
                if let Some(addr) = info.relay_server {
                    status.push_str(&format!(" | relay {addr}"));
                }
                if let Some(target) = &info.relay_target {
                    status.push_str(&format!(" | from {target}"));
                }
                self.send(Update::Status(status))
            }
            SessionEvent::EndpointFailed { endpoint, cause } => {
                self.send(Update::Status(format!("{endpoint} unavailable: {cause}")))
            }
            SessionEvent::SessionStopped => {
                let _ = self.send(Update::Finished("stopped".into()));
                self.join();
                Ok(())
            }
            SessionEvent::SessionFailed { cause } => {
                let _ = self.send(Update::Finished(format!("failed: {cause}")));
                self.join();
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct Dashboard {
    rows: VecDeque<Arc<Transaction>>,
    status: String,
}

impl Dashboard {
    fn apply(&mut self, update: Update) -> bool {
        match update {
            Update::Transaction(tx) => {
                self.rows.push_front(tx);
                self.rows.truncate(MAX_ROWS);
            }
            Update::Status(status) => self.status = status,
            Update::Finished(status) => {
                self.status = status;
                return false;
            }
        }
        true
    }

    fn render(&self, frame: &mut Frame) {
        let [header, body, footer] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .areas(frame.area());

        frame.render_widget(
            Paragraph::new(Line::from(format!(" tapline {}", self.status)))
                .style(Style::default().add_modifier(Modifier::BOLD)),
            header,
        );

        let rows = self.rows.iter().map(|tx| {
            let style = match tx.response_code {
                200..=299 => Style::default().fg(Color::Green),
                300..=399 => Style::default().fg(Color::Cyan),
                400..=499 => Style::default().fg(Color::Yellow),
                _ => Style::default().fg(Color::Red),
            };
            Row::new(vec![
                tx.method.to_string(),
                tx.response_code.to_string(),
                tx.duration_str(),
                tx.size_str(),
                tx.uri.clone(),
            ])
            .style(style)
        });
        let table = Table::new(
            rows,
            [
                Constraint::Length(8),
                Constraint::Length(4),
                Constraint::Length(8),
                Constraint::Length(9),
                Constraint::Min(10),
            ],
        )
        .header(
            Row::new(vec!["Method", "Code", "Time", "Size", "URI"])
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Transactions ({}) ", self.rows.len())),
        );
        frame.render_widget(table, body);

        frame.render_widget(Paragraph::new(" q: quit"), footer);
    }
}

fn run(rx: Receiver<Update>, shutdown: ShutdownTrigger) -> Result<()> {
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    enable_raw_mode()?;
    execute!(io::stdout(), EnterAlternateScreen)?;
    terminal.hide_cursor()?;
    terminal.clear()?;

    let result = event_loop(&mut terminal, &rx, &shutdown);

    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    rx: &Receiver<Update>,
    shutdown: &ShutdownTrigger,
) -> Result<()> {
    let mut dashboard = Dashboard::default();
    loop {
        let mut running = match rx.recv_timeout(TICK) {
            Ok(update) => dashboard.apply(update),
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        };
        while running {
            match rx.try_recv() {
                Ok(update) => running = dashboard.apply(update),
                Err(_) => break,
            }
        }

        terminal.draw(|frame| dashboard.render(frame))?;
        if !running {
            return Ok(());
        }

        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                let quit = key.kind == KeyEventKind::Press
                    && (key.code == KeyCode::Char('q')
                        || (key.code == KeyCode::Char('c')
                            && key.modifiers.contains(KeyModifiers::CONTROL)));
                if quit {
                    shutdown.trigger();
                }
            }
        }
    }
}
