//! Agents (health and capacity per agent)
//! Jobs (every job each agent still holds)
//! Events (recent refresh errors)

use std::{
  error::Error,
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use aptfleet::{
  config::load_agent_configs,
  models::{HealthReport, JobView},
  registry::AgentRegistry,
};
use chrono::{DateTime, Utc};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

const MAX_EVENTS: usize = 20;

struct AgentInfo {
  agent_id: String,
  endpoint: String,
  health: Option<HealthReport>,
}

struct AgentJob {
  agent_id: String,
  job: JobView,
}

struct EventEntry {
  timestamp: DateTime<Utc>,
  message: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Agents,
  Jobs,
  Events,
}

#[derive(Default)]
struct Snapshot {
  agents: Vec<AgentInfo>,
  jobs: Vec<AgentJob>,
  errors: Vec<String>,
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
  events: Vec<EventEntry>,
  refreshed_at: Option<DateTime<Utc>>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Agents,
      snapshot: Snapshot::default(),
      events: vec![],
      refreshed_at: None,
    }
  }

  fn apply(&mut self, snapshot: Snapshot) {
    let now = Utc::now();
    for message in &snapshot.errors {
      self.events.insert(0, EventEntry {
        timestamp: now,
        message: message.clone(),
      });
    }
    self.events.truncate(MAX_EVENTS);
    self.snapshot = snapshot;
    self.refreshed_at = Some(now);
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Agents => DashboardTab::Jobs,
      DashboardTab::Jobs => DashboardTab::Events,
      DashboardTab::Events => DashboardTab::Agents,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Agents => DashboardTab::Events,
      DashboardTab::Jobs => DashboardTab::Agents,
      DashboardTab::Events => DashboardTab::Jobs,
    }
  }
}

async fn fetch_fleet_state(registry: &AgentRegistry) -> Snapshot {
  let mut snapshot = Snapshot::default();
  for agent_id in registry.list_agents().await {
    let endpoint = registry.config(&agent_id).await.map(|c| c.endpoint).unwrap_or_default();
    let client = match registry.get_client(&agent_id).await {
      Ok(client) => client,
      Err(e) => {
        snapshot.errors.push(format!("{}: {}", agent_id, e));
        continue;
      }
    };

    let health = match client.health().await {
      Ok(report) => Some(report),
      Err(e) => {
        snapshot.errors.push(format!("{}: health check failed: {}", agent_id, e));
        None
      }
    };
    if health.is_some() {
      match client.list_jobs().await {
        Ok(list) => snapshot.jobs.extend(list.jobs.into_iter().map(|job| AgentJob {
          agent_id: agent_id.clone(),
          job,
        })),
        Err(e) => snapshot.errors.push(format!("{}: listing jobs failed: {}", agent_id, e)),
      }
    }
    snapshot.agents.push(AgentInfo {
      agent_id,
      endpoint,
      health,
    });
  }
  snapshot.jobs.sort_by(|a, b| b.job.created_at.cmp(&a.job.created_at));
  snapshot
}

fn main() -> Result<(), Box<dyn Error>> {
  let fleet_file = std::env::var("FLEET_AGENTS_FILE").unwrap_or_else(|_| "agents.json".to_string());
  let configs = load_agent_configs(&fleet_file)?;
  let rt = Runtime::new()?;
  let registry = Arc::new(rt.block_on(AgentRegistry::from_configs(configs))?);

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<Snapshot>();

  {
    let registry = Arc::clone(&registry);
    thread::spawn(move || {
      let rt_bg = match Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return,
      };
      loop {
        let snapshot = rt_bg.block_on(fetch_fleet_state(&registry));
        if tx.send(snapshot).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.apply(snapshot);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right | KeyCode::Tab => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  rt.block_on(registry.cleanup());
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Agents", "Jobs", "Events"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Fleet"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Agents => 0,
      DashboardTab::Jobs => 1,
      DashboardTab::Events => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Agents => render_agents(f, app, chunks[1]),
    DashboardTab::Jobs => render_jobs(f, app, chunks[1]),
    DashboardTab::Events => render_events(f, app, chunks[1]),
  }

  let refreshed = app
    .refreshed_at
    .map(|t| t.format("%H:%M:%S").to_string())
    .unwrap_or_else(|| "never".into());
  let footer = Paragraph::new(format!("←/→: Switch Tabs | q: Quit | Refreshed: {}", refreshed))
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_agents<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .agents
    .iter()
    .map(|a| {
      let (status, color, detail) = match &a.health {
        Some(h) => (
          h.status.clone(),
          if h.status == "healthy" { Color::Green } else { Color::Yellow },
          format!(
            "Mode: {:?} | Running: {}/{} | Queued: {} | Total jobs: {} | Up: {:.0}s",
            h.mode, h.active_jobs, h.max_concurrent, h.queued_jobs, h.total_jobs, h.uptime_seconds
          ),
        ),
        None => ("unreachable".to_string(), Color::Red, "No response".to_string()),
      };
      ListItem::new(vec![
        Spans::from(vec![
          Span::styled(format!("{} ", a.agent_id), Style::default().add_modifier(Modifier::BOLD)),
          Span::styled(status, Style::default().fg(color)),
        ]),
        Spans::from(Span::raw(format!("Endpoint: {}", a.endpoint))),
        Spans::from(Span::raw(detail)),
      ])
    })
    .collect();

  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Agents"));
  f.render_widget(list, area);
}

fn render_jobs<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .jobs
    .iter()
    .map(|j| {
      let progress = j.job.progress.unwrap_or(0.0);
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", j.job.job_id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
          "Agent: {} | {} | {:?} | {:.0}% | {}",
          j.agent_id, j.job.status, j.job.priority, progress, j.job.message
        )),
      ]))
    })
    .collect();
  let header = format!("Jobs ({})", app.snapshot.jobs.len());
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(list, area);
}

fn render_events<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .events
    .iter()
    .map(|e| {
      ListItem::new(Spans::from(vec![
        Span::styled(e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Green)),
        Span::raw(" - "),
        Span::raw(e.message.as_str()),
      ]))
    })
    .collect();
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Refresh Errors"));
  f.render_widget(list, area);
}
