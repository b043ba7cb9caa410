use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use transcoder::{
    config::TranscodeConfig,
    job::{FileJobStore, JobRecord, JobStore},
    status::{StatusProjector, StatusView, STATE_DATA_CORRUPTED, STATE_FAILED, STATE_PROCESSING},
    task::FileTaskBackend,
    tracker::{JobProgressTracker, ProfileStatus},
};

/// One table row: the job record and its projected status
struct JobRow {
    record: JobRecord,
    view: Option<StatusView>,
    output_bytes: Option<u64>,
}

struct App {
    cfg: TranscodeConfig,
    jobs: FileJobStore,
    tasks: FileTaskBackend,
    rows: Vec<JobRow>,
    system: System,
    table_state: TableState,
    should_quit: bool,
}

impl App {
    fn new(cfg: TranscodeConfig) -> Result<Self> {
        let jobs = FileJobStore::new(cfg.jobs_dir())?;
        let tasks = FileTaskBackend::new(cfg.tasks_dir())
            .with_context(|| format!("Failed to open task state directory: {}", cfg.tasks_dir().display()))?;
        Ok(Self {
            cfg,
            jobs,
            tasks,
            rows: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
        })
    }

    fn refresh(&mut self) -> Result<()> {
        self.system.refresh_all();

        let mut records = match self.jobs.list() {
            Ok(records) => records,
            // Shown as an empty table
            Err(_e) => Vec::new(),
        };
        // Newest first
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let projector = StatusProjector::new(&self.jobs, &self.tasks, self.cfg.download_url_base.clone());
        self.rows = records
            .into_iter()
            .map(|record| {
                let view = projector.project(&record.task_id).ok();
                let output_bytes = view
                    .as_ref()
                    .and_then(|v| v.details.as_ref())
                    .and_then(|tracker| output_size(&self.cfg, &record.task_id, tracker));
                JobRow {
                    record,
                    view,
                    output_bytes,
                }
            })
            .collect();

        Ok(())
    }

    fn count_by_state(&self, state: &str) -> usize {
        self.rows
            .iter()
            .filter(|r| r.view.as_ref().map(|v| v.state == state).unwrap_or(false))
            .count()
    }

    fn finished(&self) -> usize {
        ["COMPLETED", "PARTIAL_SUCCESS", STATE_FAILED, STATE_DATA_CORRUPTED]
            .iter()
            .map(|s| self.count_by_state(s))
            .sum()
    }
}

/// Total size of the completed renditions of one job
fn output_size(cfg: &TranscodeConfig, job_id: &str, tracker: &JobProgressTracker) -> Option<u64> {
    let sizes: Vec<u64> = tracker
        .completed_profiles()
        .into_iter()
        .filter_map(|profile| std::fs::metadata(cfg.output_path(job_id, profile)).ok())
        .map(|m| m.len())
        .collect();
    if sizes.is_empty() {
        None
    } else {
        Some(sizes.iter().sum())
    }
}

/// StreamScale job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Same default location as the worker
    let default_config_path = PathBuf::from("/etc/streamscale/config.toml");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = TranscodeConfig::load_config(config_path)
        .context("Failed to load configuration")?;
    let mut app = App::new(cfg)?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    loop {
        app.refresh()?;
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh()?,
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let done_percent = if app.rows.is_empty() {
        0.0
    } else {
        clamp_percent(app.finished() as f64 / app.rows.len() as f64 * 100.0)
    };

    let gauges = [
        ("CPU", Color::Cyan, cpu_usage, format!("{:.1}%", cpu_usage)),
        ("Memory", Color::Green, memory_percent, format!("{:.1}%", memory_percent)),
        (
            "Jobs finished",
            Color::Magenta,
            done_percent,
            format!("{}/{}", app.finished(), app.rows.len()),
        ),
    ];
    for (chunk, (title, color, percent, label)) in chunks.iter().zip(gauges) {
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title(title))
            .gauge_style(Style::default().fg(color))
            .percent(percent as u16)
            .label(label);
        f.render_widget(gauge, *chunk);
    }
}

fn short_state(state: &str) -> &'static str {
    match state {
        STATE_PROCESSING => "RUN",
        "COMPLETED" => "OK",
        "PARTIAL_SUCCESS" => "PART",
        STATE_FAILED => "FAIL",
        STATE_DATA_CORRUPTED => "CORR",
        _ => "PEND",
    }
}

/// `360p ✓ 720p 42% 1080p ·` style per-profile summary
fn profile_summary(tracker: &JobProgressTracker) -> String {
    tracker
        .iter()
        .map(|(name, p)| match p.status {
            ProfileStatus::Queued => format!("{} ·", name),
            ProfileStatus::Running => format!("{} {}%", name, p.percent),
            ProfileStatus::Completed => format!("{} ✓", name),
            ProfileStatus::Failed => format!("{} ✗", name),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_age(seconds: i64) -> String {
    match seconds {
        s if s < 60 => format!("{}s", s.max(0)),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "JOB", "FILE", "PROG", "PROFILES", "OUT", "AGE", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = if app.rows.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Dir: {}", app.cfg.jobs_dir().display()),
        ])]
    } else {
        app.rows
            .iter()
            .take(max_data_rows)
            .map(|row| {
                let (state, progress, profiles, error) = match &row.view {
                    Some(view) => (
                        short_state(&view.state),
                        format!("{}%", view.overall_progress),
                        view.details.as_ref().map(profile_summary).unwrap_or_default(),
                        view.error.clone().unwrap_or_else(|| "-".to_string()),
                    ),
                    None => ("?", "-".to_string(), String::new(), "-".to_string()),
                };
                let style = match state {
                    "RUN" => Style::default().fg(Color::Yellow),
                    "FAIL" | "CORR" => Style::default().fg(Color::Red),
                    "PART" => Style::default().fg(Color::LightYellow),
                    "OK" => Style::default().fg(Color::Green),
                    _ => Style::default(),
                };

                Row::new(vec![
                    state.to_string(),
                    truncate_string(&row.record.task_id, 8),
                    truncate_string(&row.record.filename, 40),
                    progress,
                    profiles,
                    row.output_bytes
                        .map(|b| format_size(b, DECIMAL))
                        .unwrap_or_else(|| "-".to_string()),
                    format_age((now - row.record.created_at).num_seconds()),
                    truncate_string(&error, 40),
                ])
                .style(style)
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(4),
        Constraint::Length(8),
        Constraint::Percentage(25),
        Constraint::Length(5),
        Constraint::Length(28),
        Constraint::Length(9),
        Constraint::Length(4),
        Constraint::Percentage(25),
    ];

    let title = format!("Jobs ({}/{})", app.rows.len().min(max_data_rows), app.rows.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let status_text = format!(
        "Total: {} | Running: {} | Completed: {} | Partial: {} | Failed: {} | Workers: {} | Dir: {} | q=quit r=refresh",
        app.rows.len(),
        app.count_by_state(STATE_PROCESSING),
        app.count_by_state("COMPLETED"),
        app.count_by_state("PARTIAL_SUCCESS"),
        app.count_by_state(STATE_FAILED) + app.count_by_state(STATE_DATA_CORRUPTED),
        app.cfg.workers,
        truncate_string(&app.cfg.state_dir.display().to_string(), 30),
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Truncate to at most `max_len` characters, marking the cut with `...`
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}
