pub mod app;
pub mod config;
pub mod console;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod hotkeys;
pub mod logging;
pub mod model;
pub mod operations;
pub mod pending;
pub mod refresh;
pub mod runtime;
pub mod selection;
pub mod simulated;
pub mod source;
pub mod store;
pub mod tui;

use app::{handle_key, KeyFlow, KeyInput};
use clap::{error::ErrorKind, Parser};
use config::{load_config, AppConfig, CliOverrides};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use engine::{wait_for_view, ChannelSurface, Collaborators, Engine, ViewSnapshot};
use errors::ClusterViewError;
use logging::{append_run_log, init_run_log, structured_fallback_line};
use model::ViewKind;
use ratatui::backend::CrosstermBackend;
use runtime::{FileSystem, ProductionRuntime};
use serde_json::json;
use simulated::SimulatedCluster;
use std::sync::Arc;
use std::time::Duration;
use tui::InputState;

const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
const INPUT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Parser)]
#[command(name = "clusterview")]
#[command(about = "Terminal dashboard for a virtualization cluster")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long = "refresh-interval")]
    pub refresh_interval: Option<u32>,
    #[arg(long, default_value_t = false)]
    pub no_auto_refresh: bool,
    /// Print one refreshed snapshot as plain lines and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
    #[arg(long)]
    pub log_path: Option<std::path::PathBuf>,
}

pub fn run() -> Result<i32, ClusterViewError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    runtime: &ProductionRuntime,
) -> Result<i32, ClusterViewError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ClusterViewError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        profile: cli.profile.clone(),
        refresh_interval: cli.refresh_interval,
        no_auto_refresh: cli.no_auto_refresh,
        log_path: cli.log_path.clone(),
    };
    let cfg = load_config(&overrides, runtime.file_system.as_ref())?;
    if let Some(logger) = cfg.run_logger() {
        init_run_log(logger);
    }
    append_run_log(
        "info",
        "run.started",
        json!({
            "profile": cfg.cluster.profile,
            "once": cli.once,
            "refresh_interval_secs": cfg.refresh.interval_secs,
            "auto_refresh": cfg.refresh.auto_start,
        }),
    );

    let cluster = load_cluster(&cfg, runtime.file_system.as_ref())?;
    let code = if cli.once || !runtime.terminal.stdin_is_tty() {
        run_once(&cfg, cluster, runtime)?
    } else {
        run_interactive(&cfg, cluster, runtime)?
    };
    append_run_log("info", "run.finished", json!({ "exit_code": code }));
    Ok(code)
}

pub fn load_cluster(
    cfg: &AppConfig,
    fs: &dyn FileSystem,
) -> Result<SimulatedCluster, ClusterViewError> {
    match &cfg.cluster.inventory {
        Some(path) => {
            let text = fs.read_to_string(path)?;
            SimulatedCluster::from_toml_str(&cfg.cluster.profile, &text)
        }
        None => Ok(SimulatedCluster::demo(&cfg.cluster.profile)),
    }
}

fn collaborators(cluster: &SimulatedCluster, runtime: &ProductionRuntime) -> Collaborators {
    Collaborators {
        source: Arc::new(cluster.clone()),
        invoker: Arc::new(cluster.clone()),
        sessions: Some(Arc::new(cluster.clone())),
        clock: runtime.clock.clone(),
        waiter: None,
    }
}

/// One-shot mode for pipes and scripts: load once, print fallback lines.
fn run_once(
    cfg: &AppConfig,
    cluster: SimulatedCluster,
    runtime: &ProductionRuntime,
) -> Result<i32, ClusterViewError> {
    let mut settings = cfg.engine_settings();
    settings.auto_refresh = false;
    settings.fetch_node_details = false;
    let (surface, frames) = ChannelSurface::new();
    let engine = Engine::start(
        collaborators(&cluster, runtime),
        settings,
        Box::new(surface),
    )?;
    let view = wait_for_view(&frames, FIRST_SNAPSHOT_TIMEOUT, |view| {
        view.loaded || view.refresh.last_error.is_some()
    });
    engine.shutdown()?;

    let view = view.ok_or_else(|| {
        ClusterViewError::Timeout(format!(
            "no cluster snapshot within {}s",
            FIRST_SNAPSHOT_TIMEOUT.as_secs()
        ))
    })?;
    if !view.loaded {
        let reason = view.refresh.last_error.unwrap_or_default();
        return Err(ClusterViewError::Transport(reason));
    }
    for line in fallback_lines(&view) {
        runtime.terminal.write_line(&line)?;
    }
    Ok(0)
}

pub fn fallback_lines(view: &ViewSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    for node in &view.nodes {
        lines.push(structured_fallback_line(
            ViewKind::Nodes.as_str(),
            node.status(),
            tui::node_row(node).trim_end(),
        ));
    }
    for guest in &view.guests {
        lines.push(structured_fallback_line(
            ViewKind::Guests.as_str(),
            &guest.status,
            &format!("{} ({}) on {}", guest.name, guest.vmid, guest.node),
        ));
    }
    for task in &view.tasks {
        lines.push(structured_fallback_line(
            ViewKind::Tasks.as_str(),
            &task.status,
            &format!("{} {} on {}", task.task_type, task.upid, task.node),
        ));
    }
    lines
}

fn run_interactive(
    cfg: &AppConfig,
    cluster: SimulatedCluster,
    runtime: &ProductionRuntime,
) -> Result<i32, ClusterViewError> {
    let (surface, frames) = ChannelSurface::new();
    let engine = Engine::start(
        collaborators(&cluster, runtime),
        cfg.engine_settings(),
        Box::new(surface),
    )?;

    let io_err = |e: std::io::Error| ClusterViewError::Io(e.to_string());
    enable_raw_mode().map_err(io_err)?;
    let mut stdout = std::io::stdout();
    if let Err(err) = execute!(stdout, EnterAlternateScreen) {
        let _ = disable_raw_mode();
        return Err(io_err(err));
    }

    let result = interactive_loop(&engine, &frames, runtime);

    let _ = disable_raw_mode();
    let _ = execute!(std::io::stdout(), LeaveAlternateScreen);
    let report = engine.shutdown();
    append_run_log(
        "info",
        "run.interactive.closed",
        json!({ "cleared_pending": report.as_ref().map(|r| r.cleared_pending).ok() }),
    );
    result.map(|()| 0)
}

fn interactive_loop(
    engine: &Engine,
    frames: &std::sync::mpsc::Receiver<ViewSnapshot>,
    runtime: &ProductionRuntime,
) -> Result<(), ClusterViewError> {
    let io_err = |e: std::io::Error| ClusterViewError::Io(e.to_string());
    let mut terminal = ratatui::Terminal::new(CrosstermBackend::new(std::io::stdout()))
        .map_err(io_err)?;
    let handle = engine.handle();
    let mut input = InputState::default();
    let mut latest = handle.snapshot()?;

    loop {
        while let Ok(view) = frames.try_recv() {
            latest = view;
        }
        terminal
            .draw(|frame| tui::draw(frame, &latest, &input))
            .map_err(io_err)?;

        if !event::poll(INPUT_POLL).map_err(io_err)? {
            continue;
        }
        let Event::Key(key) = event::read().map_err(io_err)? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let key = match key.code {
            KeyCode::Char(c) => KeyInput::Char(c),
            KeyCode::Tab => KeyInput::Tab,
            KeyCode::Up => KeyInput::Up,
            KeyCode::Down => KeyInput::Down,
            KeyCode::Enter => KeyInput::Enter,
            KeyCode::Esc => KeyInput::Esc,
            KeyCode::Backspace => KeyInput::Backspace,
            _ => continue,
        };
        if handle_key(&handle, &latest, &mut input, key, runtime.clock.as_ref())? == KeyFlow::Quit {
            return Ok(());
        }
    }
}
