//! Terminal dashboard: the single consumer of supervisor events.
//!
//! Reader and waiter tasks only ever send [`SupervisorEvent`]s through the
//! bounded mailbox; the render loop in [`Dashboard::start`] applies them to
//! the tracked projects between frames.

pub mod app;
pub mod render;
pub mod sample;

use app::{Action, App, Control};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use devrun_core::{Phase, Status};
use devrun_supervisor::{
    graceful_shutdown, LineWriter, ProcessHandle, Project, ShutdownReport, SupervisorEvent,
    EVENT_QUEUE_CAPACITY,
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use sample::Sampler;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const FRAME_INTERVAL: Duration = Duration::from_millis(80);
/// Upper bound on mailbox events applied between two frames.
const DRAIN_BATCH: usize = 256;

/// Cloneable producer side of the dashboard.
#[derive(Clone)]
pub struct DashboardHandle {
    tx: mpsc::Sender<SupervisorEvent>,
    projects: Arc<RwLock<Vec<Arc<Project>>>>,
}

impl DashboardHandle {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Project>>> {
        self.projects.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Project>>> {
        self.projects.write().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Registers a project and returns its index.
    pub fn add_project(&self, name: impl Into<String>, path: impl Into<PathBuf>) -> usize {
        let mut projects = self.write();
        projects.push(Arc::new(Project::new(name, path)));
        projects.len() - 1
    }

    pub fn project(&self, index: usize) -> Option<Arc<Project>> {
        self.read().get(index).cloned()
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.read().clone()
    }

    pub async fn update(&self, index: usize, phase: Phase, status: Status) {
        let event = SupervisorEvent::Update {
            index,
            phase,
            status,
        };
        if self.tx.send(event).await.is_err() {
            debug!("dashboard_update_dropped: index={index}");
        }
    }

    pub fn writer(&self, index: usize) -> LineWriter {
        LineWriter::new(index, self.tx.clone())
    }

    pub fn sender(&self) -> mpsc::Sender<SupervisorEvent> {
        self.tx.clone()
    }

    pub fn process_handle(&self, index: usize) -> Option<ProcessHandle> {
        self.project(index).and_then(|project| project.process_handle())
    }

    pub fn set_process_handle(&self, index: usize, handle: Option<ProcessHandle>) {
        if let Some(project) = self.project(index) {
            project.set_process_handle(handle);
        }
    }

    /// Asks the render loop to shut down; returns immediately.
    pub fn stop(&self) {
        match self.tx.try_send(SupervisorEvent::Shutdown) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

pub struct Dashboard {
    handle: DashboardHandle,
    rx: mpsc::Receiver<SupervisorEvent>,
    title: String,
}

impl Dashboard {
    pub fn new(title: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            handle: DashboardHandle {
                tx,
                projects: Arc::new(RwLock::new(Vec::new())),
            },
            rx,
            title: title.into(),
        }
    }

    pub fn handle(&self) -> DashboardHandle {
        self.handle.clone()
    }

    pub fn add_project(&self, name: impl Into<String>, path: impl Into<PathBuf>) -> usize {
        self.handle.add_project(name, path)
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.handle.projects()
    }

    /// Takes over the terminal and blocks until the user quits or
    /// [`DashboardHandle::stop`] is called. Every live project has been
    /// shut down by the time this returns.
    pub async fn start(self) -> io::Result<ShutdownReport> {
        let Dashboard {
            handle,
            mut rx,
            title,
        } = self;
        let mut app = App::new(title);
        app.sync_projects(handle.projects());

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen, EnableMouseCapture) {
            let _ = disable_raw_mode();
            return Err(err);
        }
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        info!("dashboard_started: projects={}", app.projects().len());

        let outcome = run_loop(&mut terminal, &mut app, &handle, &mut rx).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                warn!("dashboard_render_failed: {err}");
                graceful_shutdown(&handle.projects()).await
            }
        };
        info!(
            "dashboard_stopped: stopped={} timed_out={}",
            report.stopped, report.timed_out
        );
        Ok(report)
    }
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    handle: &DashboardHandle,
    rx: &mut mpsc::Receiver<SupervisorEvent>,
) -> io::Result<ShutdownReport> {
    let mut events = EventStream::new();
    let mut sampler = Sampler::new();
    let mut sample_ticker = tokio::time::interval(SAMPLE_INTERVAL);
    let mut frame_ticker = tokio::time::interval(FRAME_INTERVAL);

    loop {
        app.sync_projects(handle.projects());
        terminal.draw(|frame| render::render_ui(frame, app))?;
        let mut control = Control::Continue;
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(event) => {
                        control = app.apply(event);
                        let mut drained = 0;
                        while control == Control::Continue && drained < DRAIN_BATCH {
                            let Ok(event) = rx.try_recv() else { break };
                            control = app.apply(event);
                            drained += 1;
                        }
                    }
                    None => control = Control::Shutdown,
                }
            }
            _ = sample_ticker.tick() => {
                app.sample(&mut sampler);
            }
            _ = frame_ticker.tick() => {
                app.advance_frame();
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    match app.handle_input(event) {
                        Action::Quit => control = Control::Shutdown,
                        Action::OpenUrl(url) => open_url(&url),
                        Action::None => {}
                    }
                }
            }
        }
        if control == Control::Shutdown {
            app.stopping = true;
            terminal.draw(|frame| render::render_ui(frame, app))?;
            return Ok(graceful_shutdown(&handle.projects()).await);
        }
    }
}

fn open_url(url: &str) {
    #[cfg(target_os = "macos")]
    let mut cmd = std::process::Command::new("open");
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut cmd = std::process::Command::new("xdg-open");
    let spawned = cmd
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(err) = spawned {
        warn!("open_url_failed: url={url} error={err}");
    }
}
