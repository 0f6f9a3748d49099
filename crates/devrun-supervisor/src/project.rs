use crate::process::{self, ProcessHandle};
use chrono::{DateTime, Local};
use devrun_core::{Phase, Status};
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

pub const LOG_CAPACITY: usize = 1000;
const STOP_GRACE: Duration = Duration::from_millis(100);
const FRONTEND_PORTS: &[u16] = &[3000, 3001, 5173, 5174, 4200];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedUrl {
    pub url: String,
    pub port: u16,
    pub score: i32,
}

#[derive(Debug, Default)]
struct ProjectState {
    phase: Phase,
    status: Status,
    logs: VecDeque<String>,
    url: Option<DetectedUrl>,
    configured_port: Option<u16>,
    started_at: Option<DateTime<Local>>,
    started_instant: Option<Instant>,
    handle: Option<ProcessHandle>,
    exit_code: Option<i32>,
    sealed: bool,
}

/// One supervised unit of work. Shared between reader tasks, the waiter and
/// the render loop; every field sits behind the one mutex.
#[derive(Debug)]
pub struct Project {
    name: String,
    path: PathBuf,
    state: Mutex<ProjectState>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            state: Mutex::new(ProjectState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProjectState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    /// `Running` requires a live process handle; the first accepted
    /// transition into it stamps the start time.
    pub fn set_status(&self, status: Status) {
        let mut state = self.state();
        Self::apply_status(&self.name, &mut state, status);
    }

    pub fn transition(&self, phase: Phase, status: Status) {
        let mut state = self.state();
        state.phase = phase;
        Self::apply_status(&self.name, &mut state, status);
    }

    fn apply_status(name: &str, state: &mut ProjectState, status: Status) {
        if state.sealed && !status.is_finished() {
            debug!("status_after_stop_ignored: project={name} status={status}");
            return;
        }
        if status == Status::Running {
            if state.handle.is_none() {
                debug!("status_running_without_process: project={name}");
                return;
            }
            if state.started_at.is_none() {
                state.started_at = Some(Local::now());
                state.started_instant = Some(Instant::now());
            }
        }
        state.status = status;
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.state().started_at
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.state().started_instant.map(|at| at.elapsed())
    }

    pub fn process_handle(&self) -> Option<ProcessHandle> {
        self.state().handle
    }

    /// Replacing the handle with `None` while running means the process is
    /// gone, so the status drops to `Stopped`.
    pub fn set_process_handle(&self, handle: Option<ProcessHandle>) {
        let mut state = self.state();
        if handle.is_none() && state.status == Status::Running {
            state.status = Status::Stopped;
        }
        state.handle = handle;
    }

    /// Installs the handle of a freshly spawned step unless the project is
    /// already being stopped. On `false` the caller owns the child and must
    /// kill it.
    pub fn claim_process_handle(&self, handle: Option<ProcessHandle>) -> bool {
        let mut state = self.state();
        if state.sealed {
            debug!("process_handle_refused: project={}", self.name);
            return false;
        }
        state.handle = handle;
        true
    }

    /// Refuses every process handle claimed from now on.
    pub fn seal(&self) {
        self.state().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }

    /// Records the exit of the owned process.
    pub fn mark_exited(&self, code: Option<i32>) {
        let mut state = self.state();
        state.handle = None;
        state.exit_code = code;
        if state.status == Status::Running {
            state.status = match code {
                Some(0) => Status::Success,
                Some(_) => Status::Error,
                None => Status::Stopped,
            };
        }
        if state.status == Status::Error {
            state.phase = Phase::Error;
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state().exit_code
    }

    /// Port the command was started with, before any log output.
    pub fn set_port(&self, port: Option<u16>) {
        self.state().configured_port = port;
    }

    /// Last known port: the detected one, else the configured one.
    pub fn port(&self) -> Option<u16> {
        let state = self.state();
        state
            .url
            .as_ref()
            .map(|url| url.port)
            .or(state.configured_port)
    }

    pub fn url(&self) -> Option<String> {
        self.state().url.as_ref().map(|url| url.url.clone())
    }

    pub fn detected_url(&self) -> Option<DetectedUrl> {
        self.state().url.clone()
    }

    pub fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        let candidate = detect_url(&line);
        let mut state = self.state();
        while state.logs.len() >= LOG_CAPACITY {
            state.logs.pop_front();
        }
        state.logs.push_back(line);
        if let Some(candidate) = candidate {
            let replace = state
                .url
                .as_ref()
                .map_or(true, |current| candidate.score >= current.score);
            if replace {
                if state.url.as_ref().map(|url| &url.url) != Some(&candidate.url) {
                    info!(
                        "url_detected: project={} url={} score={}",
                        self.name, candidate.url, candidate.score
                    );
                }
                state.url = Some(candidate);
            }
        }
    }

    pub fn logs(&self) -> Vec<String> {
        self.state().logs.iter().cloned().collect()
    }

    pub fn log_len(&self) -> usize {
        self.state().logs.len()
    }

    pub fn tail(&self, count: usize) -> Vec<String> {
        let state = self.state();
        let skip = state.logs.len().saturating_sub(count);
        state.logs.iter().skip(skip).cloned().collect()
    }

    /// Terminates the whole process tree: SIGTERM to the group, a short
    /// grace period, SIGKILL to the group and the child, then anything still
    /// listening on the last known port. The project is sealed first, so no
    /// later step can claim a handle.
    pub async fn graceful_stop(&self) {
        let (handle, port) = {
            let mut state = self.state();
            state.sealed = true;
            let port = state
                .url
                .as_ref()
                .map(|url| url.port)
                .or(state.configured_port);
            (state.handle, port)
        };
        if let Some(handle) = handle {
            debug!("graceful_stop: project={} pid={}", self.name, handle.pid);
            process::terminate(handle);
            tokio::time::sleep(STOP_GRACE).await;
            process::kill(handle);
        }
        if let Some(port) = port {
            process::kill_port_listeners(port).await;
        }
        let mut state = self.state();
        if state.handle == handle {
            state.handle = None;
        }
        if !state.status.is_finished() {
            state.status = Status::Stopped;
        }
        if state.phase != Phase::Error {
            state.phase = Phase::Stopped;
        }
    }
}

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| {
        Regex::new(r#"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\])(?::\d{1,5})?(?:/[^\s"'<>)\]]*)?"#)
            .expect("valid regex")
    })
}

/// Drops the `[HH:MM:SS] ` prefix the multiplexer adds.
fn strip_timestamp(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some((stamp, tail)) = rest.split_once("] ") {
            if stamp.len() <= 12 && stamp.chars().all(|c| c.is_ascii_digit() || c == ':' || c == '.') {
                return tail;
            }
        }
    }
    line
}

fn words(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '.')
        .filter(|word| !word.is_empty())
        .collect()
}

const BANNER_PHRASES: &[&str] = &[
    "ready in",
    "ready -",
    "ready started",
    "started server on",
    "local:",
    "dev server running",
    "compiled successfully",
    "app running at",
    "project is running at",
    "development server",
    "vite v",
    "next.js",
    "angular live development server",
];
const BACKEND_NAMES: &[&str] = &[
    "express", "fastapi", "uvicorn", "django", "flask", "gin", "fiber", "echo", "spring",
    "tomcat", "nest", "nestjs", "rails", "puma", "gunicorn", "actix", "axum", "grpc",
];
const BACKEND_PREFIXES: &[&str] = &["server:", "api:", "backend:"];

/// Heuristic preference for the URL a human wants to open: dev-server
/// banners and frontend ports win over backend listeners.
pub fn score_line(line: &str, port: u16) -> i32 {
    let body = strip_timestamp(line).trim_start();
    let lower = body.to_ascii_lowercase();
    let mut score = 0;
    let banner = BANNER_PHRASES.iter().any(|phrase| lower.contains(phrase));
    let frontend_port = FRONTEND_PORTS.contains(&port);
    if banner {
        score += 40;
    }
    if frontend_port {
        score += 30;
    }
    let tokens = words(&lower);
    if BACKEND_NAMES.iter().any(|name| tokens.contains(name)) {
        score -= 30;
    }
    if BACKEND_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) {
        score -= 40;
    }
    if lower.contains("listening") && !banner && !frontend_port {
        score -= 10;
    }
    score
}

/// Finds a loopback URL in the line and normalises its host to `localhost`.
pub fn detect_url(line: &str) -> Option<DetectedUrl> {
    let found = url_regex().find(line)?;
    let raw = found
        .as_str()
        .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':'));
    let parsed = Url::parse(raw).ok()?;
    let port = parsed.port_or_known_default()?;
    let path = match parsed.path() {
        "/" | "" => String::new(),
        other => other.to_string(),
    };
    let url = format!("{}://localhost:{port}{path}", parsed.scheme());
    Some(DetectedUrl {
        url,
        port,
        score: score_line(line, port),
    })
}
