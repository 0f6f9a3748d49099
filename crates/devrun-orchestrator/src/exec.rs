//! Spawning phase commands and routing their output to a tracked project.

use crate::error::StepFailure;
use devrun_core::{Phase, Status};
use devrun_supervisor::{
    process, pump, spawn_shell, LineWriter, ProcessHandle, Project, StreamSink, SupervisorEvent,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long readers may keep draining after the process exits; detached
/// grandchildren can hold the pipes open indefinitely.
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Producer-side view of one tracked project: every state change goes
/// through the event channel, except the process handle which is set
/// directly before the matching `Running` update is queued.
#[derive(Clone)]
pub(crate) struct Session {
    project: Arc<Project>,
    index: usize,
    tx: mpsc::Sender<SupervisorEvent>,
    passthrough: bool,
}

impl Session {
    /// Output is mirrored to this process's stdout/stderr.
    pub fn plain(project: Arc<Project>, tx: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            project,
            index: 0,
            tx,
            passthrough: true,
        }
    }

    pub fn dashboard(project: Arc<Project>, index: usize, tx: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            project,
            index,
            tx,
            passthrough: false,
        }
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    async fn send(&self, event: SupervisorEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("session_event_dropped: project={}", self.project.name());
        }
    }

    pub async fn update(&self, phase: Phase, status: Status) {
        self.send(SupervisorEvent::Update {
            index: self.index,
            phase,
            status,
        })
        .await;
    }

    async fn push_line(&self, message: &str) {
        self.send(SupervisorEvent::Log {
            index: self.index,
            line: format!("[devrun] {message}"),
        })
        .await;
    }

    /// Recoverable fallback: logged as a warning and shown in the project log.
    pub async fn warn(&self, tag: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!("{tag}: project={} {message}", self.project.name());
        self.push_line(&format!("warning: {message}")).await;
    }

    pub async fn info(&self, tag: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{tag}: project={} {message}", self.project.name());
        self.push_line(message).await;
    }

    fn sink(&self, stream: Stream) -> StreamSink {
        let lines = LineWriter::new(self.index, self.tx.clone());
        match (self.passthrough, stream) {
            (false, _) => StreamSink::Lines(lines),
            (true, Stream::Stdout) => StreamSink::tee(lines, tokio::io::stdout()),
            (true, Stream::Stderr) => StreamSink::tee(lines, tokio::io::stderr()),
        }
    }

    /// One reader task per piped stream.
    fn attach(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let sink = self.sink(Stream::Stdout);
            readers.push(tokio::spawn(async move {
                if let Err(err) = pump(stdout, sink).await {
                    debug!("stdout_pump_closed: {err}");
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = self.sink(Stream::Stderr);
            readers.push(tokio::spawn(async move {
                if let Err(err) = pump(stderr, sink).await {
                    debug!("stderr_pump_closed: {err}");
                }
            }));
        }
        readers
    }

    async fn exited(&self, pid: u32, code: Option<i32>) {
        self.send(SupervisorEvent::Exited {
            index: self.index,
            pid,
            code,
        })
        .await;
    }

    /// Spawns `command` for `phase` and marks the project running.
    pub async fn spawn(
        &self,
        phase: Phase,
        command: &str,
        cwd: &Path,
        env: &HashMap<OsString, OsString>,
    ) -> Result<Running, StepFailure> {
        if self.project.is_sealed() {
            return Err(StepFailure::Cancelled {
                command: command.to_string(),
            });
        }
        self.update(phase, Status::Pending).await;
        self.info("phase_command", format!("{} $ {command}", phase.as_str()))
            .await;
        let mut child = match spawn_shell(command, cwd, env) {
            Ok(child) => child,
            Err(source) => {
                self.update(Phase::Error, Status::Error).await;
                return Err(StepFailure::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };
        let handle = ProcessHandle::from_child(&child);
        if !self.project.claim_process_handle(handle) {
            debug!("spawn_after_stop: project={} command={command}", self.project.name());
            if let Some(handle) = handle {
                process::kill(handle);
            }
            let _ = child.wait().await;
            return Err(StepFailure::Cancelled {
                command: command.to_string(),
            });
        }
        self.update(phase, Status::Running).await;
        let readers = self.attach(&mut child);
        Ok(Running {
            session: self.clone(),
            command: command.to_string(),
            child,
            handle,
            readers,
        })
    }

    /// Runs a blocking step to completion under `timeout`.
    pub async fn run_step(
        &self,
        phase: Phase,
        command: &str,
        cwd: &Path,
        env: &HashMap<OsString, OsString>,
        timeout: Duration,
    ) -> Result<(), StepFailure> {
        let running = self.spawn(phase, command, cwd, env).await?;
        running.wait_within(timeout).await
    }
}

/// A spawned command whose readers are still attached.
pub(crate) struct Running {
    session: Session,
    command: String,
    child: Child,
    handle: Option<ProcessHandle>,
    readers: Vec<JoinHandle<()>>,
}

impl Running {
    async fn finish(self, status: Option<ExitStatus>) -> Result<(), StepFailure> {
        for reader in self.readers {
            if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                debug!("reader_drain_timeout: command={}", self.command);
            }
        }
        let code = status.and_then(|status| status.code());
        let pid = self.handle.map(|handle| handle.pid).unwrap_or_default();
        self.session.exited(pid, code).await;
        match code {
            Some(0) => Ok(()),
            Some(code) => Err(StepFailure::Exit {
                command: self.command,
                code,
            }),
            None => Err(StepFailure::Signaled {
                command: self.command,
            }),
        }
    }

    pub async fn wait(mut self) -> Result<(), StepFailure> {
        let status = self.child.wait().await.ok();
        self.finish(status).await
    }

    /// Kills the process group when `timeout` elapses first.
    pub async fn wait_within(mut self, timeout: Duration) -> Result<(), StepFailure> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status.ok();
                self.finish(status).await
            }
            Err(_) => {
                warn!("step_timeout: command={} after={}s", self.command, timeout.as_secs());
                if let Some(handle) = self.handle {
                    process::kill(handle);
                }
                let _ = self.child.wait().await;
                let command = self.command.clone();
                let _ = self.finish(None).await;
                Err(StepFailure::Timeout { command, timeout })
            }
        }
    }

    /// Hands the child to a waiter task that reports the exit on the channel.
    pub fn detach(self) {
        tokio::spawn(async move {
            let command = self.command.clone();
            match self.wait().await {
                Ok(()) => debug!("process_exited: command={command}"),
                Err(err) => debug!("process_failed: {err}"),
            }
        });
    }
}
