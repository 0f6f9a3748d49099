use crate::process;
use crate::project::Project;
use devrun_core::{Phase, Status};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub timed_out: bool,
    pub swept: usize,
}

fn is_live(project: &Project) -> bool {
    project.process_handle().is_some() || project.status() == Status::Running
}

/// Stops every live project concurrently. Idle projects are sealed so a
/// pipeline between steps cannot start another process afterwards. If that takes longer than
/// [`SHUTDOWN_TIMEOUT`], every remaining handle and port listener is killed
/// outright before returning.
pub async fn graceful_shutdown(projects: &[Arc<Project>]) -> ShutdownReport {
    graceful_shutdown_within(projects, SHUTDOWN_TIMEOUT).await
}

pub async fn graceful_shutdown_within(
    projects: &[Arc<Project>],
    timeout: Duration,
) -> ShutdownReport {
    for project in projects {
        project.seal();
    }
    let live: Vec<Arc<Project>> = projects
        .iter()
        .filter(|project| is_live(project))
        .cloned()
        .collect();
    let mut report = ShutdownReport {
        stopped: live.len(),
        ..ShutdownReport::default()
    };
    if live.is_empty() {
        return report;
    }
    info!("shutdown_begin: projects={}", live.len());
    let stops = join_all(live.iter().map(|project| project.graceful_stop()));
    if tokio::time::timeout(timeout, stops).await.is_err() {
        warn!("shutdown_timeout: escalating to force kill");
        report.timed_out = true;
        report.swept = force_kill_all(projects).await;
    }
    report
}

async fn force_kill_all(projects: &[Arc<Project>]) -> usize {
    let mut swept = 0;
    for project in projects {
        project.seal();
        if let Some(handle) = project.process_handle() {
            process::kill(handle);
        }
        if let Some(port) = project.port() {
            swept += process::kill_port_listeners(port).await;
        }
        project.set_process_handle(None);
        if project.phase() != Phase::Error {
            project.set_phase(Phase::Stopped);
        }
    }
    swept
}
