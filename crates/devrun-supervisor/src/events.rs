use crate::project::Project;
use devrun_core::{Phase, Status};
use std::sync::Arc;

pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Messages producers send to the single consumer that owns display state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Update {
        index: usize,
        phase: Phase,
        status: Status,
    },
    Log {
        index: usize,
        line: String,
    },
    /// Process `pid` exited; `code` is `None` when killed by a signal.
    Exited {
        index: usize,
        pid: u32,
        code: Option<i32>,
    },
    Shutdown,
}

impl SupervisorEvent {
    pub fn index(&self) -> Option<usize> {
        match self {
            SupervisorEvent::Update { index, .. }
            | SupervisorEvent::Log { index, .. }
            | SupervisorEvent::Exited { index, .. } => Some(*index),
            SupervisorEvent::Shutdown => None,
        }
    }
}

/// Applies a phase/status or log message to the tracked projects.
/// Returns false for messages addressed to an unknown index.
pub fn apply_event(projects: &[Arc<Project>], event: SupervisorEvent) -> bool {
    let Some(project) = event.index().and_then(|index| projects.get(index)) else {
        return false;
    };
    match event {
        SupervisorEvent::Update { phase, status, .. } => {
            project.transition(phase, status);
        }
        SupervisorEvent::Log { line, .. } => {
            project.append_log(line);
        }
        SupervisorEvent::Exited { pid, code, .. } => {
            // A later step may already own the project.
            if project.process_handle().map_or(true, |handle| handle.pid == pid) {
                project.mark_exited(code);
            }
        }
        SupervisorEvent::Shutdown => return false,
    }
    true
}
