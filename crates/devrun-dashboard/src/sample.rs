//! CPU / memory / temperature sampling for running process trees.

use std::collections::{HashMap, HashSet};
use sysinfo::{Components, Pid, ProcessesToUpdate, System};
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Owns the process table between ticks so CPU usage is a rate over the
/// last interval rather than a lifetime total.
pub struct Sampler {
    system: System,
    components: Components,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            components: Components::new_with_refreshed_list(),
        }
    }

    /// One process-table refresh per tick; `sample_tree` reads from it.
    pub fn refresh(&mut self) {
        let updated = self.system.refresh_processes(ProcessesToUpdate::All, true);
        trace!("process_table_refreshed: processes={updated}");
    }

    /// Sums the process rooted at `pid` and all of its descendants. `None`
    /// when the root is gone.
    pub fn sample_tree(&self, pid: u32) -> Option<ResourceSample> {
        let processes = self.system.processes();
        let root = Pid::from_u32(pid);
        processes.get(&root)?;

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in processes {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child);
            }
        }

        let mut sample = ResourceSample::default();
        let mut seen = HashSet::new();
        let mut pending = vec![root];
        while let Some(next) = pending.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(process) = processes.get(&next) {
                sample.cpu_percent += process.cpu_usage();
                sample.memory_bytes += process.memory();
            }
            if let Some(kids) = children.get(&next) {
                pending.extend(kids.iter().copied());
            }
        }
        Some(sample)
    }

    /// Hottest sensor reading in °C, if the host exposes any.
    pub fn temperature(&mut self) -> Option<f32> {
        for component in self.components.list_mut() {
            component.refresh();
        }
        self.components
            .list()
            .iter()
            .filter_map(|component| component.temperature())
            .filter(|celsius| *celsius > 0.0 && *celsius < 150.0)
            .reduce(f32::max)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    let mib = bytes as f64 / MIB;
    if mib >= 1024.0 {
        format!("{:.1}G", mib / 1024.0)
    } else {
        format!("{mib:.0}M")
    }
}
