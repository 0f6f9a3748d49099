//! Spawning in a dedicated process group and tearing process trees down.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const PORT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// OS handle for a spawned child. The child leads its own process group, so
/// the group id equals the pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn from_child(child: &Child) -> Option<Self> {
        child.id().map(Self::new)
    }
}

/// Runs `command` through the platform shell so pipes, redirects and `&&`
/// chains keep working. The environment is replaced wholesale by `env`.
pub fn spawn_shell(
    command: &str,
    cwd: &Path,
    env: &HashMap<OsString, OsString>,
) -> io::Result<Child> {
    let mut cmd = shell_command(command);
    cmd.current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    let child = cmd.spawn()?;
    debug!(
        "spawned: pid={} cwd={} command={command}",
        child.id().unwrap_or_default(),
        cwd.display()
    );
    Ok(child)
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    unsafe { libc::killpg(pgid, signal) == 0 }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 1 {
        return false;
    }
    unsafe { libc::kill(pid, signal) == 0 }
}

/// SIGTERM to the whole group.
#[cfg(unix)]
pub fn terminate(handle: ProcessHandle) {
    if !signal_group(handle.pid, libc::SIGTERM) {
        signal_pid(handle.pid, libc::SIGTERM);
    }
}

/// SIGKILL to the group, then to the direct child in case it left the group.
#[cfg(unix)]
pub fn kill(handle: ProcessHandle) {
    signal_group(handle.pid, libc::SIGKILL);
    signal_pid(handle.pid, libc::SIGKILL);
}

#[cfg(not(unix))]
pub fn terminate(handle: ProcessHandle) {
    kill(handle);
}

#[cfg(not(unix))]
pub fn kill(handle: ProcessHandle) {
    let pid = handle.pid.to_string();
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", pid.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

pub fn is_alive(handle: ProcessHandle) -> bool {
    #[cfg(unix)]
    {
        signal_pid(handle.pid, 0)
    }
    #[cfg(not(unix))]
    {
        let _ = handle;
        false
    }
}

enum Lookup {
    Output(String),
    Unavailable,
    TimedOut,
}

async fn run_lookup(program: &str, args: &[&str]) -> Lookup {
    let lookup = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(PORT_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(output)) => Lookup::Output(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(err)) => {
            debug!("port_lookup_tool_missing: program={program} error={err}");
            Lookup::Unavailable
        }
        Err(_) => Lookup::TimedOut,
    }
}

/// `lsof -t` prints one pid per line.
fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

fn ss_pid_regex() -> &'static Regex {
    static PID_RE: OnceLock<Regex> = OnceLock::new();
    PID_RE.get_or_init(|| Regex::new(r"pid=(\d+)").expect("valid regex"))
}

/// `ss -Hltnp` rows: state, queues, local address, peer, then
/// `users:(("name",pid=N,fd=M),...)`.
fn parse_ss_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in output.lines() {
        let local = line.split_whitespace().nth(3).unwrap_or_default();
        if !local.ends_with(&suffix) {
            continue;
        }
        for caps in ss_pid_regex().captures_iter(line) {
            if let Ok(pid) = caps[1].parse::<u32>() {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

/// Pids with a listening TCP socket on `port`, excluding this process.
/// Asks `lsof` first and falls back to `ss` where `lsof` is not installed.
pub async fn pids_on_port(port: u16) -> Vec<u32> {
    let filter = format!("-iTCP:{port}");
    let pids = match run_lookup("lsof", &["-nP", "-t", filter.as_str(), "-sTCP:LISTEN"]).await {
        Lookup::Output(stdout) => parse_lsof_pids(&stdout),
        Lookup::TimedOut => {
            warn!("port_lookup_timeout: port={port} program=lsof");
            Vec::new()
        }
        Lookup::Unavailable => {
            let sport = format!(":{port}");
            match run_lookup("ss", &["-Hltnp", "sport", "=", sport.as_str()]).await {
                Lookup::Output(stdout) => parse_ss_pids(&stdout, port),
                Lookup::TimedOut => {
                    warn!("port_lookup_timeout: port={port} program=ss");
                    Vec::new()
                }
                Lookup::Unavailable => {
                    warn!(
                        "port_lookup_unavailable: port={port} neither lsof nor ss found; \
                         detached listeners survive"
                    );
                    Vec::new()
                }
            }
        }
    };
    let own = std::process::id();
    pids.into_iter().filter(|pid| *pid != own).collect()
}

/// Force-kills whatever still listens on `port`. Dev servers often fork
/// detached children that escape the process group.
pub async fn kill_port_listeners(port: u16) -> usize {
    let pids = pids_on_port(port).await;
    let mut killed = 0;
    for pid in pids {
        #[cfg(unix)]
        let done = signal_pid(pid, libc::SIGKILL);
        #[cfg(not(unix))]
        let done = {
            kill(ProcessHandle::new(pid));
            true
        };
        if done {
            debug!("port_sweep_killed: port={port} pid={pid}");
            killed += 1;
        }
    }
    killed
}
