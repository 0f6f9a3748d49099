#![cfg(unix)]

use devrun_core::{Phase, Status};
use devrun_core::ports;
use devrun_supervisor::{
    graceful_shutdown, graceful_shutdown_within, process, spawn_shell, LineWriter,
    ProcessHandle, Project, StreamSink, SupervisorEvent, SHUTDOWN_TIMEOUT,
};
use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn shell_env() -> HashMap<OsString, OsString> {
    let mut env = HashMap::new();
    env.insert(OsString::from("PATH"), OsString::from("/usr/bin:/bin"));
    env
}

fn has_tool(program: &str) -> bool {
    ["/usr/bin", "/bin", "/usr/sbin", "/sbin"]
        .iter()
        .any(|dir| std::path::Path::new(dir).join(program).is_file())
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn term_ignoring_process_is_killed_within_the_window() {
    let mut child = spawn_shell(
        "trap '' TERM; echo armed; sleep 30",
        &std::env::temp_dir(),
        &shell_env(),
    )
    .expect("spawn");
    let handle = ProcessHandle::from_child(&child).expect("pid");

    let project = Arc::new(Project::new("stubborn", std::env::temp_dir()));
    project.set_process_handle(Some(handle));
    project.transition(Phase::Run, Status::Running);

    let (tx, mut rx) = mpsc::channel(8);
    let stdout = child.stdout.take().expect("stdout");
    let reader = tokio::spawn(devrun_supervisor::pump(
        stdout,
        StreamSink::Lines(LineWriter::new(0, tx)),
    ));
    let first = rx.recv().await.expect("armed line");
    assert!(matches!(first, SupervisorEvent::Log { ref line, .. } if line.ends_with("armed")));

    let started = Instant::now();
    let report = graceful_shutdown(&[project.clone()]).await;
    assert!(started.elapsed() < SHUTDOWN_TIMEOUT + Duration::from_millis(500));
    assert_eq!(report.stopped, 1);

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("child exits")
        .expect("exit status");
    assert!(!status.success());
    assert_eq!(project.status(), Status::Stopped);
    assert_eq!(project.phase(), Phase::Stopped);
    assert!(project.process_handle().is_none());

    let _ = tokio::time::timeout(Duration::from_secs(5), reader).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_several_projects_concurrently() {
    let mut children = Vec::new();
    let mut projects = Vec::new();
    for i in 0..3 {
        let child = spawn_shell("sleep 30", &std::env::temp_dir(), &shell_env()).expect("spawn");
        let project = Arc::new(Project::new(format!("p{i}"), std::env::temp_dir()));
        project.set_process_handle(ProcessHandle::from_child(&child));
        project.set_status(Status::Running);
        children.push(child);
        projects.push(project);
    }

    let started = Instant::now();
    let report = graceful_shutdown(&projects).await;
    assert_eq!(report.stopped, 3);
    assert!(!report.timed_out);
    assert!(started.elapsed() < Duration::from_secs(3));

    for mut child in children {
        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child exits")
            .expect("exit status");
    }
    assert!(projects
        .iter()
        .all(|project| project.status() == Status::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn step_spawned_while_stopping_is_refused() {
    let mut install = spawn_shell("sleep 30", &std::env::temp_dir(), &shell_env()).expect("spawn");
    let project = Arc::new(Project::new("pipeline", std::env::temp_dir()));
    project.set_process_handle(ProcessHandle::from_child(&install));
    project.transition(Phase::Setup, Status::Running);

    let follower = {
        let project = project.clone();
        tokio::spawn(async move {
            let _ = install.wait().await;
            let mut next =
                spawn_shell("sleep 30", &std::env::temp_dir(), &shell_env()).expect("spawn");
            let handle = ProcessHandle::from_child(&next);
            let claimed = project.claim_process_handle(handle);
            if !claimed {
                if let Some(handle) = handle {
                    process::kill(handle);
                }
                let _ = next.wait().await;
            }
            (claimed, handle)
        })
    };

    let report = graceful_shutdown(&[project.clone()]).await;
    assert_eq!(report.stopped, 1);
    let (claimed, handle) = tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .expect("follower finishes")
        .expect("follower task");

    assert!(!claimed);
    assert!(!process::is_alive(handle.expect("pid")));
    assert!(project.process_handle().is_none());
    project.transition(Phase::Run, Status::Running);
    assert_eq!(project.status(), Status::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detached_listener_on_the_project_port_is_swept() {
    if !has_tool("setsid") || !has_tool("python3") || !(has_tool("lsof") || has_tool("ss")) {
        return;
    }
    let port = free_port();
    let command = format!("setsid python3 -m http.server {port} --bind 127.0.0.1 & sleep 30");
    let mut child = spawn_shell(&command, &std::env::temp_dir(), &shell_env()).expect("spawn");
    let project = Arc::new(Project::new("detached", std::env::temp_dir()));
    project.set_process_handle(ProcessHandle::from_child(&child));
    project.set_port(Some(port));
    project.transition(Phase::Run, Status::Running);

    assert!(
        wait_until(Duration::from_secs(10), || !ports::is_available(port)).await,
        "listener never came up"
    );

    let report = graceful_shutdown(&[project.clone()]).await;
    assert_eq!(report.stopped, 1);
    tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("child exits")
        .expect("exit status");
    assert!(
        wait_until(Duration::from_secs(2), || ports::is_available(port)).await,
        "port {port} still held after shutdown"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_stop_escalates_to_force_kill() {
    let mut child = spawn_shell(
        "trap '' TERM; sleep 30",
        &std::env::temp_dir(),
        &shell_env(),
    )
    .expect("spawn");
    let project = Arc::new(Project::new("slow", std::env::temp_dir()));
    project.set_process_handle(ProcessHandle::from_child(&child));
    project.transition(Phase::Run, Status::Running);

    let started = Instant::now();
    let report = graceful_shutdown_within(&[project.clone()], Duration::from_millis(20)).await;
    assert!(report.timed_out);
    assert_eq!(report.stopped, 1);
    assert!(started.elapsed() < Duration::from_secs(3));

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("child exits")
        .expect("exit status");
    assert!(!status.success());
    assert!(project.process_handle().is_none());
    assert_eq!(project.phase(), Phase::Stopped);
    assert!(project.is_sealed());
}
