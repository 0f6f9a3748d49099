#![cfg(unix)]

use devrun_core::{
    EnvRequirement, Governor, HardwareProfile, RunSpec, SearchPaths, SetupSpec,
};
use devrun_orchestrator::{
    DependencyCheck, EnvPrompt, MissingEnvChoice, OrchestrateError, OrchestrateOptions,
    Orchestrator, PackageManager, PackageManagerProvider, StepFailure,
};
use std::ffi::OsString;
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(Governor::new(HardwareProfile::default()))
}

fn spec(run: &str) -> RunSpec {
    RunSpec {
        name: "fixture".into(),
        run_command: run.into(),
        ..RunSpec::default()
    }
}

fn options(dir: &Path) -> OrchestrateOptions {
    OrchestrateOptions {
        workdir: Some(dir.to_path_buf()),
        ..OrchestrateOptions::default()
    }
}

fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).expect("read output")
}

struct FixedPrompt(MissingEnvChoice);

impl EnvPrompt for FixedPrompt {
    fn resolve_missing(&self, _name: &str) -> io::Result<MissingEnvChoice> {
        Ok(self.0.clone())
    }
}

struct FakeProvider {
    command: Vec<String>,
}

impl PackageManagerProvider for FakeProvider {
    fn inspect(
        &self,
        dir: &Path,
        _hint: Option<&str>,
        _search_paths: &SearchPaths,
        _inherited_path: Option<&OsString>,
    ) -> Option<DependencyCheck> {
        Some(DependencyCheck {
            dir: dir.to_path_buf(),
            manager: PackageManager::Npm,
            installed: true,
            needs_install: true,
            command: self.command.clone(),
            search_path: None,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_run_sees_labelled_env_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join(".env"), "GREETING=base\n").expect("write");
    std::fs::write(dir.path().join(".env.staging"), "GREETING=staging\n").expect("write");
    let mut opts = options(dir.path());
    opts.environment = Some("staging".into());

    let outcome = orchestrator()
        .orchestrate(&spec("printf %s \"$GREETING\" > out.txt"), &opts)
        .await
        .expect("run");
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.cwd, dir.path());
    assert!(!outcome.interrupted);
    assert_eq!(read(dir.path().join("out.txt")), "staging");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cd_prefix_moves_the_working_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("apps/web")).expect("mkdir");
    let outcome = orchestrator()
        .orchestrate(&spec("cd apps && cd web && pwd > where.txt"), &options(dir.path()))
        .await
        .expect("run");
    assert_eq!(outcome.command, "pwd > where.txt");
    assert_eq!(outcome.cwd, dir.path().join("apps/web"));
    assert!(dir.path().join("apps/web/where.txt").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_cd_target_keeps_the_original_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = orchestrator()
        .orchestrate(&spec("cd ghost && true"), &options(dir.path()))
        .await
        .expect_err("shell cannot cd");
    match err {
        OrchestrateError::Run(StepFailure::Exit { command, code }) => {
            assert_eq!(command, "cd ghost && true");
            assert_ne!(code, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_setup_stops_before_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut run = spec("touch ran.txt");
    run.setup = Some(SetupSpec {
        command: "exit 3".into(),
        mandatory: true,
    });
    let mut opts = options(dir.path());
    opts.skip_setup = true;

    let err = orchestrator().orchestrate(&run, &opts).await.expect_err("setup fails");
    assert!(matches!(err, OrchestrateError::Setup(StepFailure::Exit { code: 3, .. })));
    assert!(err.to_string().starts_with("setup phase failed"));
    assert!(!dir.path().join("ran.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn optional_setup_honours_skip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut run = spec("touch ran.txt");
    run.setup = Some(SetupSpec {
        command: "touch setup.txt".into(),
        mandatory: false,
    });

    let mut opts = options(dir.path());
    opts.skip_setup = true;
    orchestrator().orchestrate(&run, &opts).await.expect("run");
    assert!(!dir.path().join("setup.txt").exists());
    assert!(dir.path().join("ran.txt").exists());

    opts.skip_setup = false;
    orchestrator().orchestrate(&run, &opts).await.expect("run");
    assert!(dir.path().join("setup.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_binary_is_built_from_makefile() {
    if std::process::Command::new("make").arg("--version").output().is_err() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("Makefile"),
        "app:\n\tprintf '#!/bin/sh\\necho built\\n' > app\n\tchmod +x app\n",
    )
    .expect("write");
    orchestrator()
        .orchestrate(&spec("./app > out.txt"), &options(dir.path()))
        .await
        .expect("run");
    assert_eq!(read(dir.path().join("out.txt")), "built\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_build_descriptor_is_only_a_warning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = orchestrator()
        .orchestrate(&spec("./not-built"), &options(dir.path()))
        .await
        .expect_err("binary is missing");
    assert!(matches!(err, OrchestrateError::Run(StepFailure::Exit { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_port_is_exported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    let mut opts = options(dir.path());
    opts.port = Some(port);
    let outcome = orchestrator()
        .orchestrate(&spec("printf %s \"$PORT\" > port.txt"), &opts)
        .await
        .expect("run");
    assert_eq!(outcome.port, Some(port));
    assert_eq!(read(dir.path().join("port.txt")), port.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_port_is_shifted_unless_disabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let busy = listener.local_addr().expect("addr").port();
    let run = spec(&format!("printf %s '--port {busy}' > args.txt"));

    let outcome = orchestrator()
        .orchestrate(&run, &options(dir.path()))
        .await
        .expect("run");
    let shifted = outcome.port.expect("port");
    assert!(shifted > busy);
    assert_eq!(read(dir.path().join("args.txt")), format!("--port {shifted}"));

    let mut opts = options(dir.path());
    opts.no_port_shift = true;
    let outcome = orchestrator().orchestrate(&run, &opts).await.expect("run");
    assert_eq!(outcome.port, Some(busy));
    assert_eq!(read(dir.path().join("args.txt")), format!("--port {busy}"));

    let mut static_site = run.clone();
    static_site.language = "html".into();
    let outcome = orchestrator()
        .orchestrate(&static_site, &options(dir.path()))
        .await
        .expect("run");
    assert_eq!(outcome.port, None);
    assert_eq!(read(dir.path().join("args.txt")), format!("--port {busy}"));
    drop(listener);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_run_command_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = orchestrator()
        .orchestrate(&spec("  "), &options(dir.path()))
        .await
        .expect_err("nothing to run");
    assert!(matches!(err, OrchestrateError::MissingRunCommand(ref name) if name == "fixture"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactive_prompt_supplies_or_aborts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut run = spec("printf %s \"$DEVRUN_FIXTURE_SECRET\" > secret.txt");
    run.env = vec![EnvRequirement {
        name: "DEVRUN_FIXTURE_SECRET".into(),
        required: true,
    }];
    let mut opts = options(dir.path());
    opts.interactive = true;

    let supplied = orchestrator()
        .with_prompt(Arc::new(FixedPrompt(MissingEnvChoice::Supply("s3cret".into()))));
    supplied.orchestrate(&run, &opts).await.expect("run");
    assert_eq!(read(dir.path().join("secret.txt")), "s3cret");

    let aborting = orchestrator().with_prompt(Arc::new(FixedPrompt(MissingEnvChoice::Abort)));
    let err = aborting.orchestrate(&run, &opts).await.expect_err("abort");
    assert!(matches!(err, OrchestrateError::EnvAborted(_)));

    opts.interactive = false;
    aborting.orchestrate(&run, &opts).await.expect("skips without prompting");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependency_installs_run_and_failures_are_recoverable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let installing = orchestrator().with_provider(Arc::new(FakeProvider {
        command: vec!["touch".into(), "installed.txt".into()],
    }));
    installing
        .orchestrate(&spec("true"), &options(dir.path()))
        .await
        .expect("run");
    assert!(dir.path().join("installed.txt").exists());

    let failing = orchestrator().with_provider(Arc::new(FakeProvider {
        command: vec!["false".into()],
    }));
    let outcome = failing
        .orchestrate(&spec("touch ran.txt"), &options(dir.path()))
        .await
        .expect("install failure is not fatal");
    assert_eq!(outcome.exit_code, Some(0));
    assert!(dir.path().join("ran.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signaled_install_stops_the_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let interrupted = orchestrator().with_provider(Arc::new(FakeProvider {
        command: vec!["kill".into(), "-TERM".into(), "$$".into()],
    }));
    let err = interrupted
        .orchestrate(&spec("touch ran.txt"), &options(dir.path()))
        .await
        .expect_err("signaled install is an interruption");
    assert!(matches!(err, OrchestrateError::Install(StepFailure::Signaled { .. })));
    assert!(err.is_interrupted());
    assert!(!dir.path().join("ran.txt").exists());
}
