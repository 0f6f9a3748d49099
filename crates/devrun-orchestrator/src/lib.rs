//! Phase driver: working directory, environment, dependencies, setup,
//! auto-build, port handling and the supervised run.

pub mod build;
pub mod deps;
pub mod env;
pub mod error;
mod exec;
pub mod runtime;
pub mod workdir;

pub use deps::{DependencyCheck, LockfileProvider, PackageManager, PackageManagerProvider, INSTALL_TIMEOUT};
pub use env::{EnvBuilder, EnvPrompt, MissingEnvChoice, StdinPrompt};
pub use error::{OrchestrateError, StepFailure};

use devrun_core::governor::{inject_concurrency_flag, run_batched};
use devrun_core::{ports, Governor, Phase, RunSpec, SearchPaths, Status};
use devrun_dashboard::Dashboard;
use devrun_supervisor::{apply_event, graceful_shutdown, Project, SupervisorEvent, EVENT_QUEUE_CAPACITY};
use exec::Session;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use workdir::CdResolution;

pub const SETUP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Bound on waiting for reader tasks after an interrupted plain run.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// Env file label, e.g. `staging` loads `.env.staging`.
    pub environment: Option<String>,
    pub build: bool,
    pub port: Option<u16>,
    pub no_port_shift: bool,
    pub skip_setup: bool,
    pub skip_env_check: bool,
    pub dashboard: bool,
    pub workdir: Option<PathBuf>,
    pub interactive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub command: String,
    pub cwd: PathBuf,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub exit_code: Option<i32>,
    pub interrupted: bool,
}

struct Prepared {
    workdir: PathBuf,
    env: EnvBuilder,
    skipped: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    governor: Arc<Governor>,
    search_paths: Arc<SearchPaths>,
    provider: Arc<dyn PackageManagerProvider>,
    prompt: Arc<dyn EnvPrompt>,
}

impl Orchestrator {
    pub fn new(governor: Governor) -> Self {
        Self {
            governor: Arc::new(governor),
            search_paths: Arc::new(SearchPaths::new()),
            provider: Arc::new(LockfileProvider),
            prompt: Arc::new(StdinPrompt),
        }
    }

    /// Probes the host once; the profile is fixed for the orchestrator's life.
    pub fn detect() -> Self {
        Self::new(Governor::detect())
    }

    pub fn with_search_paths(mut self, search_paths: Arc<SearchPaths>) -> Self {
        self.search_paths = search_paths;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn PackageManagerProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn EnvPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn search_paths(&self) -> &Arc<SearchPaths> {
        &self.search_paths
    }

    pub async fn orchestrate(
        &self,
        spec: &RunSpec,
        options: &OrchestrateOptions,
    ) -> Result<RunOutcome, OrchestrateError> {
        if spec.run_command.trim().is_empty() {
            return Err(OrchestrateError::MissingRunCommand(spec.name.clone()));
        }
        let prepared = self.prepare(spec, options)?;
        info!(
            "orchestrate_begin: project={} workdir={} dashboard={}",
            spec.name,
            prepared.workdir.display(),
            options.dashboard
        );
        if options.dashboard {
            self.run_dashboard(spec, options, prepared).await
        } else {
            self.run_plain(spec, options, prepared).await
        }
    }

    /// Everything that may prompt happens here, before any terminal takeover.
    fn prepare(&self, spec: &RunSpec, options: &OrchestrateOptions) -> Result<Prepared, OrchestrateError> {
        let current = std::env::current_dir()
            .map_err(|_| OrchestrateError::MissingWorkdir(PathBuf::from(".")))?;
        let workdir =
            workdir::resolve_workdir(options.workdir.as_deref(), &current, spec.monorepo.as_ref());
        if !workdir.is_dir() {
            return Err(OrchestrateError::MissingWorkdir(workdir));
        }

        let mut env = EnvBuilder::new(self.search_paths.clone());
        match env::load_env_files(&workdir, options.environment.as_deref()) {
            Ok(vars) => env.extend(vars),
            Err(err) => warn!("env_files_unreadable: dir={} error={err}", workdir.display()),
        }
        let skipped = if options.skip_env_check {
            Vec::new()
        } else {
            env::resolve_required(spec, &mut env, self.prompt.as_ref(), options.interactive)?
        };
        Ok(Prepared {
            workdir,
            env,
            skipped,
        })
    }

    async fn run_plain(
        &self,
        spec: &RunSpec,
        options: &OrchestrateOptions,
        prepared: Prepared,
    ) -> Result<RunOutcome, OrchestrateError> {
        let project = Arc::new(Project::new(spec.name.clone(), prepared.workdir.clone()));
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let drain_project = project.clone();
        let drain = tokio::spawn(async move {
            let projects = vec![drain_project];
            while let Some(event) = rx.recv().await {
                if event == SupervisorEvent::Shutdown {
                    break;
                }
                apply_event(&projects, event);
            }
        });
        let session = Session::plain(project.clone(), tx);

        let result = tokio::select! {
            result = self.pipeline(spec, options, prepared, &session, false) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted: project={}", spec.name);
                let report = graceful_shutdown(std::slice::from_ref(&project)).await;
                debug!("interrupt_shutdown: stopped={} timed_out={}", report.stopped, report.timed_out);
                Ok(RunOutcome {
                    interrupted: true,
                    ..RunOutcome::default()
                })
            }
        };
        drop(session);
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("plain_drain_timeout: project={}", spec.name);
        }

        let mut outcome = result?;
        outcome.url = project.url();
        outcome.port = outcome.port.or(project.port());
        if outcome.exit_code.is_none() {
            outcome.exit_code = project.exit_code();
        }
        Ok(outcome)
    }

    async fn run_dashboard(
        &self,
        spec: &RunSpec,
        options: &OrchestrateOptions,
        prepared: Prepared,
    ) -> Result<RunOutcome, OrchestrateError> {
        let dashboard = Dashboard::new(format!("devrun · {}", spec.name));
        let handle = dashboard.handle();
        let index = handle.add_project(spec.name.clone(), prepared.workdir.clone());
        let project = handle.project(index).ok_or_else(|| {
            OrchestrateError::Dashboard(io::Error::new(io::ErrorKind::NotFound, "project not registered"))
        })?;
        let session = Session::dashboard(project.clone(), index, handle.sender());

        let this = self.clone();
        let spec_owned = spec.clone();
        let options_owned = options.clone();
        let pipeline = tokio::spawn(async move {
            let result = this
                .pipeline(&spec_owned, &options_owned, prepared, &session, true)
                .await;
            if let Err(err) = &result {
                if !err.is_interrupted() {
                    session.warn("run_failed", err.to_string()).await;
                    session.update(Phase::Error, Status::Error).await;
                }
            }
            result
        });

        let report = match dashboard.start().await {
            Ok(report) => report,
            Err(err) => {
                pipeline.abort();
                let _ = pipeline.await;
                graceful_shutdown(std::slice::from_ref(&project)).await;
                return Err(OrchestrateError::Dashboard(err));
            }
        };
        debug!("dashboard_closed: stopped={} swept={}", report.stopped, report.swept);

        let mut outcome = if pipeline.is_finished() {
            match pipeline.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) if err.is_interrupted() => RunOutcome::default(),
                Ok(Err(err)) => return Err(err),
                Err(err) => {
                    warn!("pipeline_join_failed: {err}");
                    RunOutcome::default()
                }
            }
        } else {
            pipeline.abort();
            let _ = pipeline.await;
            RunOutcome::default()
        };
        outcome.interrupted = true;
        outcome.url = project.url();
        outcome.port = outcome.port.or(project.port());
        outcome.exit_code = project.exit_code();
        Ok(outcome)
    }

    async fn install_dependencies(
        &self,
        spec: &RunSpec,
        dirs: Vec<PathBuf>,
        env: &EnvBuilder,
        session: &Session,
        concurrency: u32,
    ) -> Result<(), OrchestrateError> {
        let hint = spec.package_manager.as_deref();
        let batch = self.governor.batch_size_for(dirs.len(), spec.resources.batch_size);
        let cooldown = Duration::from_millis(spec.resources.cooldown_ms.unwrap_or(0));
        let provider = self.provider.as_ref();
        let checks = run_batched(dirs, batch, cooldown, move |dir: PathBuf| async move {
            provider.inspect(&dir, hint, env.search_paths(), env.inherited_path())
        })
        .await;

        for check in checks.into_iter().flatten() {
            if check.needs_install {
                if !check.installed {
                    session
                        .warn(
                            "package_manager_missing",
                            format!(
                                "{} not found; skipping dependency install in {}",
                                check.manager.program(),
                                check.dir.display()
                            ),
                        )
                        .await;
                    continue;
                }
                let command = inject_concurrency_flag(&check.command_line(), concurrency);
                if let Err(err) = session
                    .run_step(Phase::Setup, &command, &check.dir, &env.build(), INSTALL_TIMEOUT)
                    .await
                {
                    if err.is_interruption() {
                        return Err(OrchestrateError::Install(err));
                    }
                    session
                        .warn(
                            "dependency_install_failed",
                            format!("{err}; continuing without verified dependencies"),
                        )
                        .await;
                }
            }
            if let Some(path) = check.search_path.filter(|path| path.is_dir()) {
                if env.search_paths().append(path.clone()) {
                    debug!("search_path_added: {}", path.display());
                }
            }
        }
        Ok(())
    }

    async fn pipeline(
        &self,
        spec: &RunSpec,
        options: &OrchestrateOptions,
        prepared: Prepared,
        session: &Session,
        detach: bool,
    ) -> Result<RunOutcome, OrchestrateError> {
        let Prepared {
            workdir,
            mut env,
            skipped,
        } = prepared;
        for name in skipped {
            session
                .warn("env_required_missing", format!("{name} is required but not set"))
                .await;
        }
        let concurrency = self
            .governor
            .concurrency_for(spec.resources.thermal_mode, spec.resources.concurrency);

        let (mut command, cwd, mut dirs) = match workdir::resolve_cd_prefix(&spec.run_command, &workdir) {
            CdResolution::Resolved {
                dir,
                command,
                visited,
            } => {
                let mut dirs = vec![workdir.clone()];
                dirs.extend(visited);
                (command, dir, dirs)
            }
            CdResolution::Missing { missing } => {
                session
                    .warn(
                        "cd_target_missing",
                        format!("{} does not exist; running the command unchanged", missing.display()),
                    )
                    .await;
                (spec.run_command.clone(), workdir.clone(), vec![workdir.clone()])
            }
            CdResolution::Unchanged => (spec.run_command.clone(), workdir.clone(), vec![workdir.clone()]),
        };
        dirs.dedup();

        if options.skip_setup {
            debug!("dependency_check_skipped: project={}", spec.name);
        } else {
            self.install_dependencies(spec, dirs, &env, session, concurrency)
                .await?;
        }

        if let Some(program) =
            runtime::missing_runtime(&spec.language, env.search_paths(), env.inherited_path())
        {
            session
                .warn(
                    "runtime_missing",
                    format!("{program} not found on PATH; trying to run {} anyway", spec.name),
                )
                .await;
        }

        if let Some(setup) = spec.setup.as_ref().filter(|setup| !setup.command.trim().is_empty()) {
            if setup.mandatory || !options.skip_setup {
                let setup_command = inject_concurrency_flag(&setup.command, concurrency);
                session
                    .run_step(Phase::Setup, &setup_command, &workdir, &env.build(), SETUP_TIMEOUT)
                    .await
                    .map_err(OrchestrateError::Setup)?;
            } else {
                session.info("setup_skipped", "skipping setup").await;
            }
        }

        if let Some(binary) = build::build_target(&command, &cwd, options.build) {
            match build::plan_build(&cwd, binary.as_deref()) {
                Some(plan) => {
                    session
                        .info("auto_build", format!("building with {}", plan.descriptor))
                        .await;
                    let build_command = inject_concurrency_flag(&plan.command, concurrency);
                    session
                        .run_step(Phase::Build, &build_command, &cwd, &env.build(), BUILD_TIMEOUT)
                        .await
                        .map_err(OrchestrateError::Build)?;
                }
                None => {
                    session
                        .warn(
                            "build_descriptor_missing",
                            format!(
                                "no Makefile, go.mod or Cargo.toml in {}; skipping auto-build",
                                cwd.display()
                            ),
                        )
                        .await;
                }
            }
        }

        let mut port = None;
        if spec.is_static() {
            debug!("port_handling_skipped: project={} (static)", spec.name);
        } else if let Some(explicit) = options.port {
            if !ports::is_available(explicit) {
                session
                    .warn("port_busy", format!("requested port {explicit} is already in use"))
                    .await;
            }
            command = ports::apply_port_override(&command, explicit);
            env.set("PORT", explicit.to_string());
            port = Some(explicit);
        } else {
            let probe = ports::extract_port(&command);
            if probe.found && options.no_port_shift {
                if !ports::is_available(probe.port) {
                    session
                        .warn(
                            "port_busy",
                            format!(
                                "port {} is already in use; continuing because port shifting is disabled",
                                probe.port
                            ),
                        )
                        .await;
                }
                port = Some(probe.port);
            } else if probe.found {
                let shift = ports::check_and_shift(&command)?;
                if shift.shifted {
                    session
                        .warn(
                            "port_shifted",
                            format!(
                                "port {} is busy; using {}",
                                probe.port,
                                shift.port.unwrap_or_default()
                            ),
                        )
                        .await;
                }
                command = shift.command;
                port = shift.port;
            }
        }
        session.project().set_port(port);

        let command = inject_concurrency_flag(&command, concurrency);
        let running = session
            .spawn(Phase::Run, &command, &cwd, &env.build())
            .await
            .map_err(OrchestrateError::Run)?;
        let mut outcome = RunOutcome {
            command,
            cwd,
            port,
            ..RunOutcome::default()
        };
        if detach {
            running.detach();
            return Ok(outcome);
        }
        running.wait().await.map_err(OrchestrateError::Run)?;
        outcome.exit_code = Some(0);
        Ok(outcome)
    }
}
