use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use devrun_core::{parse_bool_flag, ports, EnvRequirement, RunSpec, SetupSpec, ThermalMode};
use devrun_orchestrator::{OrchestrateError, OrchestrateOptions, Orchestrator, StepFailure};
use std::env;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Conventional exit status for a run stopped with Ctrl-C.
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Parser)]
#[command(name = "devrun")]
#[command(about = "Set up, build and run a project locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Orchestrate setup, build and run for one project
    Run(RunArgs),
    /// Show the detected hardware profile and derived concurrency
    Hardware,
    /// Show which port a command binds and where it would move if busy
    Port {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// JSON run spec; explicit flags override its fields
    #[arg(long, value_name = "FILE")]
    spec: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// Command that starts the project
    #[arg(long = "run", value_name = "COMMAND")]
    run_command: Option<String>,
    #[arg(long, value_name = "COMMAND")]
    setup: Option<String>,
    /// Run setup even with --skip-setup
    #[arg(long)]
    setup_mandatory: bool,
    /// Environment variable the project cannot start without
    #[arg(long = "require-env", value_name = "NAME")]
    require_env: Vec<String>,
    #[arg(long)]
    package_manager: Option<String>,
    #[arg(long)]
    concurrency: Option<u32>,
    #[arg(long, value_name = "auto|cool|performance")]
    thermal_mode: Option<ThermalMode>,
    /// Env file label: loads .env.<LABEL> and .env.<LABEL>.local
    #[arg(long = "env", value_name = "LABEL")]
    environment: Option<String>,
    /// Build before running even when the binary exists
    #[arg(long)]
    build: bool,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    no_port_shift: bool,
    #[arg(long)]
    skip_setup: bool,
    #[arg(long)]
    skip_env_check: bool,
    #[arg(long)]
    no_dashboard: bool,
    #[arg(long)]
    workdir: Option<PathBuf>,
}

/// Log sinks for the life of the command. Every writer the subscriber
/// asks for is a clone sharing the same file.
#[derive(Clone)]
struct LogGuard {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl LogGuard {
    fn new(file: Option<std::fs::File>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file: file.map(|file| Arc::new(StdMutex::new(file))),
        }
    }
}

impl Write for LogGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let code = run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Hardware => {
            let _guard = init_logging("cli", resolve_log_stderr(false));
            hardware();
        }
        Commands::Port { command } => {
            let _guard = init_logging("cli", resolve_log_stderr(false));
            port(&command.join(" "))?;
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let spec = load_spec(&args)?;
    let dashboard = !args.no_dashboard && !resolve_no_dashboard() && io::stdout().is_terminal();
    let _guard = init_logging(&spec.name, resolve_log_stderr(dashboard));
    let options = OrchestrateOptions {
        environment: args.environment.clone(),
        build: args.build,
        port: args.port,
        no_port_shift: args.no_port_shift,
        skip_setup: args.skip_setup,
        skip_env_check: args.skip_env_check,
        dashboard,
        workdir: args.workdir.clone(),
        interactive: io::stdin().is_terminal(),
    };

    let orchestrator = Orchestrator::detect();
    let outcome = match orchestrator.orchestrate(&spec, &options).await {
        Ok(outcome) => outcome,
        Err(OrchestrateError::Run(StepFailure::Exit { command, code })) => {
            error!("run_exit: project={} command={command} code={code}", spec.name);
            eprintln!("devrun: `{command}` exited with code {code}");
            return Ok(code);
        }
        Err(err) if err.is_interrupted() => {
            info!("run_interrupted: project={} reason={err}", spec.name);
            return Ok(INTERRUPTED_EXIT);
        }
        Err(err) => return Err(err).with_context(|| format!("could not run {}", spec.name)),
    };
    info!(
        "run_complete: project={} cwd={} port={:?} url={:?} exit={:?}",
        spec.name,
        outcome.cwd.display(),
        outcome.port,
        outcome.url,
        outcome.exit_code
    );
    if outcome.interrupted && !dashboard {
        return Ok(INTERRUPTED_EXIT);
    }
    Ok(outcome.exit_code.unwrap_or(0))
}

/// Reads the optional JSON spec and layers explicit flags over it.
fn load_spec(args: &RunArgs) -> Result<RunSpec> {
    let mut spec = match &args.spec {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<RunSpec>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => RunSpec::default(),
    };
    if let Some(name) = &args.name {
        spec.name = name.clone();
    }
    if let Some(language) = &args.language {
        spec.language = language.clone();
    }
    if let Some(run_command) = &args.run_command {
        spec.run_command = run_command.clone();
    }
    if let Some(command) = &args.setup {
        spec.setup = Some(SetupSpec {
            command: command.clone(),
            mandatory: args.setup_mandatory,
        });
    } else if args.setup_mandatory {
        if let Some(setup) = spec.setup.as_mut() {
            setup.mandatory = true;
        }
    }
    for name in &args.require_env {
        match spec.env.iter_mut().find(|req| &req.name == name) {
            Some(req) => req.required = true,
            None => spec.env.push(EnvRequirement {
                name: name.clone(),
                required: true,
            }),
        }
    }
    if let Some(manager) = &args.package_manager {
        spec.package_manager = Some(manager.clone());
    }
    if args.concurrency.is_some() {
        spec.resources.concurrency = args.concurrency;
    }
    if let Some(mode) = args.thermal_mode {
        spec.resources.thermal_mode = mode;
    }
    if spec.name.trim().is_empty() {
        spec.name = default_name(args.workdir.as_deref());
    }
    if spec.run_command.trim().is_empty() {
        anyhow::bail!("no run command: pass --run or a --spec file with a \"run\" field");
    }
    Ok(spec)
}

fn default_name(workdir: Option<&Path>) -> String {
    workdir
        .map(Path::to_path_buf)
        .or_else(|| env::current_dir().ok())
        .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string())
}

fn hardware() {
    let orchestrator = Orchestrator::detect();
    let governor = orchestrator.governor();
    let profile = governor.profile();
    println!("platform:        {}", profile.platform);
    println!("cores:           {}", profile.cores);
    if !profile.model.is_empty() {
        println!("model:           {}", profile.model);
    }
    println!("fanless:         {}", profile.fanless);
    println!("high efficiency: {}", profile.high_efficiency);
    for mode in [ThermalMode::Auto, ThermalMode::Cool, ThermalMode::Performance] {
        println!(
            "concurrency ({:<11}) {}",
            format!("{mode}):"),
            governor.concurrency_for(mode, None)
        );
    }
    println!("batch size (10 items): {}", governor.batch_size_for(10, None));
}

fn port(command: &str) -> Result<()> {
    let probe = ports::extract_port(command);
    if !probe.found {
        println!("no port detected");
        return Ok(());
    }
    let pattern = probe.pattern.map(|pattern| pattern.as_str()).unwrap_or("none");
    let state = if ports::is_available(probe.port) {
        "free"
    } else {
        "busy"
    };
    println!("port {} ({pattern}: `{}`) is {state}", probe.port, probe.matched);
    let shift = ports::check_and_shift(command).context("Failed to shift port")?;
    if shift.shifted {
        println!("shifted to {}: {}", shift.port.unwrap_or_default(), shift.command);
    }
    Ok(())
}

fn init_logging(name: &str, stderr_enabled: bool) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(resolve_log_level()));
    let file = resolve_log_dir().and_then(|dir| match open_log_file(&dir, name) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    });
    let guard = LogGuard::new(file, stderr_enabled);
    let writer = guard.clone();
    let make_writer = BoxMakeWriter::new(move || writer.clone());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(dir: &Path, name: &str) -> io::Result<std::fs::File> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("devrun-{}.log", sanitize_component(name)));
    OpenOptions::new().create(true).append(true).open(path)
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn resolve_log_level() -> String {
    log_level_from(env::var("DEVRUN_LOG_LEVEL").ok())
}

fn log_level_from(value: Option<String>) -> String {
    value
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn resolve_log_dir() -> Option<PathBuf> {
    env::var_os("DEVRUN_LOG_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn resolve_log_stderr(dashboard: bool) -> bool {
    log_stderr_from(dashboard, env::var("DEVRUN_LOG_STDERR").ok().as_deref())
}

/// The dashboard owns the terminal, so stderr logging is opt-in there.
fn log_stderr_from(dashboard: bool, value: Option<&str>) -> bool {
    value.and_then(parse_bool_flag).unwrap_or(!dashboard)
}

fn resolve_no_dashboard() -> bool {
    env::var("DEVRUN_NO_DASHBOARD")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}
