use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod governor;
pub mod ports;
pub mod search_path;

pub use governor::{Governor, HardwareProfile, Platform};
pub use ports::{PortError, PortPattern, PortProbe, PortShift};
pub use search_path::SearchPaths;

/// Declarative description of how to run one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSpec {
    pub name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub setup: Option<SetupSpec>,
    #[serde(default, rename = "run")]
    pub run_command: String,
    #[serde(default)]
    pub env: Vec<EnvRequirement>,
    #[serde(default)]
    pub monorepo: Option<MonorepoInfo>,
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub resources: ResourceHints,
}

impl RunSpec {
    pub fn required_env(&self) -> impl Iterator<Item = &EnvRequirement> {
        self.env.iter().filter(|req| req.required)
    }

    /// Static sites are served from disk and never take part in port handling.
    pub fn is_static(&self) -> bool {
        matches!(
            self.language.trim().to_ascii_lowercase().as_str(),
            "html" | "static" | "css"
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupSpec {
    pub command: String,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvRequirement {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonorepoInfo {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub thermal_mode: ThermalMode,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThermalMode {
    #[default]
    Auto,
    Cool,
    Performance,
}

impl ThermalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalMode::Auto => "auto",
            ThermalMode::Cool => "cool",
            ThermalMode::Performance => "performance",
        }
    }
}

impl fmt::Display for ThermalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThermalMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(ThermalMode::Auto),
            "cool" | "quiet" => Ok(ThermalMode::Cool),
            "performance" | "perf" => Ok(ThermalMode::Performance),
            other => Err(format!("Unknown thermal mode: {other}")),
        }
    }
}

/// Coarse lifecycle stage of a tracked run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Idle,
    Setup,
    Build,
    Run,
    Stopped,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Setup => "setup",
            Phase::Build => "build",
            Phase::Run => "run",
            Phase::Stopped => "stopped",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Stopped | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state, orthogonal to [`Phase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Error => "error",
            Status::Stopped => "stopped",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Status::Success | Status::Error | Status::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `1/true/yes/on` and `0/false/no/off`.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
