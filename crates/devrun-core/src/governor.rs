//! Hardware-aware concurrency policy.

use crate::ThermalMode;
use futures_util::future::join_all;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use sysinfo::System;
use tracing::debug;

/// Below this many items batching buys nothing.
pub const BATCH_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            _ => Platform::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    pub cores: usize,
    pub platform: Platform,
    /// Passively cooled or ultra-low-power laptop class.
    pub fanless: bool,
    /// Efficiency-oriented chip family (mobile/ARM/U-series class).
    pub high_efficiency: bool,
    pub model: String,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            cores: 4,
            platform: Platform::current(),
            fanless: false,
            high_efficiency: false,
            model: String::new(),
        }
    }
}

pub fn detect_hardware() -> HardwareProfile {
    let mut system = System::new();
    system.refresh_cpu_all();
    let chip = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|_| system.cpus().len().max(1));
    let platform = Platform::current();
    let profile = classify_hardware(
        cores,
        platform,
        std::env::consts::ARCH,
        &chip,
        &product_name(platform),
    );
    debug!(
        "hardware_profile: cores={} platform={} fanless={} high_efficiency={} model={}",
        profile.cores, profile.platform, profile.fanless, profile.high_efficiency, profile.model
    );
    profile
}

fn classify_hardware(
    cores: usize,
    platform: Platform,
    arch: &str,
    chip: &str,
    product: &str,
) -> HardwareProfile {
    let apple_silicon = chip.starts_with("Apple");
    HardwareProfile {
        cores,
        platform,
        fanless: is_fanless_product(product) || is_fanless_chip(chip),
        high_efficiency: apple_silicon || arch == "aarch64" || is_low_power_chip(chip),
        model: match (product.is_empty(), chip.is_empty()) {
            (false, false) => format!("{product} ({chip})"),
            (false, true) => product.to_string(),
            _ => chip.to_string(),
        },
    }
}

/// Machine name from the firmware tables; empty where none is exposed.
fn product_name(platform: Platform) -> String {
    if platform != Platform::Linux {
        return String::new();
    }
    std::fs::read_to_string("/sys/class/dmi/id/product_name")
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default()
}

fn is_low_power_chip(chip: &str) -> bool {
    let lower = chip.to_ascii_lowercase();
    ["celeron", "atom", "pentium silver", "pentium gold", "core m", "snapdragon", "cortex"]
        .iter()
        .any(|marker| lower.contains(marker))
        || chip
            .split_whitespace()
            .any(|token| token.len() > 4 && (token.ends_with('U') || token.ends_with('Y')) && token.chars().any(|c| c.is_ascii_digit()))
}

fn is_fanless_chip(chip: &str) -> bool {
    let lower = chip.to_ascii_lowercase();
    ["core m", "atom", "raspberry", "cortex-a"]
        .iter()
        .any(|marker| lower.contains(marker))
        || chip
            .split_whitespace()
            .any(|token| token.len() > 4 && token.ends_with('Y') && token.chars().any(|c| c.is_ascii_digit()))
}

fn is_fanless_product(product: &str) -> bool {
    let lower = product.to_ascii_lowercase();
    ["macbookair", "chromebook", "surface go", "raspberry pi"]
        .iter()
        .any(|marker| lower.replace(' ', "").contains(&marker.replace(' ', "")))
}

/// Parallelism to use when nothing is configured.
pub fn optimal_concurrency(profile: &HardwareProfile, configured: Option<u32>) -> u32 {
    if let Some(value) = configured.filter(|value| *value > 0) {
        return value;
    }
    let cores = profile.cores.max(1) as u32;
    if profile.fanless {
        return (cores / 2).max(2);
    }
    if profile.high_efficiency {
        return (cores * 3 / 4).max(2);
    }
    cores
}

pub fn optimal_batch_size(profile: &HardwareProfile, items: usize, configured: Option<u32>) -> usize {
    if let Some(value) = configured.filter(|value| *value > 0) {
        return value as usize;
    }
    if items < BATCH_THRESHOLD {
        return items.max(1);
    }
    if profile.fanless {
        3
    } else if profile.cores >= 12 {
        10
    } else {
        5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagPosition {
    Append,
    AfterCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConcurrencyTool {
    Npm,
    Pnpm,
    Yarn,
    Make,
    Ninja,
    Cargo,
    Maven,
    Gradle,
}

impl ConcurrencyTool {
    fn from_program(program: &str) -> Option<Self> {
        match program {
            "npm" => Some(Self::Npm),
            "pnpm" => Some(Self::Pnpm),
            "yarn" => Some(Self::Yarn),
            "make" | "gmake" => Some(Self::Make),
            "ninja" => Some(Self::Ninja),
            "cargo" => Some(Self::Cargo),
            "mvn" | "./mvnw" | "mvnw" => Some(Self::Maven),
            "gradle" | "./gradlew" | "gradlew" => Some(Self::Gradle),
            _ => None,
        }
    }

    fn flag(&self, n: u32) -> String {
        match self {
            Self::Npm => format!("--maxsockets={n}"),
            Self::Pnpm => format!("--network-concurrency={n}"),
            Self::Yarn => format!("--network-concurrency {n}"),
            Self::Make | Self::Ninja => format!("-j{n}"),
            Self::Cargo => format!("--jobs {n}"),
            Self::Maven => format!("-T {n}"),
            Self::Gradle => format!("--max-workers={n}"),
        }
    }

    fn position(&self) -> FlagPosition {
        match self {
            Self::Make | Self::Ninja | Self::Maven => FlagPosition::AfterCommand,
            _ => FlagPosition::Append,
        }
    }

    fn already_limited(&self, args: &[&str]) -> bool {
        args.iter().any(|arg| match self {
            Self::Npm => arg.starts_with("--maxsockets"),
            Self::Pnpm | Self::Yarn => arg.starts_with("--network-concurrency"),
            Self::Make | Self::Ninja | Self::Cargo => {
                arg.starts_with("-j") || arg.starts_with("--jobs")
            }
            Self::Maven => *arg == "-T" || arg.starts_with("--threads"),
            Self::Gradle => arg.starts_with("--max-workers"),
        })
    }
}

const WRAPPER_SUBCOMMANDS: &[&str] = &["run", "exec", "dlx"];

/// Adds the tool's own concurrency limit to `command`. Unknown tools,
/// wrapper invocations and commands that already carry a limit are untouched.
pub fn inject_concurrency_flag(command: &str, n: u32) -> String {
    if n == 0 {
        return command.to_string();
    }
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = tokens.split_first() else {
        return command.to_string();
    };
    let Some(tool) = ConcurrencyTool::from_program(program) else {
        return command.to_string();
    };
    if args
        .first()
        .is_some_and(|sub| WRAPPER_SUBCOMMANDS.contains(sub))
    {
        return command.to_string();
    }
    if tool.already_limited(args) {
        return command.to_string();
    }
    let flag = tool.flag(n);
    match tool.position() {
        FlagPosition::Append => format!("{} {flag}", command.trim_end()),
        FlagPosition::AfterCommand => {
            let trimmed = command.trim_start();
            let rest = &trimmed[program.len()..];
            format!("{program} {flag}{rest}")
        }
    }
}

/// Hardware profile plus the policy derived from it.
#[derive(Debug, Clone)]
pub struct Governor {
    profile: HardwareProfile,
}

impl Governor {
    pub fn new(profile: HardwareProfile) -> Self {
        Self { profile }
    }

    pub fn detect() -> Self {
        Self::new(detect_hardware())
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn concurrency_for(&self, mode: ThermalMode, configured: Option<u32>) -> u32 {
        match mode {
            ThermalMode::Auto => optimal_concurrency(&self.profile, configured),
            ThermalMode::Cool => {
                let cool = HardwareProfile {
                    fanless: true,
                    ..self.profile.clone()
                };
                optimal_concurrency(&cool, configured)
            }
            ThermalMode::Performance => configured
                .filter(|value| *value > 0)
                .unwrap_or(self.profile.cores.max(1) as u32),
        }
    }

    pub fn batch_size_for(&self, items: usize, configured: Option<u32>) -> usize {
        optimal_batch_size(&self.profile, items, configured)
    }
}

/// Runs `worker` over `items`, in batches with a cooldown between them once
/// the item count reaches [`BATCH_THRESHOLD`].
pub async fn run_batched<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    cooldown: Duration,
    worker: F,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.len() < BATCH_THRESHOLD {
        return join_all(items.into_iter().map(&worker)).await;
    }
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut remaining = items.into_iter().peekable();
    while remaining.peek().is_some() {
        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        results.extend(join_all(batch.into_iter().map(&worker)).await);
        if remaining.peek().is_some() && !cooldown.is_zero() {
            tokio::time::sleep(cooldown).await;
        }
    }
    results
}
