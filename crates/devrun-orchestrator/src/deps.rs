//! Dependency checks keyed by lockfile.

use devrun_core::SearchPaths;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
    Pip,
    Poetry,
    Bundler,
    Go,
    Cargo,
}

/// Checked in order; the first file present decides.
const LOCKFILES: &[(&str, PackageManager)] = &[
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("bun.lockb", PackageManager::Bun),
    ("bun.lock", PackageManager::Bun),
    ("package-lock.json", PackageManager::Npm),
    ("package.json", PackageManager::Npm),
    ("poetry.lock", PackageManager::Poetry),
    ("requirements.txt", PackageManager::Pip),
    ("Gemfile.lock", PackageManager::Bundler),
    ("Gemfile", PackageManager::Bundler),
    ("go.mod", PackageManager::Go),
    ("Cargo.toml", PackageManager::Cargo),
];

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
            PackageManager::Pip => "pip",
            PackageManager::Poetry => "poetry",
            PackageManager::Bundler => "bundler",
            PackageManager::Go => "go",
            PackageManager::Cargo => "cargo",
        }
    }

    pub fn detect(dir: &Path) -> Option<Self> {
        LOCKFILES
            .iter()
            .find(|(file, _)| dir.join(file).is_file())
            .map(|(_, manager)| *manager)
    }

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Bundler => "bundle",
            PackageManager::Pip => "pip3",
            other => other.as_str(),
        }
    }

    pub fn install_args(&self) -> &'static [&'static str] {
        match self {
            PackageManager::Npm | PackageManager::Pnpm | PackageManager::Yarn | PackageManager::Bun => {
                &["install"]
            }
            PackageManager::Pip => &["install", "-r", "requirements.txt"],
            PackageManager::Poetry => &["install"],
            PackageManager::Bundler => &["install"],
            PackageManager::Go => &["mod", "download"],
            PackageManager::Cargo => &["fetch"],
        }
    }

    fn is_javascript(&self) -> bool {
        matches!(
            self,
            PackageManager::Npm | PackageManager::Pnpm | PackageManager::Yarn | PackageManager::Bun
        )
    }

    fn ecosystem(&self) -> &'static str {
        match self {
            manager if manager.is_javascript() => "javascript",
            PackageManager::Pip | PackageManager::Poetry => "python",
            PackageManager::Bundler => "ruby",
            PackageManager::Go => "go",
            _ => "rust",
        }
    }

    /// Directory whose presence means dependencies were installed.
    fn marker(&self) -> Option<&'static str> {
        match self {
            manager if manager.is_javascript() => Some("node_modules"),
            PackageManager::Poetry => Some(".venv"),
            PackageManager::Bundler => Some(".bundle"),
            _ => None,
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(PackageManager::Npm),
            "pnpm" => Ok(PackageManager::Pnpm),
            "yarn" => Ok(PackageManager::Yarn),
            "bun" => Ok(PackageManager::Bun),
            "pip" | "pip3" => Ok(PackageManager::Pip),
            "poetry" => Ok(PackageManager::Poetry),
            "bundler" | "bundle" => Ok(PackageManager::Bundler),
            "go" => Ok(PackageManager::Go),
            "cargo" => Ok(PackageManager::Cargo),
            other => Err(format!("unknown package manager: {other}")),
        }
    }
}

/// What a provider knows about one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheck {
    pub dir: PathBuf,
    pub manager: PackageManager,
    /// The install tool is on the search path.
    pub installed: bool,
    pub needs_install: bool,
    pub command: Vec<String>,
    /// Extra binary directory to register once dependencies are present.
    pub search_path: Option<PathBuf>,
}

impl DependencyCheck {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

pub trait PackageManagerProvider: Send + Sync {
    fn inspect(
        &self,
        dir: &Path,
        hint: Option<&str>,
        search_paths: &SearchPaths,
        inherited_path: Option<&OsString>,
    ) -> Option<DependencyCheck>;
}

/// Picks the tool from the lockfile. A hint only wins within the same
/// ecosystem (`pnpm` over a bare `package.json`, never `npm` over `Gemfile`).
#[derive(Debug, Default)]
pub struct LockfileProvider;

impl PackageManagerProvider for LockfileProvider {
    fn inspect(
        &self,
        dir: &Path,
        hint: Option<&str>,
        search_paths: &SearchPaths,
        inherited_path: Option<&OsString>,
    ) -> Option<DependencyCheck> {
        let detected = PackageManager::detect(dir)?;
        let manager = hint
            .and_then(|hint| hint.parse::<PackageManager>().ok())
            .filter(|hinted| hinted.ecosystem() == detected.ecosystem())
            .unwrap_or(detected);
        let needs_install = manager
            .marker()
            .is_some_and(|marker| !dir.join(marker).exists());
        let installed = search_paths.which(manager.program(), inherited_path).is_some();
        let mut command = vec![manager.program().to_string()];
        command.extend(manager.install_args().iter().map(|arg| arg.to_string()));
        let search_path = manager
            .is_javascript()
            .then(|| dir.join("node_modules").join(".bin"));
        Some(DependencyCheck {
            dir: dir.to_path_buf(),
            manager,
            installed,
            needs_install,
            command,
            search_path,
        })
    }
}
