use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Process-wide list of extra binary directories (freshly installed tooling).
///
/// Append-only; readers always get a copy so a concurrent append can never
/// change the PATH of a command that is already being assembled.
#[derive(Debug, Default)]
pub struct SearchPaths {
    entries: RwLock<Vec<PathBuf>>,
}

impl SearchPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the path was already registered.
    pub fn append(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.contains(&path) {
            return false;
        }
        entries.push(path);
        true
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        match self.entries.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Registered entries first, then the inherited `PATH`.
    pub fn path_var(&self, inherited: Option<&OsString>) -> OsString {
        let mut dirs = self.snapshot();
        if let Some(inherited) = inherited {
            dirs.extend(std::env::split_paths(inherited));
        }
        std::env::join_paths(dirs.iter().filter(|dir| !dir.as_os_str().is_empty()))
            .unwrap_or_else(|_| inherited.cloned().unwrap_or_default())
    }

    /// Locates an executable on the registered entries and `PATH`.
    pub fn which(&self, program: &str, inherited: Option<&OsString>) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            let candidate = PathBuf::from(program);
            return is_executable(&candidate).then_some(candidate);
        }
        let path_var = self.path_var(inherited);
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
