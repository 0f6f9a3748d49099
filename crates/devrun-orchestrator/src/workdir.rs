use devrun_core::MonorepoInfo;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn cd_regex() -> &'static Regex {
    static CD_RE: OnceLock<Regex> = OnceLock::new();
    CD_RE.get_or_init(|| {
        Regex::new(r#"^\s*cd\s+("[^"]+"|'[^']+'|[^\s&;|]+)\s*&&\s*(.*)$"#).expect("valid regex")
    })
}

/// Explicit override first. A monorepo root wins over the current directory
/// only when the current directory lies outside it.
pub fn resolve_workdir(
    override_dir: Option<&Path>,
    current: &Path,
    monorepo: Option<&MonorepoInfo>,
) -> PathBuf {
    if let Some(dir) = override_dir {
        return if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            current.join(dir)
        };
    }
    if let Some(info) = monorepo {
        let root = if info.root.is_absolute() {
            info.root.clone()
        } else {
            current.join(&info.root)
        };
        if !current.starts_with(&root) {
            return root;
        }
    }
    current.to_path_buf()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdResolution {
    /// Every `cd` target exists; `command` runs in `dir`.
    Resolved {
        dir: PathBuf,
        command: String,
        visited: Vec<PathBuf>,
    },
    /// A `cd` target is missing; the original command is kept as written.
    Missing { missing: PathBuf },
    /// No leading `cd <dir> &&`.
    Unchanged,
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')))
        .unwrap_or(raw)
}

/// Peels leading `cd <dir> && …` prefixes, checking each directory relative
/// to the previous one.
pub fn resolve_cd_prefix(command: &str, base: &Path) -> CdResolution {
    let mut dir = base.to_path_buf();
    let mut rest = command.to_string();
    let mut visited = Vec::new();
    while let Some(caps) = cd_regex().captures(&rest) {
        let target = unquote(&caps[1]);
        let next = if let Some(home_relative) = target.strip_prefix("~/") {
            match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(home_relative),
                None => dir.join(target),
            }
        } else {
            dir.join(target)
        };
        if !next.is_dir() {
            return CdResolution::Missing { missing: next };
        }
        dir = next;
        visited.push(dir.clone());
        rest = caps[2].trim().to_string();
    }
    if visited.is_empty() {
        return CdResolution::Unchanged;
    }
    CdResolution::Resolved {
        dir,
        command: rest,
        visited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_then_monorepo_then_current() {
        let current = Path::new("/work/repo/packages/web");
        let mono = MonorepoInfo {
            root: PathBuf::from("/work/repo"),
        };
        assert_eq!(
            resolve_workdir(Some(Path::new("apps/api")), current, Some(&mono)),
            current.join("apps/api")
        );
        assert_eq!(resolve_workdir(None, current, Some(&mono)), current);
        assert_eq!(
            resolve_workdir(None, Path::new("/elsewhere"), Some(&mono)),
            PathBuf::from("/work/repo")
        );
        assert_eq!(resolve_workdir(None, current, None), current);
    }

    #[test]
    fn nested_cd_prefixes_resolve_recursively() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("apps/web")).expect("mkdir");
        let resolution = resolve_cd_prefix("cd apps && cd 'web' && npm run dev", root.path());
        match resolution {
            CdResolution::Resolved {
                dir,
                command,
                visited,
            } => {
                assert_eq!(dir, root.path().join("apps/web"));
                assert_eq!(command, "npm run dev");
                assert_eq!(visited.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_directory_stops_resolution() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join("apps")).expect("mkdir");
        assert_eq!(
            resolve_cd_prefix("cd apps && cd ghost && make run", root.path()),
            CdResolution::Missing {
                missing: root.path().join("apps/ghost")
            }
        );
        assert_eq!(resolve_cd_prefix("npm start", root.path()), CdResolution::Unchanged);
    }
}
