//! Environment assembly for spawned commands: process env, `.env` files,
//! interactively supplied values and the search-path registry.

use crate::error::OrchestrateError;
use devrun_core::{RunSpec, SearchPaths};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Env file names in load order; later files override earlier ones.
pub fn env_file_names(label: Option<&str>) -> Vec<String> {
    let mut names = vec![".env".to_string(), ".env.local".to_string()];
    if let Some(label) = label.map(str::trim).filter(|label| !label.is_empty()) {
        names.push(format!(".env.{label}"));
        names.push(format!(".env.{label}.local"));
    }
    names
}

/// Parses `KEY=VALUE` lines. Accepts an `export ` prefix, single quotes
/// (literal) and double quotes (with `\n`, `\"` and `\\` escapes). Unquoted
/// values lose a trailing ` # comment`.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        vars.push((key.to_string(), parse_value(raw.trim())));
    }
    vars
}

fn parse_value(raw: &str) -> String {
    if let Some(inner) = raw.strip_prefix('\'') {
        return match inner.find('\'') {
            Some(end) => inner[..end].to_string(),
            None => inner.to_string(),
        };
    }
    if let Some(inner) = raw.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => break,
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                },
                other => value.push(other),
            }
        }
        return value;
    }
    match raw.find(" #") {
        Some(pos) => raw[..pos].trim_end().to_string(),
        None => raw.to_string(),
    }
}

/// Loads and merges every env file present in `dir`.
pub fn load_env_files(dir: &Path, label: Option<&str>) -> io::Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for name in env_file_names(label) {
        let path = dir.join(&name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let vars = parse_env_file(&content);
        debug!("env_file_loaded: file={} vars={}", path.display(), vars.len());
        merged.extend(vars);
    }
    Ok(merged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingEnvChoice {
    Skip,
    Supply(String),
    Abort,
}

/// Asks what to do about a required variable that has no value.
pub trait EnvPrompt: Send + Sync {
    fn resolve_missing(&self, name: &str) -> io::Result<MissingEnvChoice>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl EnvPrompt for StdinPrompt {
    fn resolve_missing(&self, name: &str) -> io::Result<MissingEnvChoice> {
        let stdin = io::stdin();
        let mut stderr = io::stderr();
        loop {
            write!(stderr, "{name} is required but not set. [s]kip, [e]nter value, [a]bort? ")?;
            stderr.flush()?;
            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer)? == 0 {
                return Ok(MissingEnvChoice::Abort);
            }
            match answer.trim().to_ascii_lowercase().as_str() {
                "s" | "skip" | "" => return Ok(MissingEnvChoice::Skip),
                "a" | "abort" => return Ok(MissingEnvChoice::Abort),
                "e" | "enter" => {
                    write!(stderr, "{name}=")?;
                    stderr.flush()?;
                    let mut value = String::new();
                    stdin.lock().read_line(&mut value)?;
                    return Ok(MissingEnvChoice::Supply(value.trim_end_matches(['\r', '\n']).to_string()));
                }
                _ => continue,
            }
        }
    }
}

/// Builds the complete environment handed to every child process.
///
/// Layering, lowest first: the inherited process env, env files, values
/// supplied at the prompt, explicit overrides such as `PORT`. `PATH` is
/// always recomputed from the search-path registry.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    base: HashMap<OsString, OsString>,
    inherited_path: Option<OsString>,
    search_paths: Arc<SearchPaths>,
}

impl EnvBuilder {
    pub fn new(search_paths: Arc<SearchPaths>) -> Self {
        Self::from_vars(std::env::vars_os(), search_paths)
    }

    pub fn from_vars(
        vars: impl IntoIterator<Item = (OsString, OsString)>,
        search_paths: Arc<SearchPaths>,
    ) -> Self {
        let mut base: HashMap<OsString, OsString> = vars.into_iter().collect();
        let inherited_path = base.remove(&OsString::from("PATH"));
        Self {
            base,
            inherited_path,
            search_paths,
        }
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        if key == "PATH" {
            self.inherited_path = Some(value);
        } else {
            self.base.insert(key, value);
        }
    }

    pub fn extend<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (key, value) in vars {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        if key == "PATH" {
            return self.inherited_path.as_ref();
        }
        self.base.get(&OsString::from(key))
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| !value.is_empty())
    }

    pub fn search_paths(&self) -> &SearchPaths {
        &self.search_paths
    }

    pub fn inherited_path(&self) -> Option<&OsString> {
        self.inherited_path.as_ref()
    }

    /// Snapshot for one spawn. The registry is read once, so an append during
    /// the spawn cannot change this command's PATH.
    pub fn build(&self) -> HashMap<OsString, OsString> {
        let mut env = self.base.clone();
        env.insert(
            OsString::from("PATH"),
            self.search_paths.path_var(self.inherited_path.as_ref()),
        );
        env
    }
}

/// Resolves required variables that are still unset after the env files.
/// Interactive flows ask `prompt`; automated flows warn and move on.
pub fn resolve_required(
    spec: &RunSpec,
    env: &mut EnvBuilder,
    prompt: &dyn EnvPrompt,
    interactive: bool,
) -> Result<Vec<String>, OrchestrateError> {
    let mut skipped = Vec::new();
    for requirement in &spec.env {
        if env.has_value(&requirement.name) {
            continue;
        }
        if !requirement.required {
            debug!("env_optional_unset: name={}", requirement.name);
            continue;
        }
        if !interactive {
            warn!("env_required_missing: name={} (non-interactive, skipping)", requirement.name);
            skipped.push(requirement.name.clone());
            continue;
        }
        match prompt
            .resolve_missing(&requirement.name)
            .map_err(OrchestrateError::Prompt)?
        {
            MissingEnvChoice::Skip => {
                info!("env_required_skipped: name={}", requirement.name);
                skipped.push(requirement.name.clone());
            }
            MissingEnvChoice::Supply(value) => {
                env.set(requirement.name.clone(), value);
            }
            MissingEnvChoice::Abort => {
                return Err(OrchestrateError::EnvAborted(requirement.name.clone()));
            }
        }
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devrun_core::EnvRequirement;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<MissingEnvChoice>>);

    impl EnvPrompt for Scripted {
        fn resolve_missing(&self, _name: &str) -> io::Result<MissingEnvChoice> {
            let mut answers = self.0.lock().expect("lock");
            Ok(if answers.is_empty() {
                MissingEnvChoice::Skip
            } else {
                answers.remove(0)
            })
        }
    }

    fn builder(vars: &[(&str, &str)]) -> EnvBuilder {
        EnvBuilder::from_vars(
            vars.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))),
            Arc::new(SearchPaths::new()),
        )
    }

    fn spec_requiring(names: &[(&str, bool)]) -> RunSpec {
        RunSpec {
            name: "app".into(),
            env: names
                .iter()
                .map(|(name, required)| EnvRequirement {
                    name: name.to_string(),
                    required: *required,
                })
                .collect(),
            ..RunSpec::default()
        }
    }

    #[test]
    fn parses_quotes_exports_and_comments() {
        let content = r#"
# comment
export API_URL=http://localhost:8000 # trailing
SECRET='a # b'
GREETING="hello\nworld"
EMPTY=
not a var
BAD KEY=1
"#;
        let vars: BTreeMap<_, _> = parse_env_file(content).into_iter().collect();
        assert_eq!(vars["API_URL"], "http://localhost:8000");
        assert_eq!(vars["SECRET"], "a # b");
        assert_eq!(vars["GREETING"], "hello\nworld");
        assert_eq!(vars["EMPTY"], "");
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn label_files_override_base_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".env"), "A=base\nB=base\nC=base\n").expect("write");
        std::fs::write(dir.path().join(".env.local"), "B=local\n").expect("write");
        std::fs::write(dir.path().join(".env.staging"), "C=staging\n").expect("write");
        std::fs::write(dir.path().join(".env.production"), "C=production\n").expect("write");

        let vars = load_env_files(dir.path(), Some("staging")).expect("load");
        assert_eq!(vars["A"], "base");
        assert_eq!(vars["B"], "local");
        assert_eq!(vars["C"], "staging");
    }

    #[test]
    fn path_comes_from_registry_then_inherited() {
        let mut env = builder(&[("PATH", "/usr/bin"), ("HOME", "/home/dev")]);
        env.search_paths().append("/opt/tools/bin");
        env.set("PORT", "4000");
        let built = env.build();
        assert_eq!(built[&OsString::from("PATH")], OsString::from("/opt/tools/bin:/usr/bin"));
        assert_eq!(built[&OsString::from("PORT")], OsString::from("4000"));
        assert_eq!(built[&OsString::from("HOME")], OsString::from("/home/dev"));
    }

    #[test]
    fn non_interactive_skips_missing_required() {
        let spec = spec_requiring(&[("DATABASE_URL", true), ("SENTRY_DSN", false)]);
        let mut env = builder(&[]);
        let prompt = Scripted(Mutex::new(vec![MissingEnvChoice::Abort]));
        let skipped = resolve_required(&spec, &mut env, &prompt, false).expect("resolve");
        assert_eq!(skipped, vec!["DATABASE_URL".to_string()]);
    }

    #[test]
    fn interactive_supply_and_abort() {
        let spec = spec_requiring(&[("DATABASE_URL", true), ("API_KEY", true)]);
        let mut env = builder(&[]);
        let prompt = Scripted(Mutex::new(vec![
            MissingEnvChoice::Supply("postgres://localhost/app".into()),
            MissingEnvChoice::Abort,
        ]));
        let err = resolve_required(&spec, &mut env, &prompt, true).expect_err("abort");
        assert!(matches!(err, OrchestrateError::EnvAborted(ref name) if name == "API_KEY"));
        assert!(env.has_value("DATABASE_URL"));
    }

    #[test]
    fn present_values_are_not_prompted() {
        let spec = spec_requiring(&[("DATABASE_URL", true)]);
        let mut env = builder(&[("DATABASE_URL", "sqlite://dev.db")]);
        let prompt = Scripted(Mutex::new(vec![MissingEnvChoice::Abort]));
        let skipped = resolve_required(&spec, &mut env, &prompt, true).expect("resolve");
        assert!(skipped.is_empty());
    }
}
