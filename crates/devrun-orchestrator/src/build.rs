use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDescriptor {
    Makefile,
    GoModule,
    Cargo,
}

impl BuildDescriptor {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildDescriptor::Makefile => "Makefile",
            BuildDescriptor::GoModule => "go.mod",
            BuildDescriptor::Cargo => "Cargo.toml",
        }
    }
}

impl fmt::Display for BuildDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub descriptor: BuildDescriptor,
    pub command: String,
}

fn is_env_assignment(token: &str) -> bool {
    token
        .split_once('=')
        .is_some_and(|(name, _)| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// The `./relative` executable a run command starts with, if any.
pub fn referenced_binary(command: &str) -> Option<String> {
    let program = command
        .split_whitespace()
        .find(|token| !is_env_assignment(token))?;
    let program = program.trim_matches(|c| c == '"' || c == '\'');
    program
        .starts_with("./")
        .then(|| program.to_string())
        .filter(|path| path.len() > 2)
}

/// Binary to build, or `None` when no build is needed. A requested rebuild
/// always yields `Some`, possibly without a known binary.
pub fn build_target(command: &str, dir: &Path, requested: bool) -> Option<Option<String>> {
    let binary = referenced_binary(command);
    let missing = binary
        .as_deref()
        .is_some_and(|binary| !dir.join(binary).exists());
    (requested || missing).then_some(binary)
}

/// Chooses the build invocation for `dir`. Go modules with a `cmd/<bin>`
/// layout build that package; everything else builds the module root.
pub fn plan_build(dir: &Path, binary: Option<&str>) -> Option<BuildPlan> {
    let name = binary
        .map(|binary| binary.trim_start_matches("./"))
        .filter(|name| !name.is_empty());
    if dir.join("Makefile").is_file() || dir.join("makefile").is_file() {
        return Some(BuildPlan {
            descriptor: BuildDescriptor::Makefile,
            command: "make".to_string(),
        });
    }
    if dir.join("go.mod").is_file() {
        let command = match name {
            Some(name) => {
                let file_name = Path::new(name)
                    .file_name()
                    .and_then(|file| file.to_str())
                    .unwrap_or(name);
                if dir.join("cmd").join(file_name).is_dir() {
                    format!("go build -o ./{name} ./cmd/{file_name}")
                } else {
                    format!("go build -o ./{name} .")
                }
            }
            None => "go build ./...".to_string(),
        };
        return Some(BuildPlan {
            descriptor: BuildDescriptor::GoModule,
            command,
        });
    }
    if dir.join("Cargo.toml").is_file() {
        let release = name.is_some_and(|name| name.contains("target/release"));
        return Some(BuildPlan {
            descriptor: BuildDescriptor::Cargo,
            command: if release {
                "cargo build --release".to_string()
            } else {
                "cargo build".to_string()
            },
        });
    }
    None
}
