use devrun_core::SearchPaths;
use std::ffi::OsString;

/// Executables that satisfy a language tag; the first one found is enough.
fn candidates(language: &str) -> &'static [&'static str] {
    match language.trim().to_ascii_lowercase().as_str() {
        "javascript" | "typescript" | "node" | "nodejs" => &["node"],
        "python" | "python3" => &["python3", "python"],
        "go" | "golang" => &["go"],
        "rust" => &["cargo"],
        "ruby" => &["ruby"],
        "java" | "kotlin" | "scala" => &["java"],
        "php" => &["php"],
        "deno" => &["deno"],
        "bun" => &["bun"],
        "elixir" => &["elixir"],
        "dotnet" | "csharp" | "c#" => &["dotnet"],
        _ => &[],
    }
}

/// Names the missing runtime, or `None` when it is present or unknown.
pub fn missing_runtime(
    language: &str,
    search_paths: &SearchPaths,
    inherited_path: Option<&OsString>,
) -> Option<&'static str> {
    let candidates = candidates(language);
    let found = candidates
        .iter()
        .any(|program| search_paths.which(program, inherited_path).is_some());
    match (found, candidates.first()) {
        (false, Some(primary)) => Some(*primary),
        _ => None,
    }
}
