//! Port detection and rewriting for free-form shell commands.
//!
//! Commands come straight from user configuration, so everything here is
//! conservative: a command that is not recognised is returned untouched.

use regex::Regex;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

pub const PORT_PROBE_ATTEMPTS: u16 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {port} is in use and no free port was found above it")]
    NoAvailablePort { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPattern {
    Flag,
    EnvAssignment,
    HostPort,
    Positional,
    KnownDefault,
}

impl PortPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortPattern::Flag => "flag",
            PortPattern::EnvAssignment => "env",
            PortPattern::HostPort => "host:port",
            PortPattern::Positional => "positional",
            PortPattern::KnownDefault => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortProbe {
    pub port: u16,
    pub found: bool,
    pub matched: String,
    pub pattern: Option<PortPattern>,
}

impl PortProbe {
    fn hit(port: u16, matched: &str, pattern: PortPattern) -> Self {
        Self {
            port,
            found: true,
            matched: matched.trim().to_string(),
            pattern: Some(pattern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortShift {
    pub command: String,
    pub port: Option<u16>,
    pub shifted: bool,
}

struct PortRegexes {
    flags: Vec<Regex>,
    env: Regex,
    host: Regex,
    positional: Regex,
}

/// Servers that take the port as a bare argument, possibly after options:
/// `http.server [--bind ADDR] PORT` and `runserver [opts] [ADDR:]PORT`.
const POSITIONAL_PREFIX: &str =
    r"\b(?:http\.server|runserver)(?:\s+--?[\w\-]+(?:[=\s]+[^\s\-]\S*)?)*\s+(?:[\w.\-]+:)?";

fn regexes() -> &'static PortRegexes {
    static REGEXES: OnceLock<PortRegexes> = OnceLock::new();
    REGEXES.get_or_init(|| PortRegexes {
        flags: vec![
            Regex::new(r"--port[=\s]+(\d{1,5})\b").expect("valid regex"),
            Regex::new(r"(?:^|\s)-p[=\s]?(\d{1,5})\b").expect("valid regex"),
            Regex::new(r"-D[\w.\-]*port=(\d{1,5})\b").expect("valid regex"),
            Regex::new(r"--[\w.\-]*port=(\d{1,5})\b").expect("valid regex"),
        ],
        env: Regex::new(r"\b[A-Z_]*PORT=(\d{1,5})\b").expect("valid regex"),
        host: Regex::new(r"(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{1,5})\b").expect("valid regex"),
        positional: Regex::new(&format!(r"{POSITIONAL_PREFIX}(\d{{1,5}})\b")).expect("valid regex"),
    })
}

/// Invocation fragments whose server listens on a well-known port when no
/// port is given explicitly. Checked in order; matched on whole words.
const KNOWN_DEFAULTS: &[(&str, u16)] = &[
    ("manage.py runserver", 8000),
    ("flask run", 5000),
    ("uvicorn", 8000),
    ("http.server", 8000),
    ("streamlit run", 8501),
    ("php artisan serve", 8000),
    ("ng serve", 4200),
    ("vite", 5173),
    ("next dev", 3000),
    ("next start", 3000),
    ("nuxt dev", 3000),
    ("react-scripts start", 3000),
    ("npm start", 3000),
    ("yarn start", 3000),
    ("pnpm start", 3000),
    ("bun start", 3000),
    ("rails server", 3000),
    ("rails s", 3000),
    ("gatsby develop", 8000),
    ("hugo server", 1313),
    ("jekyll serve", 4000),
];

fn capture_port(re: &Regex, command: &str) -> Option<(u16, String)> {
    re.captures_iter(command).find_map(|caps| {
        let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
        if port == 0 {
            return None;
        }
        Some((port, caps.get(0)?.as_str().to_string()))
    })
}

fn contains_words(command: &str, phrase: &str) -> bool {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let wanted: Vec<&str> = phrase.split_whitespace().collect();
    if wanted.is_empty() || tokens.len() < wanted.len() {
        return false;
    }
    tokens.windows(wanted.len()).any(|window| {
        window
            .iter()
            .zip(&wanted)
            .all(|(token, want)| token.trim_matches(|c| c == '"' || c == '\'') == *want)
    })
}

/// Finds the port a command will bind, trying explicit flags, env
/// assignments, `host:port` literals, bare positional ports, then the
/// known-default table.
pub fn extract_port(command: &str) -> PortProbe {
    let re = regexes();
    for flag in &re.flags {
        if let Some((port, matched)) = capture_port(flag, command) {
            return PortProbe::hit(port, &matched, PortPattern::Flag);
        }
    }
    if let Some((port, matched)) = capture_port(&re.env, command) {
        return PortProbe::hit(port, &matched, PortPattern::EnvAssignment);
    }
    if let Some((port, matched)) = capture_port(&re.host, command) {
        return PortProbe::hit(port, &matched, PortPattern::HostPort);
    }
    if let Some((port, matched)) = capture_port(&re.positional, command) {
        return PortProbe::hit(port, &matched, PortPattern::Positional);
    }
    for (phrase, port) in KNOWN_DEFAULTS {
        if contains_words(command, phrase) {
            return PortProbe::hit(*port, phrase, PortPattern::KnownDefault);
        }
    }
    PortProbe::default()
}

/// Every port written out literally in the command, in any recognised syntax.
fn explicit_ports(command: &str) -> Vec<u16> {
    let re = regexes();
    re.flags
        .iter()
        .chain([&re.env, &re.host, &re.positional])
        .flat_map(|pattern| {
            pattern
                .captures_iter(command)
                .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Binds and immediately releases the port on loopback and on the wildcard
/// address. Either bind failing means something else owns it.
pub fn is_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED]
        .into_iter()
        .all(|addr| TcpListener::bind((addr, port)).is_ok())
}

/// Linear probe upward from `from`. Returns 0 when nothing in range is free.
pub fn find_available(from: u16) -> u16 {
    let start = from.max(1);
    for offset in 0..PORT_PROBE_ATTEMPTS {
        let Some(candidate) = start.checked_add(offset) else {
            break;
        };
        if is_available(candidate) {
            return candidate;
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolFamily {
    JavaScript,
    Django,
    PythonStaticServer,
    Python,
    Jvm,
    Unknown,
}

const JS_TOOLS: &[&str] = &[
    "npm", "npx", "yarn", "pnpm", "bun", "bunx", "node", "vite", "next", "nuxt", "ng",
    "react-scripts", "astro", "remix", "webpack", "webpack-dev-server", "parcel",
];
const PYTHON_TOOLS: &[&str] = &["python", "python3", "uvicorn", "flask", "streamlit", "fastapi"];

fn leading_program(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|token| !is_env_assignment(token))
        .map(|token| token.rsplit('/').next().unwrap_or(token))
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with('-')
        }
        None => false,
    }
}

fn tool_family(command: &str) -> ToolFamily {
    let Some(program) = leading_program(command) else {
        return ToolFamily::Unknown;
    };
    if contains_words(command, "manage.py runserver") {
        return ToolFamily::Django;
    }
    if JS_TOOLS.contains(&program) {
        return ToolFamily::JavaScript;
    }
    if PYTHON_TOOLS.contains(&program) {
        if contains_words(command, "http.server") {
            return ToolFamily::PythonStaticServer;
        }
        return ToolFamily::Python;
    }
    if program == "java" && command.split_whitespace().any(|token| token == "-jar") {
        return ToolFamily::Jvm;
    }
    ToolFamily::Unknown
}

fn append_port_override(command: &str, new_port: u16) -> String {
    if explicit_ports(command).contains(&new_port) {
        return command.to_string();
    }
    match tool_family(command) {
        ToolFamily::JavaScript => format!("PORT={new_port} {command}"),
        ToolFamily::Django => format!("{} 127.0.0.1:{new_port}", command.trim_end()),
        ToolFamily::PythonStaticServer => format!("{} {new_port}", command.trim_end()),
        ToolFamily::Python => format!("{} --port {new_port}", command.trim_end()),
        ToolFamily::Jvm => {
            let mut out: Vec<String> = Vec::new();
            let mut injected = false;
            for token in command.split_whitespace() {
                if token == "-jar" && !injected {
                    out.push(format!("-Dserver.port={new_port}"));
                    injected = true;
                }
                out.push(token.to_string());
            }
            out.join(" ")
        }
        ToolFamily::Unknown => command.to_string(),
    }
}

/// Rewrites `command` so the process binds `new_port` instead of `old_port`.
///
/// Literal occurrences are substituted in place. When the old port only came
/// from a known default, the idiomatic override for the tool family is added.
/// Commands from unknown families are returned unchanged.
pub fn shift_command(command: &str, old_port: u16, new_port: u16) -> String {
    if old_port == new_port {
        return command.to_string();
    }
    let positional_template = format!("({POSITIONAL_PREFIX})");
    let templates = [
        r"(--port[=\s]+)",
        r"((?:^|\s)-p[=\s]?)",
        r"(-D[\w.\-]*port=)",
        r"(--[\w.\-]*port=)",
        r"(\b[A-Z_]*PORT=)",
        r"((?:localhost|127\.0\.0\.1|0\.0\.0\.0):)",
        positional_template.as_str(),
    ];
    let mut rewritten = command.to_string();
    for prefix in templates {
        let Ok(pattern) = Regex::new(&format!(r"{prefix}{old_port}\b")) else {
            continue;
        };
        let replacement = format!("${{1}}{new_port}");
        rewritten = pattern
            .replace_all(&rewritten, replacement.as_str())
            .into_owned();
    }
    if rewritten != command {
        return rewritten;
    }
    append_port_override(command, new_port)
}

/// Applies an explicit port choice whether or not the command names a port.
pub fn apply_port_override(command: &str, port: u16) -> String {
    let probe = extract_port(command);
    if probe.found && probe.pattern != Some(PortPattern::KnownDefault) {
        return shift_command(command, probe.port, port);
    }
    append_port_override(command, port)
}

/// Moves the command to the next free port if its detected port is taken.
pub fn check_and_shift(command: &str) -> Result<PortShift, PortError> {
    let probe = extract_port(command);
    if !probe.found {
        return Ok(PortShift {
            command: command.to_string(),
            port: None,
            shifted: false,
        });
    }
    if is_available(probe.port) {
        return Ok(PortShift {
            command: command.to_string(),
            port: Some(probe.port),
            shifted: false,
        });
    }
    let next = find_available(probe.port);
    if next == 0 {
        return Err(PortError::NoAvailablePort { port: probe.port });
    }
    debug!(
        "port_shift: {} -> {next} via {}",
        probe.port,
        probe.pattern.map(|p| p.as_str()).unwrap_or("none")
    );
    Ok(PortShift {
        command: shift_command(command, probe.port, next),
        port: Some(next),
        shifted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind ephemeral");
        let port = listener.local_addr().expect("local addr").port();
        (listener, port)
    }

    #[test]
    fn extract_prefers_explicit_flags() {
        let probe = extract_port("PORT=4000 npm start -- --port 3005");
        assert!(probe.found);
        assert_eq!(probe.port, 3005);
        assert_eq!(probe.pattern, Some(PortPattern::Flag));
        assert_eq!(probe.matched, "--port 3005");

        let probe = extract_port("java -Dserver.port=9090 -jar app.jar");
        assert_eq!(probe.port, 9090);
        assert_eq!(probe.pattern, Some(PortPattern::Flag));

        let probe = extract_port("hugo server -p 1414");
        assert_eq!(probe.port, 1414);
    }

    #[test]
    fn extract_falls_through_env_host_and_defaults() {
        let probe = extract_port("VITE_PORT=5200 pnpm dev");
        assert_eq!((probe.port, probe.pattern), (5200, Some(PortPattern::EnvAssignment)));

        let probe = extract_port("php -S 0.0.0.0:8081 -t public");
        assert_eq!((probe.port, probe.pattern), (8081, Some(PortPattern::HostPort)));

        let probe = extract_port("python manage.py runserver");
        assert_eq!((probe.port, probe.pattern), (8000, Some(PortPattern::KnownDefault)));

        let probe = extract_port("npm start");
        assert_eq!(probe.port, 3000);
    }

    #[test]
    fn extract_reads_bare_positional_ports() {
        let probe = extract_port("python3 -m http.server 9000");
        assert_eq!((probe.port, probe.pattern), (9000, Some(PortPattern::Positional)));

        let probe = extract_port("python -m http.server --bind 127.0.0.1 8123");
        assert_eq!(probe.port, 8123);

        let probe = extract_port("python manage.py runserver 8001");
        assert_eq!((probe.port, probe.pattern), (8001, Some(PortPattern::Positional)));

        let probe = extract_port("./manage.py runserver --noreload devbox:8002");
        assert_eq!((probe.port, probe.pattern), (8002, Some(PortPattern::Positional)));

        let probe = extract_port("python manage.py runserver 0.0.0.0:8003");
        assert_eq!((probe.port, probe.pattern), (8003, Some(PortPattern::HostPort)));
    }

    #[test]
    fn extract_reports_no_match() {
        let probe = extract_port("cargo run --release");
        assert!(!probe.found);
        assert_eq!(probe.pattern, None);
        assert!(!extract_port("echo invite friends").found);
        assert!(!extract_port("mkdir -p build").found);
    }

    /// A bound port whose successor is free at the moment of return.
    fn bound_port_with_free_successor() -> (TcpListener, u16) {
        for _ in 0..50 {
            let (listener, port) = bound_port();
            if port < u16::MAX && is_available(port + 1) {
                return (listener, port);
            }
        }
        panic!("no ephemeral port with a free successor");
    }

    #[test]
    fn find_available_skips_bound_port() {
        let (_listener, port) = bound_port_with_free_successor();
        assert!(!is_available(port));
        assert_eq!(find_available(port), port + 1);
    }

    #[test]
    fn find_available_returns_free_start_unchanged() {
        let (listener, port) = bound_port();
        drop(listener);
        assert_eq!(find_available(port), port);
    }

    #[test]
    fn shift_rewrites_literal_ports_in_place() {
        assert_eq!(
            shift_command("vite --port 5173 --host", 5173, 5174),
            "vite --port 5174 --host"
        );
        assert_eq!(
            shift_command("PORT=3000 node server.js", 3000, 3001),
            "PORT=3001 node server.js"
        );
        assert_eq!(
            shift_command("php -S localhost:8000", 8000, 8002),
            "php -S localhost:8002"
        );
        assert_eq!(
            shift_command("serve --port=30001", 3000, 3001),
            "serve --port=30001",
        );
    }

    #[test]
    fn shift_rewrites_positional_ports_in_place() {
        assert_eq!(
            shift_command("python3 -m http.server 8000", 8000, 8001),
            "python3 -m http.server 8001"
        );
        assert_eq!(
            shift_command("python3 -m http.server 9000", 9000, 9001),
            "python3 -m http.server 9001"
        );
        assert_eq!(
            shift_command("python -m http.server --bind 127.0.0.1 8000", 8000, 8005),
            "python -m http.server --bind 127.0.0.1 8005"
        );
        assert_eq!(
            shift_command("python manage.py runserver 8000", 8000, 8001),
            "python manage.py runserver 8001"
        );
        assert_eq!(
            shift_command("python manage.py runserver devbox:8000", 8000, 8001),
            "python manage.py runserver devbox:8001"
        );
        assert_eq!(
            apply_port_override("python3 -m http.server 9000", 4100),
            "python3 -m http.server 4100"
        );
    }

    #[test]
    fn shift_falls_back_to_family_overrides() {
        assert_eq!(shift_command("npm start", 3000, 3001), "PORT=3001 npm start");
        assert_eq!(
            shift_command("python manage.py runserver", 8000, 8001),
            "python manage.py runserver 127.0.0.1:8001"
        );
        assert_eq!(
            shift_command("uvicorn main:app --reload", 8000, 8001),
            "uvicorn main:app --reload --port 8001"
        );
        assert_eq!(
            shift_command("python3 -m http.server", 8000, 8001),
            "python3 -m http.server 8001"
        );
        assert_eq!(
            shift_command("java -Xmx1g -jar build/app.jar", 8080, 8081),
            "java -Xmx1g -Dserver.port=8081 -jar build/app.jar"
        );
        assert_eq!(shift_command("./bin/server", 8080, 8081), "./bin/server");
    }

    #[test]
    fn shift_is_idempotent() {
        let cases = [
            ("vite --port 5173", 5173, 5174),
            ("npm start", 3000, 3001),
            ("python manage.py runserver", 8000, 8001),
            ("flask run", 5000, 5001),
            ("java -jar app.jar", 8080, 8081),
            ("PORT=4000 node index.js", 4000, 4001),
            ("curl http://127.0.0.1:9000/health", 9000, 9001),
            ("./bin/server", 8080, 8081),
            ("python3 -m http.server 8000", 8000, 8001),
            ("python3 -m http.server 9000", 9000, 9001),
            ("python manage.py runserver 8000", 8000, 8001),
            ("python manage.py runserver devbox:8000", 8000, 8001),
        ];
        for (command, old, new) in cases {
            let once = shift_command(command, old, new);
            let twice = shift_command(&once, old, new);
            assert_eq!(once, twice, "not idempotent for {command}");
        }
    }

    #[test]
    fn override_applies_without_detected_port() {
        assert_eq!(apply_port_override("npm run dev", 4100), "PORT=4100 npm run dev");
        assert_eq!(
            apply_port_override("vite --port 5173", 4100),
            "vite --port 4100"
        );
        assert_eq!(apply_port_override("./bin/api", 4100), "./bin/api");
    }

    #[test]
    fn check_and_shift_leaves_free_ports_alone() {
        let command = "echo no port here";
        let outcome = check_and_shift(command).expect("no-op");
        assert_eq!(outcome.command, command);
        assert_eq!(outcome.port, None);
        assert!(!outcome.shifted);
    }

    #[test]
    fn check_and_shift_moves_busy_port() {
        let (_listener, port) = bound_port();
        let command = format!("vite --port {port}");
        let outcome = check_and_shift(&command).expect("shift");
        assert!(outcome.shifted);
        let new_port = outcome.port.expect("new port");
        assert!(new_port > port);
        assert_eq!(outcome.command, format!("vite --port {new_port}"));
    }
}
