//! Launch configuration and Chromium executable discovery.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use which::which;

/// Environment variable supplying the default executable path.
pub const CHROME_PATH_ENV: &str = "PIPECDP_CHROME_PATH";

/// Executable names probed on `PATH` when nothing is configured.
const CHROME_EXECUTABLE_NAMES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome-stable",
    "google-chrome",
];

/// Defaults appended to every launch unless suppressed via
/// [`Config::ignore_default_args`].
const DEFAULT_ARGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-breakpad",
    "--disable-background-networking",
    "--disable-features=Translate",
    "--use-gl=angle",
    "--use-angle=swiftshader",
    "--disable-gpu",
];

/// Options recognized when launching Chromium in pipe mode.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the Chromium/Chrome executable.
    pub chrome_path: PathBuf,
    /// Profile directory. `None` allocates a fresh temp dir that is always
    /// removed on close.
    pub user_data_dir: Option<PathBuf>,
    /// Wipe a caller-provided `user_data_dir` before launch and on close.
    pub clean_data_dir: bool,
    /// Run with the new headless mode.
    pub headless: bool,
    /// Appended after the default flags, in order.
    pub extra_args: Vec<String>,
    /// Default flags to leave out, matched on the flag name (the part
    /// before any `=`).
    pub ignore_default_args: Vec<String>,
    /// Environment overlayed on the parent process environment.
    pub env: HashMap<String, String>,
    /// Deadline for the first page target to attach during start.
    pub startup_timeout: Duration,
    /// End-to-end deadline applied to each command round trip.
    pub command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chrome_path: default_chrome_path(),
            user_data_dir: None,
            clean_data_dir: true,
            headless: true,
            extra_args: Vec::new(),
            ignore_default_args: Vec::new(),
            env: HashMap::new(),
            startup_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Assemble the child argv. The profile directory must already be
    /// resolved by the caller (see `Browser::start`).
    pub(crate) fn build_argv(&self, user_data_dir: &std::path::Path) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        if self.headless && !self.extra_args.iter().any(|a| a.starts_with("--headless")) {
            argv.push("--headless=new".to_string());
        }
        argv.push("--remote-debugging-pipe".to_string());
        argv.push(format!("--user-data-dir={}", user_data_dir.display()));
        for flag in DEFAULT_ARGS {
            if !self.suppresses(flag) {
                argv.push((*flag).to_string());
            }
        }
        argv.extend(self.extra_args.iter().cloned());
        argv.push("about:blank".to_string());
        debug!(target: "pipecdp::config", args = argv.len(), "built chromium argv");
        argv
    }

    fn suppresses(&self, default_flag: &str) -> bool {
        let name = default_flag.split('=').next().unwrap_or(default_flag);
        self.ignore_default_args
            .iter()
            .any(|ignored| ignored.split('=').next().unwrap_or(ignored) == name)
    }
}

/// Resolve the default executable: explicit env var, then `PATH` probing,
/// then the bare name and whatever `execvp` makes of it.
pub fn default_chrome_path() -> PathBuf {
    if let Ok(raw) = env::var(CHROME_PATH_ENV) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    for name in CHROME_EXECUTABLE_NAMES {
        if let Ok(path) = which(name) {
            return path;
        }
    }
    PathBuf::from("chromium")
}
