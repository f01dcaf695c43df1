//! Client tunables.
//!
//! Defaults reproduce the behaviour of a console client: roughly one second
//! of silence ends a blocking execution, polled every 10ms. Each value can be
//! overridden from the environment:
//!
//! - `JKC_MAX_WAIT_MS` - idle wait bound for blocking execution
//! - `JKC_POLL_INTERVAL_MS` - sleep between empty polls
//! - `JKC_HARD_DEADLINE_MS` - absolute cap on one blocking execution
//! - `JKC_CONNECT_TIMEOUT_MS` - bound on opening each channel
//! - `JKC_USERNAME` - username stamped into message headers
//! - `JKC_VERIFY_SIGNATURES` - recompute and check inbound HMACs
//! - `JKC_IPYTHON` - program used to launch kernels
//! - `JKC_CONNECTION_FILE` - connection file used when none is given

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_IDLE_WAIT_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_HARD_DEADLINE_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_USERNAME: &str = "jupyter-kernel-client";
const DEFAULT_KERNEL_PROGRAM: &str = "ipython";
const DEFAULT_STARTUP_DELAY_SECS: u64 = 2;
const DEFAULT_CONNECTION_FILE: &str = "kernel.json";
const RUNTIME_SUBDIR: &str = "jupyter-kernel-client";

/// Settings for [`KernelClient`](crate::kernel::KernelClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a blocking execution waits without hearing anything for it.
    pub max_idle_wait: Duration,
    /// Sleep granularity of the blocking wait loop.
    pub poll_interval: Duration,
    /// Upper bound on a blocking execution even while output keeps arriving.
    pub hard_deadline: Duration,
    /// How long one channel may take to connect before it counts as failed.
    pub connect_timeout: Duration,
    /// `username` field of outbound headers.
    pub username: String,
    /// Discard inbound messages whose signature does not verify.
    pub verify_signatures: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_wait: Duration::from_millis(DEFAULT_MAX_IDLE_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            hard_deadline: Duration::from_secs(DEFAULT_HARD_DEADLINE_SECS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            username: DEFAULT_USERNAME.to_string(),
            verify_signatures: false,
        }
    }
}

impl ClientConfig {
    /// Defaults with any `JKC_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_millis(&lookup, "JKC_MAX_WAIT_MS") {
            config.max_idle_wait = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "JKC_POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "JKC_HARD_DEADLINE_MS") {
            config.hard_deadline = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "JKC_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = ms;
        }
        if let Some(name) = lookup("JKC_USERNAME").filter(|s| !s.trim().is_empty()) {
            config.username = name;
        }
        if let Some(raw) = lookup("JKC_VERIFY_SIGNATURES") {
            match parse_flag(&raw) {
                Some(flag) => config.verify_signatures = flag,
                None => tracing::warn!("Ignoring invalid JKC_VERIFY_SIGNATURES={}", raw),
            }
        }

        config
    }

    /// Number of consecutive empty polls that ends a blocking execution.
    pub fn idle_poll_limit(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = (self.max_idle_wait.as_millis() / interval).max(1);
        u32::try_from(polls).unwrap_or(u32::MAX)
    }
}

/// Settings for [`KernelLauncher`](crate::launcher::KernelLauncher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    /// Executable providing a `kernel` subcommand.
    pub program: String,
    /// Grace period before checking that the kernel survived startup.
    pub startup_delay: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_KERNEL_PROGRAM.to_string(),
            startup_delay: Duration::from_secs(DEFAULT_STARTUP_DELAY_SECS),
        }
    }
}

impl LauncherConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var("JKC_IPYTHON") {
            if !program.trim().is_empty() {
                tracing::info!("Using kernel program from JKC_IPYTHON: {}", program);
                config.program = program;
            }
        }
        config
    }
}

/// Directory for PID files, kernel logs and the default connection file.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/jupyter-kernel-client` (Linux standard, per-user)
/// 2. `<cache dir>/jupyter-kernel-client`
/// 3. `<temp dir>/jupyter-kernel-client`
pub fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(RUNTIME_SUBDIR);
    }
    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(RUNTIME_SUBDIR);
    }
    std::env::temp_dir().join(RUNTIME_SUBDIR)
}

/// Pick the connection file to use.
///
/// An explicit path wins, then `JKC_CONNECTION_FILE`, then `kernel.json` in
/// [`runtime_dir`]. A leading `~` is expanded to the home directory.
pub fn resolve_connection_file(explicit: Option<&str>) -> PathBuf {
    resolve_connection_file_with(explicit, |name| std::env::var(name).ok())
}

pub fn resolve_connection_file_with<F>(explicit: Option<&str>, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let chosen = explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| lookup("JKC_CONNECTION_FILE").filter(|s| !s.trim().is_empty()));

    match chosen {
        Some(path) => expand_home(&path),
        None => runtime_dir().join(DEFAULT_CONNECTION_FILE),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn parse_millis<F>(lookup: &F, name: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            tracing::warn!("Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
