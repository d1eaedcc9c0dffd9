use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

/// Host loop and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Async worker threads for the runtime that owns the blocking pool.
    pub worker_threads: usize,
    /// Upper bound on concurrent background steps.
    pub max_blocking_threads: usize,
    pub thread_name: String,
    /// Sleep between driver ticks.
    pub tick_interval_ms: u64,
    /// Give up and cancel everything after this many ticks. `None` means never.
    pub max_ticks: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            max_blocking_threads: 4,
            thread_name: "taskhop-worker".to_string(),
            tick_interval_ms: 16,
            max_ticks: None,
        }
    }
}

impl SchedulerConfig {
    /// Load from the first config file found, or fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_path() {
            Some(path) => Self::from_path(&path),
            None => {
                tracing::debug!("no taskhop.json found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: SchedulerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded scheduler config");
        cfg.expanded().validate()
    }

    fn expanded(mut self) -> Self {
        self.thread_name = expand_env_vars(&self.thread_name);
        self
    }

    fn validate(self) -> anyhow::Result<Self> {
        if self.max_blocking_threads == 0 {
            anyhow::bail!("max_blocking_threads must be at least 1");
        }
        if self.worker_threads == 0 {
            anyhow::bail!("worker_threads must be at least 1");
        }
        Ok(self)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Build the runtime whose blocking pool runs background steps.
    pub fn build_runtime(&self) -> anyhow::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .max_blocking_threads(self.max_blocking_threads)
            .thread_name(self.thread_name.clone())
            .enable_all()
            .build()
            .context("building worker runtime")
    }
}

/// `TASKHOP_CONFIG`, then `$XDG_CONFIG_HOME/taskhop/taskhop.json`, then `./taskhop.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("TASKHOP_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("taskhop").join("taskhop.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("taskhop.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Replace `${NAME}` with the variable's value. Unknown names are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
