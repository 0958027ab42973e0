use crate::error::{AppError, Result};
use crate::kasa;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Checkpoint entries older than this are ignored at startup.
    #[serde(default = "default_checkpoint_max_age_secs")]
    pub checkpoint_max_age_secs: u64,
    /// Power at or above which a device counts as running.
    #[serde(default = "default_threshold_watts")]
    pub threshold_watts: f64,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
    /// Write one last checkpoint when shutting down.
    #[serde(default)]
    pub checkpoint_on_shutdown: bool,
    /// Upper bound for a single device query; unbounded when absent.
    #[serde(default)]
    pub query_timeout_secs: Option<u64>,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_checkpoint_max_age_secs() -> u64 {
    3600
}

fn default_threshold_watts() -> f64 {
    5.0
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            checkpoint_interval_secs: default_interval_secs(),
            checkpoint_max_age_secs: default_checkpoint_max_age_secs(),
            threshold_watts: default_threshold_watts(),
            targets: Vec::new(),
            checkpoint_file: None,
            checkpoint_on_shutdown: false,
            query_timeout_secs: None,
        }
    }
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

fn default_listen_address() -> String {
    "localhost:8080".into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Port used for targets given without one.
    #[serde(default = "default_device_port")]
    pub default_port: u16,
}

fn default_device_port() -> u16 {
    kasa::DEFAULT_PORT
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_port: default_device_port(),
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards PLUG_TARGETS and CHECKPOINT_FILE override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(targets) = std::env::var("PLUG_TARGETS") {
            self.collector.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(path) = std::env::var("CHECKPOINT_FILE") {
            self.collector.checkpoint_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.collector;
        if c.targets.is_empty() {
            return Err(AppError::Config(
                "at least one target must be configured".to_string(),
            ));
        }
        if c.interval_secs == 0 {
            return Err(AppError::Config("interval_secs cannot be 0".to_string()));
        }
        if c.checkpoint_interval_secs == 0 {
            return Err(AppError::Config(
                "checkpoint_interval_secs cannot be 0".to_string(),
            ));
        }
        if c.query_timeout_secs == Some(0) {
            return Err(AppError::Config(
                "query_timeout_secs cannot be 0".to_string(),
            ));
        }
        if !c.threshold_watts.is_finite() || c.threshold_watts < 0.0 {
            return Err(AppError::Config(format!(
                "threshold_watts must be a non-negative number, got {}",
                c.threshold_watts
            )));
        }
        if self.http.listen_address.trim().is_empty() {
            return Err(AppError::Config(
                "http.listen_address cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
