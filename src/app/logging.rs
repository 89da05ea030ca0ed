//! tracing subscriber setup: stderr always, plus an optional log file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const FALLBACK_LEVEL: &str = "warn";

/// Where the filter directive comes from, highest precedence first.
#[derive(Debug, Default, Clone)]
pub struct LogOptions {
    /// `RUST_LOG`
    pub env: Option<String>,
    /// `--log-level`
    pub level: Option<String>,
    /// `--debug`
    pub debug: bool,
    /// `log.level` from the config file
    pub config_level: Option<String>,
    /// `--debug-log`, else `log.file`
    pub file: Option<String>,
}

impl LogOptions {
    pub fn directive(&self) -> String {
        let non_empty = |s: &Option<String>| s.as_deref().filter(|v| !v.trim().is_empty()).map(str::to_string);
        non_empty(&self.env)
            .or_else(|| non_empty(&self.level))
            .or_else(|| self.debug.then(|| "info".to_string()))
            .or_else(|| non_empty(&self.config_level))
            .unwrap_or_else(|| FALLBACK_LEVEL.to_string())
    }
}

/// A path ending in `/` names a directory; the file inside it is
/// `nsgate.<unix-timestamp>.log`.
pub fn log_file_path(path: &str, unix_secs: u64) -> PathBuf {
    if path.ends_with('/') {
        Path::new(path).join(format!("nsgate.{}.log", unix_secs))
    } else {
        PathBuf::from(path)
    }
}

fn open_log_file(path: &str) -> Result<(File, PathBuf)> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let path = log_file_path(path, now);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file '{}'", path.display()))?;
    Ok((file, path))
}

/// Install the global subscriber. Returns the log file path if one was opened.
pub fn init(options: &LogOptions) -> Result<Option<PathBuf>> {
    let directive = options.directive();
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter '{}'", directive))?;

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, path) = match &options.file {
        Some(p) => {
            let (file, path) = open_log_file(p)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {}", e))?;
    Ok(path)
}
