//! Tracing subscriber setup.
//!
//! Log lines go to stderr so command output on stdout stays clean. Runs
//! without a terminal (services, cron) also append to a daily file under
//! [`log_dir`]. If that directory cannot be used, stderr alone is kept.

use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "TETHER_LOG";

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// stderr only
    Console,
    /// stderr plus a daily file in the given directory
    ConsoleAndFile(PathBuf),
}

/// Subscriber settings passed to [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Destinations for log lines
    pub output: LogOutput,
    /// Filter directives, e.g. `info,tether_core=debug`
    pub filter: Option<String>,
}

impl LogConfig {
    /// Console only when stderr is a terminal, console plus file otherwise.
    pub fn detect() -> Self {
        let output = if atty::is(atty::Stream::Stderr) {
            LogOutput::Console
        } else {
            LogOutput::ConsoleAndFile(log_dir())
        };
        Self { output, filter: None }
    }

    /// Use these filter directives ahead of the environment.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Override the detected output.
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::detect()
    }
}

/// Keeps the file writer alive; drop it last to flush buffered lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    file: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether lines are also written to a file.
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (tests, embedding applications) is left in
/// place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let filter = resolve_filter(config.filter.as_deref());

    let (file_layer, guard) = match &config.output {
        LogOutput::Console => (None, None),
        LogOutput::ConsoleAndFile(dir) => match file_writer(dir) {
            Ok((writer, guard)) => {
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("warning: file logging disabled ({}): {e}", dir.display());
                (None, None)
            }
        },
    };

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(file_layer.is_none());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    LoggingGuard { file: guard }
}

fn file_writer(dir: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tether")
        .filename_suffix("log")
        .build(dir)
        .map_err(io::Error::other)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// First usable of: explicit directives, `TETHER_LOG`, `RUST_LOG`, build default.
fn resolve_filter(explicit: Option<&str>) -> EnvFilter {
    explicit
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_env(LOG_ENV_VAR).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_log_filter()))
}

/// Filter used when neither explicit directives nor the environment give one.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,tether=trace,tether_core=trace,tokio_postgres=info,russh=info"
    } else {
        "info,tokio_postgres=warn,russh=warn"
    }
}

/// `./tether_data/logs` in debug builds, the platform data dir otherwise.
pub fn log_dir() -> PathBuf {
    let local = || PathBuf::from("./tether_data").join("logs");
    if cfg!(debug_assertions) {
        return local();
    }
    dirs::data_local_dir()
        .map(|d| d.join("tether").join("logs"))
        .unwrap_or_else(local)
}
