//! Process-wide tracing setup for the vm-api service.
//!
//! Configured from the environment:
//! `RUST_LOG` (falls back to `LOG_LEVEL`, default `info`),
//! `LOG_FORMAT` (`human` | `json`), `LOG_OUTPUT` (`console` | `file` | `both`)
//! and `LOG_FILE_PATH` for daily-rolled file output.

use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, writer::MakeWriterExt, MakeWriter},
    prelude::*,
    registry::LookupSpan,
    EnvFilter, Layer,
};

/// Crates that are noisy at `debug`
const QUIET_TARGETS: &[&str] = &[
    "hyper=warn",
    "tokio=warn",
    "sqlx=warn",
    "russh=warn",
    "aws_config=warn",
    "aws_smithy_runtime=warn",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, Self::Console | Self::Both)
    }

    fn file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from("/tmp/vm-api.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_values(
            env::var("LOG_LEVEL").ok().as_deref(),
            env::var("LOG_FORMAT").ok().as_deref(),
            env::var("LOG_OUTPUT").ok().as_deref(),
            env::var("LOG_FILE_PATH").ok().as_deref(),
        )
    }

    /// Unknown values fall back to the defaults
    pub fn from_values(
        level: Option<&str>,
        format: Option<&str>,
        output: Option<&str>,
        file_path: Option<&str>,
    ) -> Self {
        let defaults = Self::default();

        let format = match format.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let output = match output.map(|o| o.trim().to_ascii_lowercase()).as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };

        Self {
            level: level
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or(defaults.level),
            format,
            output,
            file_path: file_path
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in QUIET_TARGETS {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Initializes the global tracing subscriber based on environment variables.
///
/// The returned guard flushes file output on drop; hold it for the lifetime
/// of the process.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = tracing_subscriber::registry().with(settings.env_filter());

    if !settings.output.file() {
        subscriber
            .with(fmt_layer(settings.format, std::io::stdout))
            .init();
        return None;
    }

    let log_dir = settings
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = settings
        .file_path
        .file_name()
        .unwrap_or_else(|| "vm-api.log".as_ref());
    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, file_name));

    if settings.output.console() {
        subscriber
            .with(fmt_layer(settings.format, std::io::stdout.and(non_blocking)))
            .init();
    } else {
        subscriber
            .with(fmt_layer(settings.format, non_blocking))
            .init();
    }

    Some(guard)
}

fn fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Human => layer.boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(
            LogSettings::from_values(None, None, None, None),
            LogSettings::default()
        );
    }

    #[test]
    fn test_parses_values() {
        let settings = LogSettings::from_values(
            Some("debug"),
            Some("JSON"),
            Some("both"),
            Some("/var/log/vm-api/api.log"),
        );
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Both);
        assert!(settings.output.console() && settings.output.file());
        assert_eq!(settings.file_path, PathBuf::from("/var/log/vm-api/api.log"));
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let settings = LogSettings::from_values(Some(" "), Some("xml"), Some("syslog"), Some(""));
        assert_eq!(settings, LogSettings::default());
    }
}
