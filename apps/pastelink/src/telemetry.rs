use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Logs go to stderr unless a file is
/// configured; stdout is reserved for codes and credentials.
/// `PASTELINK_LOG_FILTER` replaces the level-derived filter. Later calls are
/// no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    match std::env::var("PASTELINK_LOG_FILTER") {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new(default_filter_for(level)),
    }
}

/// Our own targets follow the requested level; the webrtc stack stays at
/// `warn` unless tracing is requested.
fn default_filter_for(level: LogLevel) -> String {
    let deps = match level {
        LogLevel::Trace => "info",
        _ => "warn",
    };
    let level = level.as_str();
    format!(
        "{level},pastelink={level},pastelink_core={level},\
         webrtc={deps},webrtc_ice={deps},webrtc_sctp={deps}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_stay_quiet_below_trace() {
        let filter = default_filter_for(LogLevel::Debug);
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("webrtc=warn"));
        assert!(default_filter_for(LogLevel::Trace).contains("webrtc_ice=info"));
    }

    #[test]
    fn levels_are_ordered_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
        assert_eq!(LogLevel::Info.to_filter(), LevelFilter::INFO);
    }
}
