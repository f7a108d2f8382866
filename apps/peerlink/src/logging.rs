//! Process-wide `tracing` setup for the `peerlink` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Crates whose debug output drowns ours unless asked for.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_mdns",
    "tungstenite",
    "tokio_tungstenite",
    "reqwest",
    "hyper",
    "rustls",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogSettings {
    pub verbosity: Verbosity,
    /// Appends to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Raw `EnvFilter` directives that replace the computed ones.
    pub filter: Option<String>,
    /// Lets dependency crates log at the chosen verbosity too.
    pub dependency_traces: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("cannot open log file {path:?}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("logging already initialised: {0}")]
    Install(String),
}

impl LogSettings {
    /// Fills the override knobs from `PEERLINK_LOG_FILTER` and
    /// `PEERLINK_TRACE_DEPS`.
    pub fn with_env(mut self) -> Self {
        if let Ok(filter) = std::env::var("PEERLINK_LOG_FILTER") {
            if !filter.trim().is_empty() {
                self.filter = Some(filter);
            }
        }
        if let Ok(flag) = std::env::var("PEERLINK_TRACE_DEPS") {
            self.dependency_traces = !flag.is_empty() && flag != "0";
        }
        self
    }

    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = self.verbosity.directive();
        if self.verbosity < Verbosity::Debug {
            return level.to_string();
        }
        let mut directives = format!("info,peerlink={level},peerlink_core={level}");
        let dependency_level = if self.dependency_traces { level } else { "info" };
        for target in NOISY_DEPENDENCIES {
            directives.push_str(&format!(",{target}={dependency_level}"));
        }
        directives
    }
}

/// Installs the global subscriber. Keep the returned guard alive for as
/// long as log lines should reach the writer.
pub fn init(settings: &LogSettings) -> Result<WorkerGuard, LogError> {
    let filter = EnvFilter::try_new(settings.directives())
        .map_err(|err| LogError::Filter(err.to_string()))?;
    let (writer, guard) = match &settings.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogError::File {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let verbose = settings.verbosity >= Verbosity::Debug;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_names(settings.verbosity == Verbosity::Trace)
        .with_ansi(settings.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| LogError::Install(err.to_string()))?;
    Ok(guard)
}
