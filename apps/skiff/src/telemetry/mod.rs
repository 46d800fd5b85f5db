fn env_truthy(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| {
        let value = value.trim();
        value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
    })
}

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
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
        /// Append to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        LogFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("another global subscriber is installed: {0}")]
        Install(#[from] TryInitError),
    }

    /// Held for the life of the process so buffered lines are flushed.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the process-wide subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }
        let (filter, throttled_deps) = build_env_filter(config.level.into());
        let (writer, guard) = open_writer(config)?;

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
        let _ = WRITER_GUARD.set(guard);

        if throttled_deps {
            tracing::debug!(
                target = "skiff::telemetry",
                "webrtc and websocket internals clamped to warn; set SKIFF_TRACE_DEPS=1 or SKIFF_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn open_writer(config: &LogConfig) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = &config.file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::LogFile {
                path: path.clone(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var("SKIFF_LOG_FILTER") {
            return (EnvFilter::new(filter), false);
        }
        let allow_deps = super::env_truthy("SKIFF_TRACE_DEPS").unwrap_or(false);
        let (filter, throttled) = default_filter_for(level, allow_deps);
        (EnvFilter::new(filter), throttled)
    }

    /// The ICE and SCTP stacks log every connectivity check and chunk at
    /// debug and below.
    const NOISY_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_mdns",
        "webrtc_data",
        "turn",
        "stun",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,skiff=trace",
            LevelFilter::DEBUG => "info,skiff=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level >= LevelFilter::INFO && !allow_deps {
            (throttle_dependency_logs(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    fn throttle_dependency_logs(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in NOISY_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=warn");
        }
        filter
    }

}
