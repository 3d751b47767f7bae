//! `tracing` setup for the two binaries.
//!
//! The client shares its terminal with the user, so its lines are compact,
//! untimed and carry no target. The relay logs full lines with request spans
//! from its `TraceLayer`. Either can be sent to a file instead of stderr.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{self, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Replaces the computed directives wholesale when set.
pub const LOG_FILTER_ENV: &str = "JAM_LOG_FILTER";

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
}

/// Which binary is logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Relay,
}

impl Role {
    /// Targets that follow the requested level.
    fn own_targets(self) -> &'static [&'static str] {
        match self {
            Role::Client => &["jam", "jam_link"],
            Role::Relay => &["jam_road", "jam_link", "tower_http"],
        }
    }

    /// Dependencies held at `warn` whenever the level is `info` or louder.
    /// webrtc-rs logs every STUN binding and SCTP chunk.
    fn chatty_dependencies(self) -> &'static [&'static str] {
        match self {
            Role::Client => &[
                "webrtc",
                "webrtc_ice",
                "webrtc_dtls",
                "webrtc_sctp",
                "webrtc_mdns",
                "reqwest",
                "hyper",
            ],
            Role::Relay => &["hyper", "h2"],
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub role: Role,
    pub level: LogLevel,
    /// Appends to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("log file path {0:?} does not name a file")]
    NotAFile(PathBuf),
    #[error("failed to open log file: {0}")]
    Open(#[from] rolling::InitError),
    #[error("another tracing subscriber is already installed")]
    SubscriberTaken,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calling again after a successful install
/// does nothing.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let (writer, guard) = match &config.file {
        Some(path) => tracing_appender::non_blocking(file_appender(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let filter = env_filter(config.role, config.level);
    let ansi = config.file.is_none();

    match config.role {
        Role::Client => install(client_format(filter, writer, ansi))?,
        Role::Relay => install(relay_format(filter, writer, ansi))?,
    }
    let _ = GUARD.set(guard);
    Ok(())
}

fn client_format(filter: EnvFilter, writer: NonBlocking, ansi: bool) -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_target(false)
        .with_ansi(ansi)
        .with_env_filter(filter)
        .with_writer(writer)
        .finish()
}

fn relay_format(filter: EnvFilter, writer: NonBlocking, ansi: bool) -> impl Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_ansi(ansi)
        .with_env_filter(filter)
        .with_writer(writer)
        .finish()
}

fn install(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<(), TelemetryError> {
    tracing::subscriber::set_global_default(subscriber).map_err(|_| TelemetryError::SubscriberTaken)
}

/// An append-only file that is never rotated.
fn file_appender(path: &Path) -> Result<RollingFileAppender, TelemetryError> {
    let name = path
        .file_name()
        .ok_or_else(|| TelemetryError::NotAFile(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)?)
}

fn env_filter(role: Role, level: LogLevel) -> EnvFilter {
    match std::env::var(LOG_FILTER_ENV) {
        Ok(custom) if !custom.trim().is_empty() => EnvFilter::new(custom),
        _ => EnvFilter::new(directives(role, level)),
    }
}

fn directives(role: Role, level: LogLevel) -> String {
    let mut parts = vec![level.min(LogLevel::Info).as_str().to_owned()];
    parts.extend(
        role.own_targets()
            .iter()
            .map(|target| format!("{target}={}", level.as_str())),
    );
    if level >= LogLevel::Info {
        parts.extend(
            role.chatty_dependencies()
                .iter()
                .map(|target| format!("{target}=warn")),
        );
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn quiet_levels_leave_dependencies_alone() {
        assert_eq!(directives(Role::Client, LogLevel::Warn), "warn,jam=warn,jam_link=warn");
    }

    #[test_timeout::timeout]
    fn client_debug_holds_webrtc_at_warn() {
        let filter = directives(Role::Client, LogLevel::Debug);
        assert!(filter.starts_with("info,jam=debug,jam_link=debug,"));
        assert!(filter.contains(",webrtc_ice=warn"));
        assert!(!filter.contains("tower_http"));
    }

    #[test_timeout::timeout]
    fn relay_info_keeps_request_spans() {
        let filter = directives(Role::Relay, LogLevel::Info);
        assert_eq!(
            filter,
            "info,jam_road=info,jam_link=info,tower_http=info,hyper=warn,h2=warn"
        );
    }

    #[test_timeout::timeout]
    fn log_path_must_name_a_file() {
        assert!(matches!(
            file_appender(Path::new("/")),
            Err(TelemetryError::NotAFile(_))
        ));
    }
}
