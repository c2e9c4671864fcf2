//! Tracing setup: a non-blocking file layer under the data dir plus a
//! compact stderr layer.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,rustls=warn,tungstenite=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Everything the subscriber needs, resolved from the environment up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub log_path: PathBuf,
    pub filter: String,
    pub format: LogFormat,
    pub run_id: String,
    pub truncate: bool,
}

impl LogSettings {
    /// `SVAKLA_LOG_FILTER` > `RUST_LOG` > built-in filter; an unparsable
    /// directive string falls through to the next source.
    pub fn resolve(log_dir: &Path, var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = ["SVAKLA_LOG_FILTER", "RUST_LOG"]
            .into_iter()
            .filter_map(|key| var(key))
            .find(|value| EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let run_id = var("SVAKLA_RUN_ID")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("pid-{}-{}", std::process::id(), now)
            });

        Self {
            log_path: log_dir.join(LOG_FILE),
            filter,
            format: LogFormat::parse(var("SVAKLA_LOG_FORMAT").as_deref()),
            run_id,
            truncate: var("SVAKLA_TRUNCATE_SERVER_LOG_ON_START").as_deref() == Some("1"),
        }
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    /// Flushes the file writer on drop.
    _guard: WorkerGuard,
}

/// Install the global subscriber. Keep the returned handle alive for the
/// whole run.
pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    let settings = LogSettings::resolve(log_dir, |key| std::env::var(key).ok());
    std::fs::create_dir_all(log_dir)?;

    if settings.truncate {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&settings.log_path)?;
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::new(&settings.filter))
        .with(stderr_layer);

    match settings.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %settings.log_path.display(),
        format = settings.format.as_str(),
        run_id = %settings.run_id,
        filter = %settings.filter,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        _guard: guard,
    })
}
