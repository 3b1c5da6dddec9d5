//! Process-wide tracing setup.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt::time::ChronoUtc, layer::SubscriberExt, EnvFilter, Layer, Registry,
};

use crate::error::{OperatorError, OperatorResult};

const LOG_FILE_PREFIX: &str = "redis-cluster-operator.log";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json: bool,
    /// Write a daily rolling file here in addition to stdout.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            log_dir: None,
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stdout_layer(json: bool) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(ChronoUtc::rfc_3339())
        .with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> OperatorResult<LogGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = vec![stdout_layer(config.json)];
    let mut file_guard = None;
    if let Some(dir) = &config.log_dir {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .with_writer(writer);
        layers.push(if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
        file_guard = Some(guard);
    }

    let subscriber = Registry::default().with(layers).with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OperatorError::Config(format!("failed to install tracing subscriber: {e}")))?;
    tracing_log::LogTracer::init()
        .map_err(|e| OperatorError::Config(format!("failed to bridge log records: {e}")))?;

    Ok(LogGuard { _file: file_guard })
}

pub fn parse_level(level: &str) -> Result<Level, String> {
    level
        .parse::<Level>()
        .map_err(|_| format!("unknown log level {level:?}"))
}
