use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LoggingConfig;

// Guards flush the non-blocking writers; they must live for the whole process.
static CONSOLE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Client libraries that log every connection attempt at debug level.
const NOISY_CRATES: &[&str] = &["h2", "hyper_util", "bollard", "rskafka", "rumqttc"];

fn targets(level: LevelFilter) -> Targets {
    NOISY_CRATES.iter().fold(Targets::new().with_default(level), |t, name| {
        t.with_target(*name, LevelFilter::WARN.min(level))
    })
}

/// Installs the console layer and, when configured, a JSON file layer.
///
/// `RUST_LOG` caps both sinks when set.
///
/// # Errors
/// Invalid levels or an unusable log file location.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    _ = CONSOLE_GUARD.set(guard);
    let console = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(targets(LevelFilter::from_level(cfg.console_level()?)));

    let file = match &cfg.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            }
            let name = path
                .file_name()
                .with_context(|| format!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(writer)
                    .with_filter(targets(LevelFilter::from_level(cfg.file_level()?))),
            )
        }
        None => None,
    };

    let subscriber = Registry::default().with(env).with(console).with(file);
    _ = subscriber.try_init();
    Ok(())
}
