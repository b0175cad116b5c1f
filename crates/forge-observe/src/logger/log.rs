use std::error::Error as StdError;

use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    Layer, Registry,
    fmt::{self, format::FmtSpan, time::OffsetTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::logger::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

type Output = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Build the output layer for `cfg`, put the level filter on top and install the result as
/// the global subscriber.
pub(crate) fn install(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let output = output(cfg)?;
    let filter = cfg.level.to_filter()?;

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(classify)
}

/// Closing a span logs its busy and idle time, which gives every batch a duration record.
fn output(cfg: &LoggerConfig) -> Result<Output, LoggerError> {
    match cfg.format {
        LoggerFormat::Text => Ok(fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(cfg.use_color)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339())
            .with_span_events(FmtSpan::CLOSE)
            .boxed()),
        LoggerFormat::Json => Ok(fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(cfg.with_targets)
            .with_current_span(true)
            .with_span_list(false)
            .with_timer(local_rfc3339())
            .with_span_events(FmtSpan::CLOSE)
            .boxed()),
        LoggerFormat::Journald => journald(),
    }
}

fn local_rfc3339() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn classify(e: TryInitError) -> LoggerError {
    let mut cause: Option<&(dyn StdError + 'static)> = Some(&e);
    while let Some(c) = cause {
        if c.to_string().contains("already") {
            return LoggerError::AlreadyInitialized;
        }
        cause = c.source();
    }
    LoggerError::InitializationFailed(e.to_string())
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald() -> Result<Output, LoggerError> {
    tracing_journald::layer()
        .map(|layer| layer.boxed())
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald() -> Result<Output, LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}
