use std::io::IsTerminal;

use crate::logger::{error::LoggerError, format::LoggerFormat, level::LoggerLevel};

/// Output format override (`text`, `json`, `journald`).
pub const ENV_LOG_FORMAT: &str = "FORGE_LOG_FORMAT";
/// `EnvFilter` directive override.
pub const ENV_LOG_LEVEL: &str = "FORGE_LOG_LEVEL";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: LoggerLevel,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let use_color = cfg!(test) || std::io::stderr().is_terminal();
        Self {
            format: LoggerFormat::Text,
            level: LoggerLevel::default(),
            with_targets: true,
            use_color,
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by [`ENV_LOG_FORMAT`] and [`ENV_LOG_LEVEL`].
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, LoggerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            cfg.format = format.parse()?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            cfg.level = LoggerLevel::new(level)?;
        }
        if cfg.format == LoggerFormat::Json {
            cfg.use_color = false;
        }
        Ok(cfg)
    }
}
