//! Global `tracing` subscriber setup.
//!
//! [`LoggerManager`] turns a validated [`LoggerConfig`] into a registry with
//! a console layer and, when enabled, a systemd journald layer. Both layers
//! read `RUST_LOG` first and fall back to the configured level.

use std::{fmt, io};

use thiserror::Error;
use time::{format_description::OwnedFormatItem, OffsetDateTime};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error("Failed to initialize journald logger while console logging is enabled")]
    JournaldFailedWithConsoleEnabled,
}

/// Event timestamps rendered with the `time` crate.
#[derive(Debug, Clone)]
pub struct LogTimer {
    custom: Option<OwnedFormatItem>,
    unix: bool,
}

impl LogTimer {
    pub fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        let timer = match format {
            TimestampFormat::Rfc3339 => LogTimer {
                custom: None,
                unix: false,
            },
            TimestampFormat::Unix => LogTimer {
                custom: None,
                unix: true,
            },
            TimestampFormat::Custom(description) => LogTimer {
                custom: Some(
                    time::format_description::parse_owned::<2>(description)
                        .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
                ),
                unix: false,
            },
        };
        Ok(timer)
    }

    fn render(&self, now: OffsetDateTime) -> String {
        if self.unix {
            return format!("{}.{:03}", now.unix_timestamp(), now.millisecond());
        }
        let formatted = match &self.custom {
            Some(items) => now.format(items),
            None => now.format(&time::format_description::well_known::Rfc3339),
        };
        formatted.unwrap_or_default()
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", self.render(OffsetDateTime::now_utc()))
    }
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Validates `config`; nothing is installed until [`LoggerManager::init`].
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the first event.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.console_layer(console)?);
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.journald_layer(&journald.identifier) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(&self, config: &ConsoleConfig) -> Result<BoxedLayer, LoggerError> {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = tracing_subscriber::fmt::layer()
            .with_timer(LogTimer::new(&self.config.timestamp_format)?)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        let layer = match config.format {
            LogFormat::Json => base.json().with_filter(self.filter()).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(self.filter()).boxed(),
            LogFormat::Compact => base.compact().with_filter(self.filter()).boxed(),
        };
        Ok(layer)
    }

    fn journald_layer(&self, identifier: &str) -> Result<BoxedLayer, LoggerError> {
        let layer = tracing_journald::layer()?.with_syslog_identifier(identifier.to_string());
        Ok(layer.with_filter(self.filter()).boxed())
    }
}
