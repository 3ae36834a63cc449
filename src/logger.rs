//! Global `tracing` subscriber setup.
//!
//! [`LoggerManager`] validates a [`LoggerConfig`] and installs a console layer
//! and/or a journald layer, each behind its own `EnvFilter`.

use std::{fmt as std_fmt, io};

use thiserror::Error;
use time::{format_description::well_known::Rfc3339, format_description::OwnedFormatItem, OffsetDateTime};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid timestamp format: {0}")]
    TimestampFormat(String),

    /// Journald socket unavailable.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error("Failed to initialize journald logger while console output is enabled")]
    JournaldFailedWithConsoleEnabled,
}

/// Console timestamp renderer for the configured [`TimestampFormat`].
#[derive(Debug, Clone)]
pub enum Timestamp {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl Timestamp {
    pub fn from_config(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => Timestamp::Rfc3339,
            TimestampFormat::Unix => Timestamp::Unix,
            TimestampFormat::Custom(description) => Timestamp::Custom(
                time::format_description::parse_owned::<2>(description)
                    .map_err(|e| LoggerError::TimestampFormat(format!("{description}: {e}")))?,
            ),
        })
    }

    fn render(&self, now: OffsetDateTime) -> Result<String, std_fmt::Error> {
        match self {
            Timestamp::Rfc3339 => now.format(&Rfc3339).map_err(|_| std_fmt::Error),
            Timestamp::Unix => Ok(format!("{}.{:06}", now.unix_timestamp(), now.microsecond())),
            Timestamp::Custom(description) => now.format(description).map_err(|_| std_fmt::Error),
        }
    }
}

impl FormatTime for Timestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std_fmt::Result {
        write!(w, "{}", self.render(OffsetDateTime::now_utc())?)
    }
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if configuration validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once, before anything logs.
    ///
    /// # Errors
    ///
    /// Fails when no layer could be built, when journald is the problem and
    /// console output was also requested, or when a subscriber is already set.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            let timestamp = Timestamp::from_config(&self.config.timestamp_format)?;
            layers.push(console_layer(console, timestamp, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    layers.push(
                        layer
                            .with_syslog_identifier(journald.identifier.clone())
                            .with_filter(self.filter())
                            .boxed(),
                    );
                    print_info!("Journald logger initialized with identifier: {}", journald.identifier);
                }
                Err(e) => {
                    print_warn!("Failed to initialize journald logger: {}", e);
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
            .map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
    }
}

fn console_layer(config: &ConsoleConfig, timestamp: Timestamp, filter: EnvFilter) -> BoxedLayer {
    let span_events = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(span_events)
        .with_ansi(config.ansi_colors)
        .with_timer(timestamp)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}
