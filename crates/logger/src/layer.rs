use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::subscriber::Interest;
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{LoggerError, Result};
use crate::level::LogLevel;
use crate::logger::Logger;

/// Routes `tracing` events through a [`Logger`].
///
/// Event fields other than `message` are appended as `name=value`.
pub struct LoggerLayer {
    logger: Arc<Logger>,
}

impl LoggerLayer {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl<S: Subscriber> Layer<S> for LoggerLayer {
    // The threshold can change at runtime, so no callsite is cached as never.
    fn register_callsite(&self, _metadata: &'static Metadata<'static>) -> Interest {
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.logger.enabled(LogLevel::from(*metadata.level()))
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        if !self.logger.enabled(level) {
            return;
        }
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.logger.log(level, format_args!("{}", visitor.finish()));
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl EventVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info"` or `"utilkit_kafka=debug"`).
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))
}

/// Install a global subscriber that writes every `tracing` event through
/// `logger`, leveled by the logger's own threshold.
pub fn init_with_logger(logger: Arc<Logger>) -> Result<()> {
    tracing_subscriber::registry()
        .with(LoggerLayer::new(logger))
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuffer;

    fn layered(level: LogLevel) -> (impl Subscriber + Send + Sync, SharedBuffer) {
        let buf = SharedBuffer::default();
        let logger = Logger::with_output(level, buf.clone());
        logger.set_timestamps(false);
        let subscriber = tracing_subscriber::registry().with(LoggerLayer::new(Arc::new(logger)));
        (subscriber, buf)
    }

    #[test]
    fn test_layer_routes_events() {
        let (subscriber, buf) = layered(LogLevel::Info);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("joined group");
            tracing::warn!(partition = 3, "claim ended");
            tracing::debug!("filtered out");
        });

        let got = buf.contents();
        assert!(got.contains("[INFO] joined group\n"));
        assert!(got.contains("[WARN] claim ended partition=3\n"));
        assert!(!got.contains("filtered out"));
    }

    #[test]
    fn test_layer_respects_runtime_level() {
        let buf = SharedBuffer::default();
        let logger = Arc::new(Logger::with_output(LogLevel::Error, buf.clone()));
        logger.set_timestamps(false);
        let subscriber = tracing_subscriber::registry().with(LoggerLayer::new(logger.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("kept");
            tracing::info!("dropped");
        });

        assert_eq!(buf.contents(), "[ERROR] kept\n");
    }

    #[test]
    fn test_lowering_level_reenables_callsite() {
        let buf = SharedBuffer::default();
        let logger = Arc::new(Logger::with_output(LogLevel::Info, buf.clone()));
        logger.set_timestamps(false);
        let subscriber = tracing_subscriber::registry().with(LoggerLayer::new(logger.clone()));

        let emit = |n: u32| tracing::debug!("dbg {n}");
        tracing::subscriber::with_default(subscriber, || {
            emit(1);
            logger.set_level(LogLevel::Debug);
            emit(2);
        });

        assert_eq!(buf.contents(), "[DEBUG] dbg 2\n");
    }
}
