use std::{fmt, path::PathBuf, sync::Arc, sync::OnceLock};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle, Runtime};

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below this level.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                event: self.event_publisher.map(EventHandle::new),
            }),
        })
    }
}

/// Telemetry handle shared across engine components.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    fallback: OnceLock<Runtime>,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            fallback: OnceLock::new(),
            publisher,
        }
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            return Ok(());
        }
        // Callers outside any runtime share one lazily built current-thread runtime.
        let runtime = match self.fallback.get() {
            Some(runtime) => runtime,
            None => {
                let runtime = Builder::new_current_thread().enable_all().build()?;
                self.fallback.get_or_init(|| runtime)
            }
        };
        runtime.block_on(self.publisher.publish(record))
    }
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Module name stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(
                self.inner.module.clone(),
                event_type,
                payload,
            ))?;
        }
        Ok(())
    }
}

/// Logs through optional telemetry, ignoring sink failures.
pub(crate) fn log(
    telemetry: Option<&EngineTelemetry>,
    level: LogLevel,
    message: &str,
    metadata: Value,
) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

/// Emits through optional telemetry, ignoring sink failures.
pub(crate) fn event(telemetry: Option<&EngineTelemetry>, event_type: &str, payload: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.event(event_type, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EngineTelemetry::builder("engine")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(
                LogLevel::Info,
                "training.run.accepted",
                json!({ "model_id": "m-1" }),
            )
            .unwrap();
        telemetry
            .event("training.run.completed", json!({ "model_id": "m-1" }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("training.run.accepted"));
        assert_eq!(bus.snapshot().len(), 1);
        assert_eq!(bus.snapshot()[0].source, "engine");
    }

    #[test]
    fn min_level_filters_debug_noise() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let telemetry = EngineTelemetry::builder("engine")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .build()
            .unwrap();
        telemetry.log(LogLevel::Debug, "noise", json!({})).unwrap();
        telemetry.log(LogLevel::Warn, "signal", json!({})).unwrap();
        let records = shared_logging::read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "signal");
    }
}
