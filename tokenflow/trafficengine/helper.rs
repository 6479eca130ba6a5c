use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use shared_event_bus::{EventPublisher, RunEvent};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::{runtime::Handle, task::JoinHandle};
use uuid::Uuid;

/// Telemetry builder for the traffic engine.
pub struct SimulationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl SimulationTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            sink: None,
            event_publisher: None,
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level` when logging to a file.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Uses an existing sink; takes precedence over [`Self::log_path`].
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<SimulationTelemetry> {
        let sink: Option<Arc<dyn LogSink>> = match (self.sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::with_min_level(path, self.min_level)?)),
            (None, None) => None,
        };
        Ok(SimulationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
                event: self.event_publisher.map(EventHandle::new),
            }),
        })
    }
}

/// Telemetry handle shared across engine components.
///
/// A handle with neither sink nor publisher is a no-op, which is what
/// [`SimulationTelemetry::disabled`] returns.
#[derive(Clone)]
pub struct SimulationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SimulationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.sink.is_some())
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    event: Option<EventHandle>,
}

struct EventHandle {
    publisher: Arc<dyn EventPublisher>,
    pending: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn publish(&self, event: RunEvent) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            let task = handle.spawn(async move { publisher.publish(event).await });
            let mut pending = self.pending.lock();
            pending.retain(|task| !task.is_finished());
            pending.push(task);
            Ok(())
        } else {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.publisher.publish(event))
        }
    }

    async fn flush(&self) -> Result<()> {
        let tasks: Vec<_> = std::mem::take(&mut *self.pending.lock());
        for task in tasks {
            task.await??;
        }
        Ok(())
    }
}

impl SimulationTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SimulationTelemetryBuilder {
        SimulationTelemetryBuilder::new(module)
    }

    /// Telemetry that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "tokenflow".into(),
                sink: None,
                event: None,
            }),
        }
    }

    /// Module label stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Writes a structured log record; object metadata becomes record fields.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(sink) = &self.inner.sink {
            let record = LogRecord::new(&self.inner.module, level, message).with_fields(metadata);
            sink.log(&record)?;
        }
        Ok(())
    }

    /// Publishes a lifecycle event.
    ///
    /// Inside a Tokio runtime the publish is spawned and can be awaited with
    /// [`Self::flush`]; outside one it runs to completion before returning.
    pub fn event(&self, topic: &str, run_id: Option<Uuid>, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(RunEvent::new(self.inner.module.clone(), topic, run_id, payload))?;
        }
        Ok(())
    }

    /// Waits for spawned publishes and surfaces their first error.
    pub async fn flush(&self) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.flush().await?;
        }
        Ok(())
    }
}

impl Default for SimulationTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Generates a random seed for runs that do not pin one.
#[must_use]
pub fn random_seed() -> u32 {
    rand::thread_rng().gen()
}
