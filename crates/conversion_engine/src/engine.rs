use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use conversion_core::{categorize, ConversionId, ErrorContext, ErrorId, ErrorInfo, StepError};
use engine_logging::{engine_warn, LogSink};

use crate::config::{ConfigError, EngineConfig};
use crate::diagnostics::DiagnosticsCollector;
use crate::events::{EngineEvent, EventBus, EventSink};
use crate::handler::{ConversionErrorHandler, HandledError, HandlerSettings};
use crate::monitor::ConversionMonitor;
use crate::probe::{ResourceProbe, SysinfoProbe};
use crate::recovery::{RecoveryRegistry, RegistryError, YamlValidator};
use crate::report::{DiagnosticReport, ReportError};
use crate::tracker::TrackerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One supervisor instance: a shared log sink and event bus wired into the
/// error handler and the run monitor.
pub struct Engine {
    config: EngineConfig,
    sink: Arc<LogSink>,
    events: Arc<EventBus>,
    handler: ConversionErrorHandler,
    monitor: ConversionMonitor,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let registry =
            RecoveryRegistry::with_defaults(&config.recovery, Arc::new(YamlValidator));
        Self::with_parts(config, Arc::new(SysinfoProbe::new()), registry)
    }

    pub fn with_parts(
        config: EngineConfig,
        probe: Arc<dyn ResourceProbe>,
        registry: RecoveryRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        registry.validate()?;

        let sink = Arc::new(LogSink::new(config.log_dir.clone(), config.rotation_policy()));
        let events = Arc::new(EventBus::new());
        let handler = ConversionErrorHandler::new(
            HandlerSettings::from(&config),
            registry,
            DiagnosticsCollector::new(sink.clone(), probe.clone()),
            sink.clone(),
            events.clone(),
        );
        let monitor = ConversionMonitor::new(&config, sink.clone(), probe, events.clone());

        Ok(Self {
            config,
            sink,
            events,
            handler,
            monitor,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn handler(&self) -> &ConversionErrorHandler {
        &self.handler
    }

    pub fn monitor(&self) -> &ConversionMonitor {
        &self.monitor
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    pub fn event_channel(&self) -> mpsc::Receiver<EngineEvent> {
        self.events.channel()
    }

    /// Handle a failure and, when the context names a conversion, attach the
    /// resulting record to it so run statistics count the category.
    pub async fn handle_conversion_error(
        &self,
        error: ErrorInfo,
        context: &mut ErrorContext,
    ) -> HandledError {
        let handled = self.handler.handle_error(error, context).await;
        if let Some(conversion_id) = context.conversion_id {
            self.attach(conversion_id, &handled);
        }
        handled
    }

    /// Fail the active step `step` of a conversion with `error`, running the
    /// full handling path first. The step records the error id.
    ///
    /// A step that is not open is rejected before the error is handled, so
    /// nothing is recorded or recovered for it.
    pub async fn fail_step(
        &self,
        conversion_id: ConversionId,
        step: &str,
        error: ErrorInfo,
        context: &mut ErrorContext,
    ) -> Result<HandledError, TrackerError> {
        self.monitor
            .tracker()
            .check_step_active(conversion_id, step)?;
        context.conversion_id = Some(conversion_id);
        if context.step.is_none() {
            context.step = Some(step.to_string());
        }
        let message = error.message.clone();
        let handled = self.handler.handle_error(error, context).await;
        self.attach(conversion_id, &handled);
        self.monitor.tracker().fail_step(
            conversion_id,
            step,
            StepError {
                error_id: Some(handled.error_id),
                message,
            },
        )?;
        Ok(handled)
    }

    /// Fail `step` again after the caller retried with the context that
    /// recovering `previous` produced.
    ///
    /// When `error` falls in the same category as `previous`, recovery
    /// resumes on that record and spends what is left of its attempt budget
    /// instead of opening a new record. Otherwise this is `fail_step`.
    pub async fn fail_step_again(
        &self,
        conversion_id: ConversionId,
        step: &str,
        previous: ErrorId,
        error: ErrorInfo,
        context: &mut ErrorContext,
    ) -> Result<HandledError, TrackerError> {
        let same_category = self
            .handler
            .get_error(previous)
            .is_some_and(|record| categorize(&error, context).category == record.category);
        if !same_category {
            return self.fail_step(conversion_id, step, error, context).await;
        }

        self.monitor
            .tracker()
            .check_step_active(conversion_id, step)?;
        let message = error.message.clone();
        let Some(handled) = self.handler.retry_recovery(previous, context).await else {
            // Evicted between the lookup and the retry.
            return self.fail_step(conversion_id, step, error, context).await;
        };
        self.monitor.tracker().fail_step(
            conversion_id,
            step,
            StepError {
                error_id: Some(previous),
                message,
            },
        )?;
        Ok(handled)
    }

    fn attach(&self, conversion_id: ConversionId, handled: &HandledError) {
        let Some(record) = self.handler.get_error(handled.error_id) else {
            return;
        };
        if let Err(err) = self.monitor.tracker().attach_error(conversion_id, record) {
            engine_warn!(
                "Could not attach error {} to conversion {}: {}",
                handled.error_id,
                conversion_id,
                err
            );
        }
    }

    pub fn diagnostic_report(&self) -> DiagnosticReport {
        self.monitor.generate_report(Some(&self.handler))
    }

    /// Export to `path`, or to `diagnostic-report.json` in the log directory.
    pub fn export_diagnostic_report(&self, path: Option<&Path>) -> Result<PathBuf, ReportError> {
        let default_path;
        let path = match path {
            Some(path) => path,
            None => {
                default_path = self.sink.dir().join("diagnostic-report.json");
                &default_path
            }
        };
        self.monitor.export_report(path, Some(&self.handler))
    }

    /// Administrative reset of every record, counter and sample.
    pub fn clear(&self) {
        self.handler.clear();
        self.monitor.clear();
    }
}
