//! Endpoint configuration.
//!
//! Produced by the configuration factory on first use (or once at host
//! startup) and consumed by the [`PipelineStarter`](crate::pipeline::PipelineStarter).

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::{recoverability::RecoverabilitySettings, transport::MessageSender};

/// Environment variable holding the storage connection string when no other
/// name is configured.
pub const DEFAULT_CONNECTION_STRING_NAME: &str = "AzureWebJobsStorage";

/// Queue failed messages are forwarded to.
pub const DEFAULT_ERROR_QUEUE: &str = "error";

/// Trigger binding the function host declares for the endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueTrigger {
    pub queue_name: String,
    /// Name of the environment variable holding the connection string.
    pub connection: Option<String>,
}

/// Configuration of a function-hosted endpoint.
#[derive(Clone)]
pub struct EndpointConfiguration {
    endpoint_name: String,
    connection_string: Option<String>,
    recoverability: RecoverabilitySettings,
    error_queue: String,
    first_run_notice: Option<String>,
    error_sink: Option<Arc<dyn MessageSender>>,
}

impl EndpointConfiguration {
    /// Create a configuration for `endpoint_name`, reading the connection
    /// string from [`DEFAULT_CONNECTION_STRING_NAME`].
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            connection_string: std::env::var(DEFAULT_CONNECTION_STRING_NAME).ok(),
            recoverability: RecoverabilitySettings::default(),
            error_queue: DEFAULT_ERROR_QUEUE.to_owned(),
            first_run_notice: None,
            error_sink: None,
        }
    }

    /// Derive the configuration from the function's queue trigger: the queue
    /// name becomes the endpoint name.
    pub fn from_trigger(trigger: &QueueTrigger) -> Result<Self, ConfigError> {
        let queue_name = trigger.queue_name.trim();
        if queue_name.is_empty() {
            return Err(ConfigError::new(ConfigErrorKind::MissingQueueName));
        }

        let configuration = Self::new(queue_name);
        Ok(match &trigger.connection {
            Some(name) => configuration.with_connection_string_name(name),
            None => configuration,
        })
    }

    /// Read the connection string from the environment variable `name`.
    pub fn with_connection_string_name(mut self, name: &str) -> Self {
        self.connection_string = std::env::var(name).ok();
        self
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_recoverability(mut self, settings: RecoverabilitySettings) -> Self {
        self.recoverability = settings;
        self
    }

    pub fn with_immediate_retries(mut self, retries: u32) -> Self {
        self.recoverability.immediate_retries = retries;
        self
    }

    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    /// Message logged once, when the pipeline first starts.
    pub fn with_first_run_notice(mut self, notice: impl Into<String>) -> Self {
        self.first_run_notice = Some(notice.into());
        self
    }

    /// Where failed messages are sent. Defaults to an in-memory transport.
    pub fn with_error_sink(mut self, sink: impl MessageSender + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn recoverability(&self) -> &RecoverabilitySettings {
        &self.recoverability
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    pub fn first_run_notice(&self) -> Option<&str> {
        self.first_run_notice.as_deref()
    }

    pub fn error_sink(&self) -> Option<Arc<dyn MessageSender>> {
        self.error_sink.clone()
    }
}

impl std::fmt::Debug for EndpointConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfiguration")
            .field("endpoint_name", &self.endpoint_name)
            .field("has_connection_string", &self.connection_string.is_some())
            .field("recoverability", &self.recoverability)
            .field("error_queue", &self.error_queue)
            .field("has_error_sink", &self.error_sink.is_some())
            .finish()
    }
}

/// Error returned when an endpoint configuration cannot be built.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Configuration error kinds.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// The trigger does not name a queue to derive the endpoint name from.
    MissingQueueName,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::MissingQueueName => writeln!(
                f,
                "Config error: unable to derive the endpoint name, the queue trigger has no queue name"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let configuration = EndpointConfiguration::new("sales");

        assert_eq!(configuration.endpoint_name(), "sales");
        assert_eq!(configuration.recoverability().immediate_retries, 4);
        assert_eq!(configuration.error_queue(), DEFAULT_ERROR_QUEUE);
        assert_eq!(configuration.first_run_notice(), None);
        assert!(configuration.error_sink().is_none());
    }

    #[test]
    fn trigger_names_the_endpoint_and_connection() {
        // Unique name so parallel tests never race on the same variable.
        let variable = "LETTERBOX_TEST_TRIGGER_CONNECTION";
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var(variable, "UseDevelopmentStorage=true") };

        let configuration = EndpointConfiguration::from_trigger(&QueueTrigger {
            queue_name: " orders ".to_owned(),
            connection: Some(variable.to_owned()),
        })
        .unwrap();

        assert_eq!(configuration.endpoint_name(), "orders");
        assert_eq!(
            configuration.connection_string(),
            Some("UseDevelopmentStorage=true")
        );
    }

    #[test]
    fn trigger_without_queue_name_is_rejected() {
        let err = EndpointConfiguration::from_trigger(&QueueTrigger::default()).unwrap_err();

        assert_eq!(err.kind(), &ConfigErrorKind::MissingQueueName);
    }

    #[test]
    fn builder_overrides() {
        let configuration = EndpointConfiguration::new("sales")
            .with_connection_string("conn")
            .with_immediate_retries(0)
            .with_error_queue("sales.errors")
            .with_first_run_notice("hello");

        assert_eq!(configuration.connection_string(), Some("conn"));
        assert_eq!(configuration.recoverability().immediate_retries, 0);
        assert_eq!(configuration.error_queue(), "sales.errors");
        assert_eq!(configuration.first_run_notice(), Some("hello"));
    }
}
