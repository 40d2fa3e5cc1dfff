//! The message-processing pipeline.
//!
//! The endpoint only needs two things from a started pipeline: a way to push
//! a message through it, and an error entry point that decides what happens
//! to a message whose processing failed. Both live on the [`Pipeline`] trait.
//! A [`PipelineStarter`] builds one from an [`EndpointConfiguration`].
//!
//! [`HandlerPipeline`] is the default implementation. It routes each message
//! to the active handlers of the [`HandlerCatalog`] registered for its
//! message type and applies the configured recoverability policy to failures.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use tracing_error::SpanTrace;

use crate::{
    config::EndpointConfiguration,
    context::{FailureRecord, ProcessingContext},
    envelope::{Headers, headers},
    modules::HandlerCatalog,
    recoverability::{
        DefaultRecoverabilityPolicy, ErrorHandleResult, RecoverabilityAction, RecoverabilityPolicy,
        failed_message,
    },
    transport::{InMemory, MessageSender, RawMessage, Transport, layers::JsonLayer},
};

/// A started pipeline, shared by every dispatch once ready.
pub type PipelineHandle = Arc<dyn Pipeline>;

/// A started message-processing pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Run the message through the pipeline.
    async fn push_message(&self, context: ProcessingContext) -> Result<(), tower::BoxError>;

    /// Decide what happens to a message whose processing failed.
    async fn push_failed_message(
        &self,
        failure: &FailureRecord,
    ) -> Result<ErrorHandleResult, tower::BoxError>;
}

/// Builds a [`Pipeline`] from an endpoint configuration.
#[async_trait]
pub trait PipelineStarter: Send + Sync {
    async fn start(
        &self,
        configuration: EndpointConfiguration,
        catalog: HandlerCatalog,
    ) -> Result<PipelineHandle, tower::BoxError>;
}

/// Handles one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Fully qualified message type this handler accepts.
    fn message_type(&self) -> &str;

    async fn handle(&self, context: &ProcessingContext) -> Result<(), tower::BoxError>;
}

/// Starts a [`HandlerPipeline`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HandlerPipelineStarter;

#[async_trait]
impl PipelineStarter for HandlerPipelineStarter {
    async fn start(
        &self,
        configuration: EndpointConfiguration,
        catalog: HandlerCatalog,
    ) -> Result<PipelineHandle, tower::BoxError> {
        let policy = DefaultRecoverabilityPolicy::new(
            configuration.recoverability().immediate_retries,
            configuration.error_queue(),
        );
        let error_sink = configuration.error_sink().unwrap_or_else(|| {
            Arc::new(Transport::new(InMemory::<RawMessage>::default()).layer(JsonLayer))
                as Arc<dyn MessageSender>
        });

        debug!(
            endpoint = configuration.endpoint_name(),
            message_types = ?catalog.message_types(),
            "Starting handler pipeline"
        );

        Ok(Arc::new(HandlerPipeline {
            endpoint_name: configuration.endpoint_name().to_owned(),
            catalog,
            policy: Arc::new(policy),
            error_sink,
        }))
    }
}

/// Routes messages to catalog handlers by their enclosed message type.
pub struct HandlerPipeline {
    endpoint_name: String,
    catalog: HandlerCatalog,
    policy: Arc<dyn RecoverabilityPolicy>,
    error_sink: Arc<dyn MessageSender>,
}

impl HandlerPipeline {
    pub fn new(
        endpoint_name: impl Into<String>,
        catalog: HandlerCatalog,
        policy: impl RecoverabilityPolicy + 'static,
        error_sink: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            catalog,
            policy: Arc::new(policy),
            error_sink,
        }
    }
}

#[async_trait]
impl Pipeline for HandlerPipeline {
    #[tracing::instrument(skip_all, fields(message_id = %context.message_id))]
    async fn push_message(&self, context: ProcessingContext) -> Result<(), tower::BoxError> {
        let message_type = enclosed_message_type(&context.headers)
            .ok_or_else(|| PipelineError::new(PipelineErrorKind::MissingMessageType))?;

        let handlers = self.catalog.handlers_for(message_type);
        if handlers.is_empty() {
            return Err(
                PipelineError::new(PipelineErrorKind::NoHandlers(message_type.to_owned())).into(),
            );
        }

        for handler in handlers {
            tokio::select! {
                biased;
                _ = context.cancellation.cancelled() => {
                    return Err(PipelineError::new(PipelineErrorKind::Cancelled).into());
                }
                result = handler.handle(&context) => result?,
            }
        }

        debug!(message_type, "Message handled");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(message_id = %failure.message_id, delivery_count = failure.delivery_count))]
    async fn push_failed_message(
        &self,
        failure: &FailureRecord,
    ) -> Result<ErrorHandleResult, tower::BoxError> {
        match self.policy.decide(failure) {
            RecoverabilityAction::ImmediateRetry => {
                debug!(error = %failure.error(), "Processing failed, leaving message for redelivery");
                Ok(ErrorHandleResult::NotHandled)
            }
            RecoverabilityAction::MoveToError { queue } => {
                let message = failed_message(failure, &self.endpoint_name, &queue);
                self.error_sink.dispatch(message).await?;
                warn!(
                    error = %failure.error(),
                    %queue,
                    "Moved message to the error queue"
                );
                Ok(ErrorHandleResult::Handled)
            }
        }
    }
}

/// First message type named in the enclosed-types header.
///
/// The header may list several types (the message type followed by the types
/// it implements); only the first one is routed on.
pub fn enclosed_message_type(headers: &Headers) -> Option<&str> {
    headers
        .get(headers::ENCLOSED_MESSAGE_TYPES)?
        .split([';', ','])
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Error raised by [`HandlerPipeline`] itself, as opposed to a handler.
#[derive(Debug)]
pub struct PipelineError {
    context: SpanTrace,
    kind: PipelineErrorKind,
}

/// Pipeline error kinds.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// The message does not say what type it is.
    MissingMessageType,
    /// No active handler accepts the message type.
    NoHandlers(String),
    /// The dispatch was cancelled before all handlers completed.
    Cancelled,
}

impl PipelineError {
    fn new(kind: PipelineErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PipelineErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PipelineErrorKind::MissingMessageType => {
                writeln!(f, "Pipeline error: message has no enclosed message type")
            }
            PipelineErrorKind::NoHandlers(message_type) => {
                writeln!(f, "Pipeline error: no handlers could be found for {message_type}")
            }
            PipelineErrorKind::Cancelled => writeln!(f, "Pipeline error: dispatch cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PipelineError {}
