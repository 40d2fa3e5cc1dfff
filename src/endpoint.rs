//! Per-invocation entry point for queue-triggered functions.
//!
//! A [`FunctionEndpoint`] is created once per process and shared by every
//! invocation. For each message the host pushes, [`FunctionEndpoint::process`]
//! decodes the envelope, makes sure the pipeline is built, runs the message
//! through it and, when processing fails, asks the pipeline's recoverability
//! whether the failure was handled.
//!
//! Handled failures complete the invocation normally, so the host deletes
//! the message. Unhandled failures return the handler's original error, so
//! the host keeps the message and redelivers it.

use std::{path::Path, sync::Arc};

use tracing::{Instrument, Span, instrument::WithSubscriber};
use tracing_error::SpanTrace;

use crate::{
    bootstrap::{BootstrapError, Bootstrapper, PipelineState},
    config::EndpointConfiguration,
    context::{ExecutionContext, FailureRecord, ProcessingContext},
    envelope::{self, CodecError},
    hooks::{DefaultEndpointHook, EndpointHook},
    modules::{HandlerCatalog, ModuleError, ModuleLoader},
    pipeline::{PipelineHandle, PipelineStarter},
    recoverability::ErrorHandleResult,
};

/// A message endpoint hosted inside a function app.
pub struct FunctionEndpoint {
    bootstrapper: Bootstrapper,
    hook: Arc<dyn EndpointHook>,
}

impl FunctionEndpoint {
    /// Create an endpoint whose configuration is produced by `factory` on the
    /// first invocation.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<EndpointConfiguration, tower::BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            bootstrapper: Bootstrapper::new(factory),
            hook: Arc::new(DefaultEndpointHook),
        }
    }

    /// Create an endpoint at host start-up.
    ///
    /// Modules in `<app_directory>/bin` are loaded straight away instead of
    /// on the first invocation, and `configuration` is used as is.
    pub fn prepared(
        configuration: EndpointConfiguration,
        catalog: HandlerCatalog,
        app_directory: &Path,
    ) -> Result<Self, ModuleError> {
        ModuleLoader::default().load(&app_directory.join("bin"), &catalog)?;

        Ok(Self::new(move |_| Ok(configuration.clone()))
            .with_catalog(catalog)
            .with_module_loader(None))
    }

    /// Handlers available to the pipeline.
    pub fn with_catalog(mut self, catalog: HandlerCatalog) -> Self {
        self.bootstrapper = self.bootstrapper.with_catalog(catalog);
        self
    }

    pub fn with_starter(mut self, starter: impl PipelineStarter + 'static) -> Self {
        self.bootstrapper = self.bootstrapper.with_starter(starter);
        self
    }

    pub fn with_module_loader(mut self, loader: Option<ModuleLoader>) -> Self {
        self.bootstrapper = self.bootstrapper.with_module_loader(loader);
        self
    }

    /// Where to look for handler modules. Defaults to
    /// `<function_app_directory>/bin`.
    pub fn with_module_directory_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&ExecutionContext) -> std::path::PathBuf + Send + Sync + 'static,
    {
        self.bootstrapper = self.bootstrapper.with_module_directory_resolver(resolver);
        self
    }

    pub fn with_hook(mut self, hook: impl EndpointHook + 'static) -> Self {
        let hook: Arc<dyn EndpointHook> = Arc::new(hook);
        self.bootstrapper = self.bootstrapper.with_hook(Arc::clone(&hook));
        self.hook = hook;
        self
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        self.bootstrapper.catalog()
    }

    pub fn state(&self) -> PipelineState {
        self.bootstrapper.state()
    }

    /// Build the pipeline now, without a message to process.
    pub async fn ensure_initialized(
        &self,
        context: &ExecutionContext,
    ) -> Result<PipelineHandle, BootstrapError> {
        self.bootstrapper.ensure_initialized(context).await
    }

    /// Process one raw queue message.
    ///
    /// `delivery_count` is the host's count of delivery attempts for the
    /// message, this one included. When the execution context carries a
    /// logger, everything logged during the invocation goes to it.
    pub async fn process(
        &self,
        raw: &[u8],
        context: &ExecutionContext,
        delivery_count: u32,
    ) -> Result<(), ProcessError> {
        let span = || {
            tracing::info_span!(
                "process_message",
                invocation_id = context.invocation_id(),
                function = context.function_name(),
                message_id = tracing::field::Empty,
            )
        };

        match context.logger() {
            Some(logger) => {
                let span = tracing::dispatcher::with_default(logger, span);
                self.dispatch(raw, context, delivery_count)
                    .instrument(span)
                    .with_subscriber(logger.clone())
                    .await
            }
            None => {
                self.dispatch(raw, context, delivery_count)
                    .instrument(span())
                    .await
            }
        }
    }

    async fn dispatch(
        &self,
        raw: &[u8],
        context: &ExecutionContext,
        delivery_count: u32,
    ) -> Result<(), ProcessError> {
        let envelope = envelope::decode(raw).map_err(|error| {
            self.hook.on_decode_error(&error);
            ProcessError::new(ProcessErrorKind::Decode(error))
        })?;
        Span::current().record("message_id", envelope.id.as_str());

        let pipeline = self
            .bootstrapper
            .ensure_initialized(context)
            .await
            .map_err(|e| ProcessError::new(ProcessErrorKind::Initialization(e)))?;

        let mut processing = ProcessingContext::from(envelope.clone());
        processing.cancellation = context.cancellation().child_token();
        self.hook.on_message_received(&processing);

        let error = match pipeline.push_message(processing).await {
            Ok(()) => {
                self.hook.on_message_processed(&envelope.id);
                return Ok(());
            }
            Err(error) => error,
        };

        let failure = FailureRecord::new(
            error,
            envelope.headers,
            envelope.id,
            envelope.body,
            delivery_count,
        );
        match pipeline.push_failed_message(&failure).await {
            Ok(ErrorHandleResult::Handled) => {
                self.hook.on_failure_handled(&failure);
                Ok(())
            }
            Ok(ErrorHandleResult::NotHandled) => {
                self.hook.on_failure_not_handled(&failure);
                Err(ProcessError::new(ProcessErrorKind::Processing(
                    failure.into_error(),
                )))
            }
            Err(error) => Err(ProcessError::new(ProcessErrorKind::Recoverability(error))),
        }
    }
}

impl std::fmt::Debug for FunctionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEndpoint")
            .field("bootstrapper", &self.bootstrapper)
            .finish()
    }
}

/// Error returned to the host when an invocation fails.
#[derive(Debug)]
pub struct ProcessError {
    context: SpanTrace,
    kind: ProcessErrorKind,
}

/// Classification of invocation errors.
#[derive(Debug)]
pub enum ProcessErrorKind {
    /// The raw message is not a valid envelope. Recoverability is not
    /// consulted.
    Decode(CodecError),
    /// The pipeline could not be built.
    Initialization(BootstrapError),
    /// Processing failed and recoverability did not handle it. Holds the
    /// error exactly as the pipeline returned it.
    Processing(tower::BoxError),
    /// Recoverability itself failed.
    Recoverability(tower::BoxError),
}

impl ProcessError {
    fn new(kind: ProcessErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ProcessErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ProcessErrorKind {
        self.kind
    }

    /// The unhandled processing error, if that is what this is.
    pub fn into_source(self) -> Option<tower::BoxError> {
        match self.kind {
            ProcessErrorKind::Processing(error) => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProcessErrorKind::Decode(err) => writeln!(f, "Decode error: {err}"),
            ProcessErrorKind::Initialization(err) => writeln!(f, "Initialization error: {err}"),
            ProcessErrorKind::Processing(err) => writeln!(f, "Processing error: {err}"),
            ProcessErrorKind::Recoverability(err) => writeln!(f, "Recoverability error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProcessErrorKind::Decode(err) => Some(err),
            ProcessErrorKind::Initialization(err) => Some(err),
            ProcessErrorKind::Processing(err) | ProcessErrorKind::Recoverability(err) => {
                Some(err.as_ref())
            }
        }
    }
}
