//! Lazy, exactly-once pipeline construction.
//!
//! The function host calls into the endpoint concurrently from the first
//! invocation on. Whichever call arrives first builds the pipeline: module
//! loading, the configuration factory and pipeline start-up all happen at
//! most once at a time, and every caller either gets the ready handle or
//! waits for it. A failed attempt leaves nothing behind, so the next call
//! starts over.

use std::{
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{Instrument, Span, debug, info};
use tracing_error::SpanTrace;

use crate::{
    config::EndpointConfiguration,
    context::ExecutionContext,
    hooks::{DefaultEndpointHook, EndpointHook},
    modules::{HandlerCatalog, ModuleLoader},
    pipeline::{HandlerPipelineStarter, PipelineHandle, PipelineStarter},
};

/// Produces the endpoint configuration on first use.
pub type ConfigurationFactory = Arc<
    dyn Fn(&ExecutionContext) -> Result<EndpointConfiguration, tower::BoxError> + Send + Sync,
>;

/// Maps an invocation to the directory handler modules are loaded from.
pub type ModuleDirectoryResolver = Arc<dyn Fn(&ExecutionContext) -> PathBuf + Send + Sync>;

/// Where the pipeline is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Absent,
    Constructing,
    Ready,
}

/// Builds the pipeline once and hands out the shared handle.
pub struct Bootstrapper {
    pipeline: OnceLock<PipelineHandle>,
    init_lock: Arc<Mutex<()>>,
    constructing: AtomicBool,
    factory: ConfigurationFactory,
    starter: Arc<dyn PipelineStarter>,
    loader: Option<ModuleLoader>,
    catalog: HandlerCatalog,
    resolver: ModuleDirectoryResolver,
    hook: Arc<dyn EndpointHook>,
}

impl Bootstrapper {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<EndpointConfiguration, tower::BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            pipeline: OnceLock::new(),
            init_lock: Arc::new(Mutex::new(())),
            constructing: AtomicBool::new(false),
            factory: Arc::new(factory),
            starter: Arc::new(HandlerPipelineStarter),
            loader: Some(ModuleLoader::default()),
            catalog: HandlerCatalog::default(),
            resolver: Arc::new(|context| context.function_app_directory().join("bin")),
            hook: Arc::new(DefaultEndpointHook),
        }
    }

    pub fn with_starter(mut self, starter: impl PipelineStarter + 'static) -> Self {
        self.starter = Arc::new(starter);
        self
    }

    /// Replace the module loader. `None` skips module loading, for hosts that
    /// already loaded modules up front.
    pub fn with_module_loader(mut self, loader: Option<ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_catalog(mut self, catalog: HandlerCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_module_directory_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&ExecutionContext) -> PathBuf + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn EndpointHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }

    pub fn state(&self) -> PipelineState {
        if self.pipeline.get().is_some() {
            PipelineState::Ready
        } else if self.constructing.load(Ordering::Acquire) {
            PipelineState::Constructing
        } else {
            PipelineState::Absent
        }
    }

    /// Return the pipeline, building it first if this is the first call.
    ///
    /// Concurrent callers wait for the one construction in progress. If the
    /// construction fails the error is returned to that caller only and the
    /// pipeline stays absent; nothing about the failure is cached.
    pub async fn ensure_initialized(
        &self,
        context: &ExecutionContext,
    ) -> Result<PipelineHandle, BootstrapError> {
        if let Some(pipeline) = self.pipeline.get() {
            return Ok(Arc::clone(pipeline));
        }

        let lock = Arc::clone(&self.init_lock).lock_owned().await;
        if let Some(pipeline) = self.pipeline.get() {
            return Ok(Arc::clone(pipeline));
        }

        let _constructing = Constructing::enter(&self.constructing);
        self.construct(context, lock)
            .instrument(tracing::info_span!("pipeline_construction"))
            .await
    }

    /// Build the pipeline and store it, holding `lock` throughout.
    ///
    /// The module scan owns the lock while it runs on the blocking pool, so a
    /// scan left running by a cancelled caller still excludes the next one.
    async fn construct(
        &self,
        context: &ExecutionContext,
        lock: OwnedMutexGuard<()>,
    ) -> Result<PipelineHandle, BootstrapError> {
        let _lock = match &self.loader {
            Some(loader) => {
                let loader = loader.clone();
                let catalog = self.catalog.clone();
                let directory = (self.resolver)(context);
                let dispatch = tracing::dispatcher::get_default(|dispatch| dispatch.clone());
                let span = Span::current();

                let (lock, report) = tokio::task::spawn_blocking(move || {
                    let report = tracing::dispatcher::with_default(&dispatch, || {
                        span.in_scope(|| loader.load(&directory, &catalog))
                    });
                    (lock, report)
                })
                .await
                .map_err(|e| BootstrapError::modules(e.into()))?;
                let report = report.map_err(|e| BootstrapError::modules(e.into()))?;

                debug!(
                    loaded = report.loaded.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Module directory scanned"
                );
                lock
            }
            None => lock,
        };

        let configuration = (self.factory)(context).map_err(BootstrapError::configuration)?;
        let endpoint_name = configuration.endpoint_name().to_owned();
        let notice = configuration.first_run_notice().map(str::to_owned);

        let pipeline = self
            .starter
            .start(configuration, self.catalog.clone())
            .await
            .map_err(BootstrapError::startup)?;

        if let Some(notice) = notice {
            info!("{notice}");
        }
        self.hook.on_pipeline_started(&endpoint_name);

        Ok(Arc::clone(self.pipeline.get_or_init(|| pipeline)))
    }
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("state", &self.state())
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// Marks construction in progress until dropped, including when the
/// initializing future is cancelled.
struct Constructing<'a>(&'a AtomicBool);

impl<'a> Constructing<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Constructing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Error returned when the pipeline could not be built.
#[derive(Debug)]
pub struct BootstrapError {
    context: SpanTrace,
    kind: BootstrapErrorKind,
}

/// Classification of bootstrap errors.
#[derive(Debug)]
pub enum BootstrapErrorKind {
    /// The module directory could not be scanned.
    Modules(tower::BoxError),
    /// The configuration factory failed.
    Configuration(tower::BoxError),
    /// The pipeline starter failed.
    Startup(tower::BoxError),
}

impl BootstrapError {
    fn modules(error: tower::BoxError) -> Self {
        Self::new(BootstrapErrorKind::Modules(error))
    }

    fn configuration(error: tower::BoxError) -> Self {
        Self::new(BootstrapErrorKind::Configuration(error))
    }

    fn startup(error: tower::BoxError) -> Self {
        Self::new(BootstrapErrorKind::Startup(error))
    }

    fn new(kind: BootstrapErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &BootstrapErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BootstrapErrorKind::Modules(err) => writeln!(f, "Module loading error: {err}"),
            BootstrapErrorKind::Configuration(err) => writeln!(f, "Configuration error: {err}"),
            BootstrapErrorKind::Startup(err) => writeln!(f, "Pipeline startup error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BootstrapErrorKind::Modules(err)
            | BootstrapErrorKind::Configuration(err)
            | BootstrapErrorKind::Startup(err) => Some(err.as_ref()),
        }
    }
}
