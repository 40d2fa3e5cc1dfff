#![doc = include_str!("../README.md")]

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod envelope;
pub mod hooks;
pub mod logging;
pub mod modules;
pub mod pipeline;
pub mod recoverability;
pub mod transport;

#[doc(inline)]
pub use bootstrap::{BootstrapError, BootstrapErrorKind, Bootstrapper, PipelineState};

#[doc(inline)]
pub use config::{EndpointConfiguration, QueueTrigger};

#[doc(inline)]
pub use context::{ExecutionContext, FailureRecord, ProcessingContext};

#[doc(inline)]
pub use endpoint::{FunctionEndpoint, ProcessError, ProcessErrorKind};

#[doc(inline)]
pub use envelope::{CodecError, Envelope};

#[doc(inline)]
pub use hooks::{DefaultEndpointHook, EndpointHook};

#[doc(inline)]
pub use modules::{HandlerCatalog, ModuleError, ModuleLoader};

#[doc(inline)]
pub use pipeline::{MessageHandler, Pipeline, PipelineHandle, PipelineStarter};

#[doc(inline)]
pub use recoverability::ErrorHandleResult;

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
