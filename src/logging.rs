//! Log subscriber setup.
//!
//! Hosts either install one process-wide subscriber with [`try_init_global`],
//! or hand each invocation its own [`tracing::Dispatch`] through
//! [`ExecutionContext::with_logger`](crate::context::ExecutionContext::with_logger)
//! so that invocation's output lands in the host's per-invocation log.

use tracing::{Dispatch, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt::MakeWriter, prelude::*, util::TryInitError};

/// Build a dispatch writing formatted events to `writer`.
///
/// Directives in `RUST_LOG` take precedence over `default_level`. Span traces
/// are captured, so errors raised under this dispatch carry their context.
pub fn invocation_dispatch<W>(writer: W, default_level: LevelFilter) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(ErrorLayer::default());
    Dispatch::new(subscriber)
}

/// Install the process-wide subscriber, filtered by `RUST_LOG`.
///
/// Fails if a global subscriber is already set.
pub fn try_init_global() -> Result<(), TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .try_init()
}
