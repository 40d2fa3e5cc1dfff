//! Per-invocation contexts.
//!
//! - [`ExecutionContext`]: what the function host knows about the current
//!   invocation (application directory, logger)
//! - [`ProcessingContext`]: one message travelling through the pipeline
//! - [`FailureRecord`]: a failed dispatch handed to recoverability

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    path::{Path, PathBuf},
};

use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, Headers};

/// Ambient information about the current function invocation.
///
/// Supplied fresh by the host on every call and only read by the endpoint.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    function_app_directory: PathBuf,
    function_name: String,
    invocation_id: String,
    logger: Option<tracing::Dispatch>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(function_app_directory: impl Into<PathBuf>) -> Self {
        Self {
            function_app_directory: function_app_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn with_invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = id.into();
        self
    }

    /// Route this invocation's log output to `logger` instead of the global
    /// subscriber. See [`crate::logging::invocation_dispatch`].
    pub fn with_logger(mut self, logger: tracing::Dispatch) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Cancelled by the host when this invocation is abandoned. Only the
    /// dispatch started with this context observes it.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn function_app_directory(&self) -> &Path {
        &self.function_app_directory
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn logger(&self) -> Option<&tracing::Dispatch> {
        self.logger.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Type-keyed property bag carried by a [`ProcessingContext`].
///
/// Values are looked up by their Rust type, so collaborators agree on a key by
/// sharing a type rather than a string.
#[derive(Default)]
pub struct ContextBag {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ContextBag {
    /// Store `value`, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBag")
            .field("len", &self.values.len())
            .finish()
    }
}

/// One message being pushed through the pipeline.
///
/// Owned by a single dispatch. The cancellation token is created fresh for
/// every context, so cancelling one invocation never reaches another.
#[derive(Debug)]
pub struct ProcessingContext {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub cancellation: CancellationToken,
    pub extensions: ContextBag,
}

impl From<Envelope> for ProcessingContext {
    fn from(envelope: Envelope) -> Self {
        Self {
            message_id: envelope.id,
            headers: envelope.headers,
            body: envelope.body,
            cancellation: CancellationToken::new(),
            extensions: ContextBag::default(),
        }
    }
}

/// A failed dispatch, handed to the pipeline's error entry point.
///
/// `delivery_count` is the host's count of delivery attempts for this message,
/// including the current one.
#[derive(Debug)]
pub struct FailureRecord {
    error: tower::BoxError,
    pub headers: Headers,
    pub message_id: String,
    pub body: Vec<u8>,
    pub delivery_count: u32,
}

impl FailureRecord {
    pub fn new(
        error: tower::BoxError,
        headers: Headers,
        message_id: String,
        body: Vec<u8>,
        delivery_count: u32,
    ) -> Self {
        Self {
            error,
            headers,
            message_id,
            body,
            delivery_count,
        }
    }

    pub fn error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.error.as_ref()
    }

    /// Give back the original error, untouched.
    pub fn into_error(self) -> tower::BoxError {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TenantId(&'static str);

    #[test]
    fn context_bag_is_keyed_by_type() {
        let mut bag = ContextBag::default();
        assert!(bag.is_empty());

        assert_eq!(bag.insert(TenantId("acme")), None);
        assert_eq!(bag.insert(7u32), None);
        assert_eq!(bag.get::<TenantId>(), Some(&TenantId("acme")));
        assert_eq!(bag.get::<u32>(), Some(&7));
        assert_eq!(bag.get::<u64>(), None);

        *bag.get_mut::<u32>().unwrap() += 1;
        assert_eq!(bag.insert(TenantId("globex")), Some(TenantId("acme")));
        assert_eq!(bag.remove::<u32>(), Some(8));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn each_processing_context_gets_its_own_cancellation() {
        let first = ProcessingContext::from(Envelope::new("a", Headers::new(), Vec::new()));
        let second = ProcessingContext::from(Envelope::new("b", Headers::new(), Vec::new()));

        first.cancellation.cancel();

        assert!(first.cancellation.is_cancelled());
        assert!(!second.cancellation.is_cancelled());
        assert!(second.extensions.is_empty());
    }

    #[test]
    fn failure_record_returns_the_original_error() {
        let error: tower::BoxError = "handler exploded".into();
        let record = FailureRecord::new(error, Headers::new(), "id".to_owned(), Vec::new(), 3);

        assert_eq!(record.error().to_string(), "handler exploded");
        assert_eq!(record.into_error().to_string(), "handler exploded");
    }
}
