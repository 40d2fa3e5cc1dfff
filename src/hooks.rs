//! Lifecycle hooks for the function endpoint.

use crate::context::{FailureRecord, ProcessingContext};

/// Hook trait for observing endpoint dispatch events.
///
/// Hooks are invoked synchronously on the dispatch path and should avoid
/// heavy or blocking work. Typical use cases include logging and metrics.
pub trait EndpointHook: Send + Sync {
    fn on_pipeline_started(&self, endpoint_name: &str);
    fn on_message_received(&self, context: &ProcessingContext);
    fn on_message_processed(&self, message_id: &str);
    /// Processing failed and recoverability took care of the message.
    fn on_failure_handled(&self, failure: &FailureRecord);
    /// Processing failed and the error is handed back to the host.
    fn on_failure_not_handled(&self, failure: &FailureRecord);
    fn on_decode_error(&self, error: &dyn std::error::Error);
}

/// Default endpoint hook implementation.
///
/// Logs dispatch events using `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultEndpointHook;

impl EndpointHook for DefaultEndpointHook {
    fn on_pipeline_started(&self, endpoint_name: &str) {
        tracing::info!(endpoint_name, "Pipeline started");
    }

    fn on_message_received(&self, context: &ProcessingContext) {
        tracing::debug!(message_id = %context.message_id, "Message received");
    }

    fn on_message_processed(&self, message_id: &str) {
        tracing::info!(message_id, "Message processed successfully");
    }

    fn on_failure_handled(&self, failure: &FailureRecord) {
        tracing::warn!(
            message_id = %failure.message_id,
            error = %failure.error(),
            "Message processing failed, handled by recoverability"
        );
    }

    fn on_failure_not_handled(&self, failure: &FailureRecord) {
        tracing::error!(
            message_id = %failure.message_id,
            delivery_count = failure.delivery_count,
            error = %failure.error(),
            "Message processing failed, returning error to the host"
        );
    }

    fn on_decode_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to decode queue message");
    }
}
