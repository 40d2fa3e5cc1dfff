//! Recoverability: what happens to a message whose processing failed.
//!
//! The endpoint never retries on its own. A failure is either
//! [`Handled`](ErrorHandleResult::Handled), meaning the message has been dealt
//! with (typically moved to the error queue) and the host may delete it, or
//! [`NotHandled`](ErrorHandleResult::NotHandled), meaning the host must keep
//! the message and deliver it again later.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    context::FailureRecord,
    envelope::{Envelope, headers},
    transport::OutgoingMessage,
};

/// Result of pushing a failed message through the pipeline's error entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorHandleResult {
    Handled,
    NotHandled,
}

/// Action decided for a failed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoverabilityAction {
    /// Leave the message to the host's redelivery.
    ImmediateRetry,
    /// Forward the message to `queue` and consider it handled.
    MoveToError { queue: String },
}

/// Classifies failures.
pub trait RecoverabilityPolicy: Send + Sync {
    fn decide(&self, failure: &FailureRecord) -> RecoverabilityAction;
}

/// Recoverability settings of an endpoint.
///
/// Delayed retries are not supported: a message that exhausts its immediate
/// retries goes straight to the error queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverabilitySettings {
    /// Redeliveries allowed before a message is moved to the error queue.
    pub immediate_retries: u32,
}

impl Default for RecoverabilitySettings {
    fn default() -> Self {
        Self {
            immediate_retries: 4,
        }
    }
}

/// Retries through host redelivery, then moves the message to the error queue.
///
/// A message is retried while its delivery count is at most
/// `immediate_retries`, so it is processed `immediate_retries + 1` times in
/// total.
#[derive(Clone, Debug)]
pub struct DefaultRecoverabilityPolicy {
    immediate_retries: u32,
    error_queue: String,
}

impl DefaultRecoverabilityPolicy {
    pub fn new(immediate_retries: u32, error_queue: impl Into<String>) -> Self {
        Self {
            immediate_retries,
            error_queue: error_queue.into(),
        }
    }
}

impl RecoverabilityPolicy for DefaultRecoverabilityPolicy {
    fn decide(&self, failure: &FailureRecord) -> RecoverabilityAction {
        if failure.delivery_count <= self.immediate_retries {
            RecoverabilityAction::ImmediateRetry
        } else {
            RecoverabilityAction::MoveToError {
                queue: self.error_queue.clone(),
            }
        }
    }
}

/// Build the message forwarded to the error queue.
///
/// The original headers are kept and failure details added to them.
pub fn failed_message(
    failure: &FailureRecord,
    endpoint_name: &str,
    error_queue: &str,
) -> OutgoingMessage {
    let mut headers = failure.headers.clone();
    headers.insert(headers::FAILED_QUEUE.to_owned(), endpoint_name.to_owned());
    headers.insert(
        headers::PROCESSING_ENDPOINT.to_owned(),
        endpoint_name.to_owned(),
    );
    headers.insert(
        headers::EXCEPTION_MESSAGE.to_owned(),
        failure.error().to_string(),
    );
    headers.insert(
        headers::TIME_OF_FAILURE.to_owned(),
        Utc::now().format("%Y-%m-%d %H:%M:%S:%6f Z").to_string(),
    );

    let mut causes = Vec::new();
    let mut source = failure.error().source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    if !causes.is_empty() {
        headers.insert(headers::EXCEPTION_SOURCE.to_owned(), causes.join(": "));
    }

    OutgoingMessage {
        destination: error_queue.to_owned(),
        envelope: Envelope::new(failure.message_id.clone(), headers, failure.body.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Headers;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("could not reach payment provider")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    fn failure(delivery_count: u32) -> FailureRecord {
        FailureRecord::new(
            Box::new(Outer(std::io::Error::other("connection reset"))),
            Headers::from([("origin".to_owned(), "web".to_owned())]),
            "msg-1".to_owned(),
            b"{}".to_vec(),
            delivery_count,
        )
    }

    #[test]
    fn default_settings_allow_four_immediate_retries() {
        let settings = RecoverabilitySettings::default();
        let policy = DefaultRecoverabilityPolicy::new(settings.immediate_retries, "error");

        for attempt in 1..=4 {
            assert_eq!(policy.decide(&failure(attempt)), RecoverabilityAction::ImmediateRetry);
        }
        assert_eq!(
            policy.decide(&failure(5)),
            RecoverabilityAction::MoveToError {
                queue: "error".to_owned()
            }
        );
    }

    #[test]
    fn zero_retries_moves_on_first_failure() {
        let policy = DefaultRecoverabilityPolicy::new(0, "poison");

        assert_eq!(
            policy.decide(&failure(1)),
            RecoverabilityAction::MoveToError {
                queue: "poison".to_owned()
            }
        );
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: RecoverabilitySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.immediate_retries, 4);

        let settings: RecoverabilitySettings =
            serde_json::from_str(r#"{"immediate_retries":1}"#).unwrap();
        assert_eq!(settings.immediate_retries, 1);
    }

    #[test]
    fn failed_message_carries_failure_details() {
        let message = failed_message(&failure(5), "sales", "error");
        let headers = &message.envelope.headers;

        assert_eq!(message.destination, "error");
        assert_eq!(message.envelope.id, "msg-1");
        assert_eq!(message.envelope.body, b"{}");
        assert_eq!(headers["origin"], "web");
        assert_eq!(headers[headers::FAILED_QUEUE], "sales");
        assert_eq!(
            headers[headers::EXCEPTION_MESSAGE],
            "could not reach payment provider"
        );
        assert_eq!(headers[headers::EXCEPTION_SOURCE], "connection reset");
        assert!(headers[headers::TIME_OF_FAILURE].ends_with(" Z"));
    }
}
