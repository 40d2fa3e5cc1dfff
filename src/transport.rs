//! Outgoing transport.
//!
//! The endpoint never receives through a transport (messages are pushed by
//! the host), but it does send: failed messages are forwarded to the error
//! queue. Sending is built on Tower's `Service` abstraction so that
//! middleware (encoding, retries, timeouts, tracing) can be layered on while
//! sender backends stay simple.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`MessageSender`]: Object-safe view of a transport, used by the pipeline
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::envelope::{CodecError, Envelope};

pub use inmemory::InMemory;

/// An envelope addressed to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub destination: String,
    pub envelope: Envelope,
}

/// A wire-encoded message addressed to a queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub destination: String,
    pub payload: RawPayload,
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending. It wraps an underlying
/// Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Send a request through the transport, waiting for the service to be
    /// ready first.
    pub async fn send<R>(&mut self, request: R) -> Result<(), TransportError>
    where
        S: Service<R> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let service = self.service.clone();
        service
            .oneshot(request)
            .await
            .map_err(|e| TransportError::from_service(e.into()))?;
        Ok(())
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_service(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh
        // clone in its place.
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_service(e.into()))?;
            Ok(())
        })
    }
}

/// Object-safe sending interface.
///
/// Implemented for every [`Transport`] able to send an [`OutgoingMessage`], so
/// that the pipeline can hold any transport stack as `Arc<dyn MessageSender>`.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn dispatch(&self, message: OutgoingMessage) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl<S> MessageSender for Transport<S>
where
    S: Service<OutgoingMessage> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    #[tracing::instrument(skip_all, fields(destination = %message.destination))]
    async fn dispatch(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let mut transport = self.clone();
        transport.send(message).await
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    fn from_service(err: tower::BoxError) -> Self {
        if err.is::<CodecError>() {
            Self::serde(err)
        } else {
            Self::sender(err)
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<R, D> Service<R> for SenderService<D>
where
    R: Send + 'static,
    D: Sender<R> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender delivers a request (usually a [`RawMessage`]) to an external
/// system, or to memory for tests.
#[async_trait::async_trait]
pub trait Sender<R> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send a request using the underlying backend.
    async fn send(&mut self, request: R) -> Result<(), Self::Error>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::envelope::Headers;

    #[derive(Clone)]
    struct Unreachable;

    #[async_trait::async_trait]
    impl Sender<RawMessage> for Unreachable {
        type Error = std::io::Error;

        async fn send(&mut self, _request: RawMessage) -> Result<(), Self::Error> {
            Err(std::io::Error::other("queue unavailable"))
        }
    }

    fn outgoing() -> OutgoingMessage {
        OutgoingMessage {
            destination: "error".to_owned(),
            envelope: Envelope::new("id", Headers::new(), b"x".to_vec()),
        }
    }

    #[tokio::test]
    async fn sender_errors_are_wrapped() {
        let transport = Transport::new(Unreachable).layer(layers::JsonLayer);

        let err = transport.dispatch(outgoing()).await.unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
        assert!(err.to_string().contains("queue unavailable"));
    }

    #[tokio::test]
    async fn transport_is_a_tower_service() {
        let sink: InMemory<RawMessage> = InMemory::default();
        let transport = Transport::new(sink.clone()).layer(layers::JsonLayer);

        transport.oneshot(outgoing()).await.unwrap();

        let sent = sink.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "error");
    }
}
