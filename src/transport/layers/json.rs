use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::{
    envelope,
    transport::{OutgoingMessage, RawMessage, RawPayload},
};

/// Tower `Service` wrapper that encodes outgoing envelopes into the JSON wire
/// format.
///
/// Converts an [`OutgoingMessage`] into a [`RawMessage`] carrying the encoded
/// bytes before passing it to the inner service, so the payload can be read
/// back with [`envelope::decode`] on the receiving side.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T> Service<OutgoingMessage> for JsonService<T>
where
    T: Service<RawMessage> + Clone + Send + 'static,
    <T as Service<RawMessage>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: OutgoingMessage) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = envelope::encode(&req.envelope).map_err(tower::BoxError::from)?;
            let message = RawMessage {
                destination: req.destination,
                payload: RawPayload(bytes),
            };

            inner.call(message).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}
