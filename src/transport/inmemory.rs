use std::{marker::PhantomData, sync::Arc};

use tokio::sync::Mutex;

use crate::transport::Sender;

/// In-memory sender for testing or local runs.
///
/// This sender stores requests in a shared queue. It is useful for:
/// - Unit and integration testing
/// - Running an endpoint locally without a real error queue
/// - Debugging message flows
///
/// Clones share the same queue.
pub struct InMemory<R> {
    /// Shared message queue
    msg_queue: Arc<Mutex<Vec<R>>>,
    _request_marker: PhantomData<R>,
}

impl<R> InMemory<R> {
    /// Return all requests that have been "sent" and clear the internal queue.
    ///
    /// Primarily intended for tests.
    pub async fn sent_messages(self) -> Vec<R> {
        let mut queue = self.msg_queue.lock_owned().await;
        std::mem::take(&mut *queue)
    }
}

impl<R> Clone for InMemory<R> {
    fn clone(&self) -> Self {
        Self {
            msg_queue: Arc::clone(&self.msg_queue),
            _request_marker: self._request_marker,
        }
    }
}

impl<R> Default for InMemory<R> {
    /// Create a new empty in-memory sender.
    fn default() -> Self {
        Self {
            msg_queue: Arc::new(Mutex::new(Vec::new())),
            _request_marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<R> Sender<R> for InMemory<R>
where
    R: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    /// "Send" a request by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, request: R) -> Result<(), Self::Error> {
        tracing::info!(?request, "Message sent to in-memory queue");
        self.msg_queue.lock().await.push(request);
        Ok(())
    }
}
