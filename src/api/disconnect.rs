use crate::core::StreamCancelHandle;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response body wrapper that fires the caller's cancel handle when dropped.
///
/// Hyper drops the body as soon as the caller goes away, so this is how the
/// streaming bridge learns about a disconnect. A stream that finished normally
/// was marked completed first, which turns the cancel into a no-op.
pub struct DisconnectStream<S> {
    inner: S,
    caller: StreamCancelHandle,
}

impl<S> DisconnectStream<S> {
    pub fn new(inner: S, caller: StreamCancelHandle) -> Self {
        Self { inner, caller }
    }
}

impl<S> Stream for DisconnectStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if !self.caller.is_completed() {
            tracing::debug!(
                request_id = %crate::core::get_request_id(),
                "Response body dropped before completion"
            );
        }
        self.caller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_drop_cancels_unfinished_stream() {
        let handle = StreamCancelHandle::new();
        let stream = DisconnectStream::new(futures::stream::iter(vec![1, 2]), handle.clone());
        drop(stream);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_stream_is_not_cancelled() {
        let handle = StreamCancelHandle::new();
        let mut stream = DisconnectStream::new(futures::stream::iter(vec![1]), handle.clone());
        assert_eq!(stream.next().await, Some(1));
        handle.mark_completed();
        drop(stream);
        assert!(!handle.is_cancelled());
    }
}
