use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use futures::Stream;
use riptide_sync_types::QueryId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    base_client::{
        FunctionResult,
        QueryResults,
        SubscriberId,
    },
    client::worker::{
        ClientRequest,
        UnsubscribeRequest,
    },
};

/// An active subscription to a single query.
///
/// Implements [`Stream`]: a new [`FunctionResult`] appears each time the
/// query's value changes. Dropping the subscription unsubscribes.
pub struct QuerySubscription {
    pub(crate) subscriber_id: SubscriberId,
    pub(crate) request_sender: mpsc::UnboundedSender<ClientRequest>,
    pub(crate) watch: BroadcastStream<QueryResults>,
    /// The query's value at subscribe time, yielded before any updates so a
    /// late subscriber to a shared query sees the current state immediately.
    pub(crate) initial: Option<FunctionResult>,
}

impl QuerySubscription {
    pub fn id(&self) -> SubscriberId {
        self.subscriber_id
    }

    pub fn query_id(&self) -> QueryId {
        self.subscriber_id.query_id()
    }
}

impl AsRef<SubscriberId> for QuerySubscription {
    fn as_ref(&self) -> &SubscriberId {
        &self.subscriber_id
    }
}

impl Stream for QuerySubscription {
    type Item = FunctionResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            return Poll::Ready(Some(initial));
        }
        loop {
            match Pin::new(&mut this.watch).poll_next(cx) {
                Poll::Ready(Some(Ok(results))) => {
                    if !results.changed(&this.subscriber_id) {
                        continue;
                    }
                    match results.get(&this.subscriber_id) {
                        Some(result) => return Poll::Ready(Some(result.clone())),
                        // Changed back to "loading"; nothing to yield.
                        None => continue,
                    }
                },
                // Lagged behind the broadcast; the next item is the latest
                // consistent view, which is all we need.
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        // The worker may already be gone on client shutdown.
        let _ = self
            .request_sender
            .send(ClientRequest::Unsubscribe(UnsubscribeRequest {
                subscriber_id: self.subscriber_id,
            }));
    }
}

/// A consistent view of the results of every query in the subscription set.
///
/// Implements [`Stream`]<[`QueryResults`]>; each item reflects one applied
/// transition or optimistic update.
pub struct QuerySetSubscription {
    watch: BroadcastStream<QueryResults>,
}

impl QuerySetSubscription {
    pub(crate) fn new(watch: BroadcastStream<QueryResults>) -> Self {
        Self { watch }
    }
}

impl Stream for QuerySetSubscription {
    type Item = QueryResults;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.watch).poll_next(cx) {
                Poll::Ready(Some(Ok(results))) => return Poll::Ready(Some(results)),
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
