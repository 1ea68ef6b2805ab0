//! Subscription handler seam: the application's subscribe/unsubscribe API.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::types::{BoxError, Operation};

/// Subscribe/unsubscribe one params value at a time.
#[async_trait]
pub trait SubscriptionHandler<P>: Send + Sync {
    async fn subscribe(&self, connection_id: &str, params: &P) -> Result<(), BoxError>;
    async fn unsubscribe(&self, connection_id: &str, params: &P) -> Result<(), BoxError>;
}

/// Subscribe/unsubscribe many params values in a single call.
#[async_trait]
pub trait BatchSubscriptionHandler<P>: Send + Sync {
    async fn subscribe_batch(&self, connection_id: &str, params: &[P]) -> Result<(), BoxError>;
    async fn unsubscribe_batch(&self, connection_id: &str, params: &[P]) -> Result<(), BoxError>;
}

/// Optional capability: extend the server-side session of a connection.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh_session(&self, connection_id: &str) -> Result<(), BoxError>;
}

/// The application's handler, with its batch capability resolved up front.
pub enum Handler<P> {
    Batched(Arc<dyn BatchSubscriptionHandler<P>>),
    PerItem(Arc<dyn SubscriptionHandler<P>>),
}

impl<P> Clone for Handler<P> {
    fn clone(&self) -> Self {
        match self {
            Handler::Batched(h) => Handler::Batched(Arc::clone(h)),
            Handler::PerItem(h) => Handler::PerItem(Arc::clone(h)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Subscribe,
    Unsubscribe,
}

impl<P: Sync + 'static> Handler<P> {
    pub fn batched(handler: impl BatchSubscriptionHandler<P> + 'static) -> Self {
        Handler::Batched(Arc::new(handler))
    }

    pub fn per_item(handler: impl SubscriptionHandler<P> + 'static) -> Self {
        Handler::PerItem(Arc::new(handler))
    }

    /// Operation name errors from [`apply`](Handler::apply) are reported under.
    pub(crate) fn operation(&self, direction: Direction) -> Operation {
        match (self, direction) {
            (Handler::Batched(_), Direction::Subscribe) => Operation::SubscribeBatch,
            (Handler::Batched(_), Direction::Unsubscribe) => Operation::UnsubscribeBatch,
            (Handler::PerItem(_), Direction::Subscribe) => Operation::Subscribe,
            (Handler::PerItem(_), Direction::Unsubscribe) => Operation::Unsubscribe,
        }
    }

    /// Issue one network round for `params`: a single batch call, or one call
    /// per value. Every per-value call runs to completion; the first failure in
    /// params order is returned.
    pub(crate) async fn apply(
        &self,
        direction: Direction,
        connection_id: &str,
        params: &[P],
    ) -> Result<(), BoxError> {
        match self {
            Handler::Batched(h) => match direction {
                Direction::Subscribe => h.subscribe_batch(connection_id, params).await,
                Direction::Unsubscribe => h.unsubscribe_batch(connection_id, params).await,
            },
            Handler::PerItem(h) => {
                let calls = params.iter().map(|p| async move {
                    match direction {
                        Direction::Subscribe => h.subscribe(connection_id, p).await,
                        Direction::Unsubscribe => h.unsubscribe(connection_id, p).await,
                    }
                });
                join_all(calls).await.into_iter().collect()
            }
        }
    }
}
