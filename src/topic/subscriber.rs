//! Subscriber mailboxes
//!
//! A subscriber is split in two: the [`Subscriber`] owned by the topic actor
//! (tag + sending half of the mailbox) and the [`SubscriberHandle`] owned by
//! the connection (receiving half + the right to deregister).

use super::Topic;
use crate::types::{Event, SubscriberId};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// Outcome of a single mailbox delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Queued into the mailbox
    Delivered,
    /// Mailbox full; the event was skipped for this subscriber
    Dropped,
    /// The consumer is gone (handle dropped or mailbox already closed)
    Gone,
}

/// Actor-side half of a subscriber
pub(crate) struct Subscriber {
    id: SubscriberId,
    tag: String,
    sender: Option<mpsc::Sender<Arc<Event>>>,
}

impl Subscriber {
    /// Create a subscriber and the receiving half of its mailbox
    pub(crate) fn new(
        id: SubscriberId,
        tag: String,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Event>>) {
        let (sender, inbox) = mpsc::channel(capacity);
        let subscriber = Self {
            id,
            tag,
            sender: Some(sender),
        };
        (subscriber, inbox)
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue an event without waiting for mailbox space
    pub(crate) fn deliver(&self, topic: &str, event: &Arc<Event>) -> Delivery {
        let Some(sender) = &self.sender else {
            return Delivery::Gone;
        };

        match sender.try_send(Arc::clone(event)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    topic = %topic,
                    subscriber = %self.id,
                    tag = %self.tag,
                    "Subscriber mailbox full, event dropped"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Close the mailbox; returns false if it was already closed
    pub(crate) fn close(&mut self) -> bool {
        self.sender.take().is_some()
    }
}

/// Connection-side half of a subscriber
///
/// Yields the events routed to this subscriber until the mailbox closes,
/// which happens when the subscriber is deregistered, evicted by a newer
/// registration under the same tag, or when the topic shuts down.
///
/// Dropping the handle without calling [`deregister`](Self::deregister)
/// queues a best-effort deregistration.
pub struct SubscriberHandle {
    id: SubscriberId,
    tag: String,
    topic: Topic,
    inbox: ReceiverStream<Arc<Event>>,
    released: bool,
}

impl SubscriberHandle {
    pub(crate) fn new(
        topic: Topic,
        id: SubscriberId,
        tag: String,
        inbox: mpsc::Receiver<Arc<Event>>,
    ) -> Self {
        Self {
            id,
            tag,
            topic,
            inbox: ReceiverStream::new(inbox),
            released: false,
        }
    }

    /// Identifier assigned by the topic
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Tag this subscriber registered under (empty for anonymous)
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Id of the topic this subscriber belongs to
    pub fn topic_id(&self) -> &str {
        self.topic.id()
    }

    /// Receive the next event, or `None` once the mailbox is closed
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.inbox.next().await
    }

    /// Remove this subscriber from its topic and close the mailbox
    ///
    /// A no-op if the subscriber was already evicted or the topic closed.
    pub async fn deregister(mut self) {
        self.released = true;
        self.topic.remove_subscriber(self.id).await;
    }
}

impl Stream for SubscriberHandle {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inbox).poll_next(cx)
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if !self.released {
            self.topic.forget_subscriber(self.id);
        }
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("topic", &self.topic.id())
            .finish()
    }
}
