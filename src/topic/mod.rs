//! Per-topic broadcast engine
//!
//! A [`Topic`] is a cheap, cloneable handle to a single-task actor that owns
//! the topic's subscribers. Register, deregister and publish are commands
//! sent over a bounded channel and applied one at a time in arrival order,
//! which gives every topic a total event order without a lock around the
//! subscriber map.
//!
//! Shutdown is a one-way `watch` signal. Every command send races that
//! signal, so callers never block on a topic that is closing.

mod actor;
mod subscriber;

pub use subscriber::SubscriberHandle;

use crate::config::TopicConfig;
use crate::error::{Result, SseError};
use crate::types::{Event, SubscriberId, TopicInfo};
use actor::TopicActor;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Distinguishes topic instances that reuse the same id
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

pub(crate) enum Command {
    Register {
        tag: String,
        reply: oneshot::Sender<Registration>,
    },
    Deregister {
        id: SubscriberId,
        reply: Option<oneshot::Sender<()>>,
    },
    Publish {
        event: Arc<Event>,
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) struct Registration {
    id: SubscriberId,
    inbox: mpsc::Receiver<Arc<Event>>,
}

/// Report sent to the registry when a topic's last subscriber leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IdleTopic {
    pub(crate) id: String,
    pub(crate) generation: u64,
}

/// State shared between the handles and the actor
struct TopicShared {
    id: String,
    generation: u64,

    /// Set once shutdown has been requested (or the actor is gone)
    closed: watch::Sender<bool>,

    /// Set once the actor has closed every mailbox and exited
    stopped: watch::Sender<bool>,

    /// Subscriber count published by the actor after each mutation
    subscribers: AtomicUsize,
}

/// Resolve once `signal` is true or its sender is gone
async fn signalled(mut signal: watch::Receiver<bool>) {
    loop {
        let fired = *signal.borrow_and_update();
        if fired || signal.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a topic actor
///
/// Clones address the same actor. The actor stops when [`shutdown`](Self::shutdown)
/// is called or when every `Topic` and [`SubscriberHandle`] for it is dropped.
#[derive(Clone)]
pub struct Topic {
    shared: Arc<TopicShared>,
    commands: mpsc::Sender<Command>,
}

impl Topic {
    /// Start a topic actor on the current tokio runtime
    ///
    /// Fails with [`SseError::Config`] if `config` has a zero capacity.
    pub fn spawn(id: impl Into<String>, config: &TopicConfig) -> Result<Self> {
        Self::spawn_with_idle(id.into(), config, None)
    }

    pub(crate) fn spawn_with_idle(
        id: String,
        config: &TopicConfig,
        idle: Option<mpsc::UnboundedSender<IdleTopic>>,
    ) -> Result<Self> {
        config.validate()?;

        let (closed, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);
        let shared = Arc::new(TopicShared {
            id,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            closed,
            stopped,
            subscribers: AtomicUsize::new(0),
        });

        let (commands, receiver) = mpsc::channel(config.command_capacity);
        let actor = TopicActor::new(shared.clone(), receiver, config.mailbox_capacity, idle);
        tokio::spawn(actor.run());

        Ok(Self { shared, commands })
    }

    /// Topic identifier
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Whether shutdown has been requested
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Number of subscribers as of the last command the actor processed
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::Acquire)
    }

    /// Whether a registry may drop this topic: closed, or without subscribers
    pub fn is_removable(&self) -> bool {
        self.is_closed() || self.subscriber_count() == 0
    }

    /// Snapshot of the topic's status
    pub fn info(&self) -> TopicInfo {
        TopicInfo {
            id: self.shared.id.clone(),
            subscribers: self.subscriber_count(),
            closed: self.is_closed(),
        }
    }

    /// Register a subscriber under `tag`
    ///
    /// A non-empty tag evicts the subscriber currently holding it: that
    /// subscriber's mailbox is closed before this registration becomes
    /// visible to publishers. Empty tags never evict anyone.
    pub async fn register(&self, tag: impl Into<String>) -> Result<SubscriberHandle> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let tag = tag.into();
        let (reply, response) = oneshot::channel();
        let command = Command::Register {
            tag: tag.clone(),
            reply,
        };
        if !self.dispatch(command).await {
            return Err(self.closed_error());
        }

        let registration = response.await.map_err(|_| self.closed_error())?;
        Ok(SubscriberHandle::new(
            self.clone(),
            registration.id,
            tag,
            registration.inbox,
        ))
    }

    /// Deregister a subscriber and close its mailbox
    ///
    /// Equivalent to [`SubscriberHandle::deregister`].
    pub async fn deregister(&self, subscriber: SubscriberHandle) {
        subscriber.deregister().await;
    }

    /// Publish an event, returning how many mailboxes it was queued into
    ///
    /// Broadcast events go to every subscriber, tagged events only to the
    /// holder of the tag. An unmatched tag is not an error. A publish that
    /// races shutdown completes as a no-op.
    pub async fn publish(&self, event: impl Into<Arc<Event>>) -> Result<usize> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (reply, delivered) = oneshot::channel();
        let command = Command::Publish {
            event: event.into(),
            reply,
        };
        if !self.dispatch(command).await {
            return Ok(0);
        }

        Ok(delivered.await.unwrap_or(0))
    }

    /// Close every mailbox and stop the actor
    ///
    /// Idempotent and safe to call concurrently; returns once the actor has
    /// stopped.
    pub async fn shutdown(&self) {
        if !self.shared.closed.send_replace(true) {
            tracing::debug!(topic = %self.shared.id, "Topic shutdown requested");
        }
        signalled(self.shared.stopped.subscribe()).await;
    }

    pub(crate) async fn remove_subscriber(&self, id: SubscriberId) {
        let (reply, done) = oneshot::channel();
        let command = Command::Deregister {
            id,
            reply: Some(reply),
        };
        if self.dispatch(command).await {
            let _ = done.await;
        }
    }

    /// Non-blocking deregistration for handles dropped without `deregister`
    ///
    /// If the queue is full the actor prunes the subscriber on its next
    /// delivery instead.
    pub(crate) fn forget_subscriber(&self, id: SubscriberId) {
        if self.is_closed() {
            return;
        }
        let _ = self
            .commands
            .try_send(Command::Deregister { id, reply: None });
    }

    /// Queue a command unless the topic closes first
    async fn dispatch(&self, command: Command) -> bool {
        tokio::select! {
            biased;
            _ = signalled(self.shared.closed.subscribe()) => false,
            sent = self.commands.send(command) => sent.is_ok(),
        }
    }

    fn closed_error(&self) -> SseError {
        SseError::Closed(self.shared.id.clone())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.shared.id)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn(id: &str) -> Topic {
        Topic::spawn(id, &TopicConfig::default()).unwrap()
    }

    async fn next_data(subscriber: &mut SubscriberHandle) -> Option<String> {
        timeout(WAIT, subscriber.recv())
            .await
            .expect("timed out waiting for event")
            .map(|event| event.data.clone())
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_config() {
        let config = TopicConfig {
            mailbox_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            Topic::spawn("t", &config),
            Err(SseError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let topic = spawn("t");
        let mut anonymous = topic.register("").await.unwrap();
        let mut tagged = topic.register("a").await.unwrap();

        assert_eq!(topic.publish(Event::new("x")).await.unwrap(), 2);
        assert_eq!(next_data(&mut anonymous).await.as_deref(), Some("x"));
        assert_eq!(next_data(&mut tagged).await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_tagged_publish_reaches_only_holder() {
        let topic = spawn("t");
        let mut anonymous = topic.register("").await.unwrap();
        let mut tagged = topic.register("a").await.unwrap();

        assert_eq!(topic.publish(Event::new("y").with_tag("a")).await.unwrap(), 1);
        assert_eq!(next_data(&mut tagged).await.as_deref(), Some("y"));

        topic.publish(Event::new("z")).await.unwrap();
        assert_eq!(next_data(&mut anonymous).await.as_deref(), Some("z"));
    }

    #[tokio::test]
    async fn test_unmatched_tag_is_dropped_silently() {
        let topic = spawn("t");
        let mut subscriber = topic.register("a").await.unwrap();

        assert_eq!(topic.publish(Event::new("lost").with_tag("b")).await.unwrap(), 0);
        topic.publish(Event::new("kept")).await.unwrap();
        assert_eq!(next_data(&mut subscriber).await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_same_tag_evicts_previous_holder() {
        let topic = spawn("t");
        let mut first = topic.register("a").await.unwrap();
        let mut second = topic.register("a").await.unwrap();

        assert_eq!(next_data(&mut first).await, None);
        assert_eq!(topic.subscriber_count(), 1);

        assert_eq!(topic.publish(Event::new("y").with_tag("a")).await.unwrap(), 1);
        assert_eq!(next_data(&mut second).await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_empty_tags_coexist() {
        let topic = spawn("t");
        let _one = topic.register("").await.unwrap();
        let _two = topic.register("").await.unwrap();
        let _three = topic.register("").await.unwrap();

        assert_eq!(topic.subscriber_count(), 3);
        assert_eq!(topic.publish(Event::new("x")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let topic = spawn("t");
        let mut early = topic.register("").await.unwrap();
        topic.publish(Event::new("before")).await.unwrap();

        let mut late = topic.register("").await.unwrap();
        topic.publish(Event::new("after")).await.unwrap();

        assert_eq!(next_data(&mut early).await.as_deref(), Some("before"));
        assert_eq!(next_data(&mut early).await.as_deref(), Some("after"));
        assert_eq!(next_data(&mut late).await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let topic = spawn("t");
        let mut subscriber = topic.register("").await.unwrap();

        for i in 0..50 {
            topic.publish(Event::new(i.to_string())).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(next_data(&mut subscriber).await, Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_deregister_closes_mailbox_and_is_idempotent() {
        let topic = spawn("t");
        let subscriber = topic.register("a").await.unwrap();
        let id = subscriber.id();
        assert_eq!(topic.subscriber_count(), 1);

        topic.deregister(subscriber).await;
        assert_eq!(topic.subscriber_count(), 0);
        assert!(topic.is_removable());

        // Second removal of the same id is a no-op
        topic.remove_subscriber(id).await;
        assert_eq!(topic.publish(Event::new("x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deregister_after_eviction_keeps_new_holder() {
        let topic = spawn("t");
        let evicted = topic.register("a").await.unwrap();
        let mut holder = topic.register("a").await.unwrap();

        evicted.deregister().await;
        assert_eq!(topic.subscriber_count(), 1);

        topic.publish(Event::new("y").with_tag("a")).await.unwrap();
        assert_eq!(next_data(&mut holder).await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_dropped_handle_is_removed() {
        let topic = spawn("t");
        let subscriber = topic.register("").await.unwrap();
        drop(subscriber);

        // Processed after the queued deregistration
        assert_eq!(topic.publish(Event::new("x")).await.unwrap(), 0);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_stall_siblings() {
        let config = TopicConfig {
            mailbox_capacity: 1,
            ..Default::default()
        };
        let topic = Topic::spawn("t", &config).unwrap();
        let _slow = topic.register("slow").await.unwrap();
        let mut fast = topic.register("fast").await.unwrap();

        assert_eq!(topic.publish(Event::new("1")).await.unwrap(), 2);
        assert_eq!(next_data(&mut fast).await.as_deref(), Some("1"));

        // slow's mailbox is full; fast still receives
        assert_eq!(topic.publish(Event::new("2")).await.unwrap(), 1);
        assert_eq!(next_data(&mut fast).await.as_deref(), Some("2"));
        assert_eq!(topic.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_mailboxes() {
        let topic = spawn("t");
        let mut one = topic.register("").await.unwrap();
        let mut two = topic.register("b").await.unwrap();

        timeout(WAIT, topic.shutdown()).await.unwrap();

        assert!(topic.is_closed());
        assert!(topic.is_removable());
        assert_eq!(topic.subscriber_count(), 0);
        assert_eq!(next_data(&mut one).await, None);
        assert_eq!(next_data(&mut two).await, None);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_concurrent() {
        let topic = spawn("t");
        let mut subscriber = topic.register("").await.unwrap();

        let (a, b) = (topic.clone(), topic.clone());
        timeout(WAIT, async { tokio::join!(a.shutdown(), b.shutdown()) })
            .await
            .unwrap();
        timeout(WAIT, topic.shutdown()).await.unwrap();

        assert_eq!(next_data(&mut subscriber).await, None);
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail_fast() {
        let topic = spawn("t");
        let subscriber = topic.register("").await.unwrap();
        topic.shutdown().await;

        let registered = timeout(WAIT, topic.register("a")).await.unwrap();
        assert!(matches!(registered, Err(SseError::Closed(id)) if id == "t"));

        let published = timeout(WAIT, topic.publish(Event::new("x"))).await.unwrap();
        assert!(matches!(published, Err(SseError::Closed(_))));

        // Deregistering against a closed topic completes as a no-op
        timeout(WAIT, subscriber.deregister()).await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_stops_when_all_handles_dropped() {
        let topic = spawn("t");
        let mut stopped = topic.shared.stopped.subscribe();
        drop(topic);

        timeout(WAIT, stopped.wait_for(|stopped| *stopped))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_tags_unique() {
        let topic = spawn("t");

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let topic = topic.clone();
            tasks.push(tokio::spawn(async move { topic.register("shared").await }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(topic.subscriber_count(), 1);
        assert_eq!(topic.publish(Event::new("x").with_tag("shared")).await.unwrap(), 1);

        let mut open = 0;
        for handle in &mut handles {
            if timeout(WAIT, handle.recv()).await.unwrap().is_some() {
                open += 1;
            }
        }
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn test_deregister_racing_replacement() {
        let topic = spawn("t");
        for _ in 0..20 {
            let old = topic.register("a").await.unwrap();
            let racer = topic.clone();
            let (_, new) = tokio::join!(old.deregister(), racer.register("a"));
            let new = new.unwrap();

            assert_eq!(topic.subscriber_count(), 1);
            drop(new);
        }
    }

    #[tokio::test]
    async fn test_shutdown_racing_publishers() {
        let topic = spawn("t");
        let mut subscriber = topic.register("").await.unwrap();

        let publisher = topic.clone();
        let publishing = tokio::spawn(async move {
            let mut accepted = 0;
            for i in 0..1000 {
                match publisher.publish(Event::new(i.to_string())).await {
                    Ok(_) => accepted += 1,
                    Err(err) => {
                        assert!(err.is_closed());
                        break;
                    }
                }
            }
            accepted
        });

        tokio::task::yield_now().await;
        timeout(WAIT, topic.shutdown()).await.unwrap();
        timeout(WAIT, publishing).await.unwrap().unwrap();

        // Everything queued before the close is readable, then end-of-stream
        while timeout(WAIT, subscriber.recv()).await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn test_info() {
        let topic = spawn("orders");
        let _subscriber = topic.register("").await.unwrap();

        let info = topic.info();
        assert_eq!(info.id, "orders");
        assert_eq!(info.subscribers, 1);
        assert!(!info.closed);
        assert!(format!("{:?}", topic).contains("orders"));
    }
}
