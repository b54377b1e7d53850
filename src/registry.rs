//! Topic registry
//!
//! `TopicRegistry` maps topic ids to running [`Topic`] actors. It creates
//! topics lazily, routes publishes by id and removes topics either
//! explicitly or, under [`RemovalPolicy::WhenEmpty`], as soon as their last
//! subscriber leaves.
//!
//! The map lock is only held for map access. Topic shutdown, which waits
//! for the actor to close every mailbox, always happens after the guard is
//! released.

use crate::config::{RegistryConfig, RemovalPolicy};
use crate::error::{Result, SseError};
use crate::topic::{IdleTopic, SubscriberHandle, Topic};
use crate::types::{Event, RegistryInfo};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};

/// Registry of topic actors keyed by topic id
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct TopicRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,

    /// Topic id → running actor
    topics: RwLock<HashMap<String, Topic>>,

    /// Idle reports from actors, present under `RemovalPolicy::WhenEmpty`
    idle: Option<mpsc::UnboundedSender<IdleTopic>>,
}

impl TopicRegistry {
    /// Create a registry
    ///
    /// Under `RemovalPolicy::WhenEmpty` this spawns the task that removes
    /// idle topics, so it must be called from within a tokio runtime.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;

        let (idle, reports) = match config.removal {
            RemovalPolicy::Explicit => (None, None),
            RemovalPolicy::WhenEmpty => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
        };

        let inner = Arc::new(RegistryInner {
            config,
            topics: RwLock::new(HashMap::new()),
            idle,
        });

        if let Some(reports) = reports {
            tokio::spawn(reap_idle_topics(Arc::downgrade(&inner), reports));
        }

        Ok(Self { inner })
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Get the live topic for `id`, starting a new actor if none is registered
    ///
    /// An entry whose actor has shut down (for example through a direct
    /// [`Topic::shutdown`]) is replaced by a fresh topic.
    pub async fn get_or_create(&self, id: &str) -> Result<Topic> {
        if let Some(topic) = self.lookup(id).await {
            return Ok(topic);
        }

        let mut topics = self.inner.topics.write().await;
        if let Some(topic) = topics.get(id).filter(|topic| !topic.is_closed()) {
            return Ok(topic.clone());
        }

        let topic = Topic::spawn_with_idle(
            id.to_string(),
            &self.inner.config.topic,
            self.inner.idle.clone(),
        )?;
        if topics.insert(id.to_string(), topic.clone()).is_some() {
            tracing::debug!(topic = %id, "Closed topic replaced");
        }

        tracing::debug!(topic = %id, topics = topics.len(), "Topic created");
        Ok(topic)
    }

    /// Get the topic for `id` if one is registered and not shut down
    pub async fn lookup(&self, id: &str) -> Option<Topic> {
        let topics = self.inner.topics.read().await;
        topics.get(id).filter(|topic| !topic.is_closed()).cloned()
    }

    /// Publish to a registered topic, returning the number of recipients
    ///
    /// Fails with [`SseError::NotFound`] if no live topic is registered
    /// under `id`, and with [`SseError::Closed`] if it shuts down while the
    /// event is being sent.
    pub async fn send(&self, id: &str, event: Event) -> Result<usize> {
        let topic = self
            .lookup(id)
            .await
            .ok_or_else(|| SseError::NotFound(id.to_string()))?;
        topic.publish(event).await
    }

    /// Register a subscriber on `id`, creating the topic if needed
    ///
    /// If the topic found shuts down before the registration lands (removed
    /// concurrently, or reaped under `WhenEmpty`), registration moves on to
    /// the topic that replaces it.
    pub async fn subscribe(&self, id: &str, tag: &str) -> Result<SubscriberHandle> {
        loop {
            let topic = self.get_or_create(id).await?;
            match topic.register(tag).await {
                Err(SseError::Closed(_)) => {
                    tracing::debug!(topic = %id, "Topic closed during subscribe, retrying");
                }
                result => return result,
            }
        }
    }

    /// Deregister a subscriber and apply the removal policy to its topic
    pub async fn unsubscribe(&self, subscriber: SubscriberHandle) {
        let id = subscriber.topic_id().to_string();
        subscriber.deregister().await;

        if self.inner.config.removal == RemovalPolicy::WhenEmpty {
            self.remove_if_empty(&id).await;
        }
    }

    /// Remove a topic and shut it down, closing its subscribers' mailboxes
    ///
    /// Returns false if no topic was registered under `id`.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut topics = self.inner.topics.write().await;
            topics.remove(id)
        };

        match removed {
            Some(topic) => {
                topic.shutdown().await;
                tracing::debug!(topic = %id, "Topic removed");
                true
            }
            None => false,
        }
    }

    /// Remove a topic only if it is closed or has no subscribers
    pub async fn remove_if_empty(&self, id: &str) -> bool {
        let removed = {
            let mut topics = self.inner.topics.write().await;
            match topics.get(id) {
                Some(topic) if topic.is_removable() => topics.remove(id),
                _ => None,
            }
        };

        match removed {
            Some(topic) => {
                topic.shutdown().await;
                tracing::debug!(topic = %id, "Empty topic removed");
                true
            }
            None => false,
        }
    }

    /// Remove every topic and shut them all down
    pub async fn close_all(&self) {
        let drained: Vec<Topic> = {
            let mut topics = self.inner.topics.write().await;
            topics.drain().map(|(_, topic)| topic).collect()
        };

        let count = drained.len();
        futures::future::join_all(drained.iter().map(|topic| topic.shutdown())).await;

        tracing::info!(topics = count, "All topics closed");
    }

    /// Ids of all registered topics, sorted
    pub async fn topic_ids(&self) -> Vec<String> {
        let topics = self.inner.topics.read().await;
        let mut ids: Vec<String> = topics.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered topics
    pub async fn len(&self) -> usize {
        self.inner.topics.read().await.len()
    }

    /// Whether no topic is registered
    pub async fn is_empty(&self) -> bool {
        self.inner.topics.read().await.is_empty()
    }

    /// Topic and subscriber totals
    pub async fn info(&self) -> RegistryInfo {
        let topics = self.inner.topics.read().await;
        RegistryInfo {
            topics: topics.len(),
            subscribers: topics.values().map(Topic::subscriber_count).sum(),
        }
    }
}

impl RegistryInner {
    /// Remove the reported topic instance if it is still registered and empty
    async fn remove_idle(&self, report: IdleTopic) {
        let removed = {
            let mut topics = self.topics.write().await;
            match topics.get(&report.id) {
                Some(topic) if topic.generation() == report.generation && topic.is_removable() => {
                    topics.remove(&report.id)
                }
                _ => None,
            }
        };

        if let Some(topic) = removed {
            topic.shutdown().await;
            tracing::debug!(topic = %report.id, "Idle topic removed");
        }
    }
}

/// Remove topics reported idle until the registry is dropped
async fn reap_idle_topics(
    registry: Weak<RegistryInner>,
    mut reports: mpsc::UnboundedReceiver<IdleTopic>,
) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        inner.remove_idle(report).await;
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
