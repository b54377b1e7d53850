//! Topic actor event loop
//!
//! The actor is the only code that touches a topic's subscriber map and tag
//! index. Every mutation arrives as a [`Command`] and is handled to
//! completion before the next one is received, so no lock is needed.

use super::subscriber::{Delivery, Subscriber};
use super::{signalled, Command, IdleTopic, Registration, TopicShared};
use crate::types::{Event, SubscriberId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub(super) struct TopicActor {
    shared: Arc<TopicShared>,
    commands: mpsc::Receiver<Command>,
    closed: watch::Receiver<bool>,

    /// Registered subscribers in registration order
    subscribers: BTreeMap<SubscriberId, Subscriber>,

    /// Holder of each non-empty tag
    tags: HashMap<String, SubscriberId>,

    next_id: u64,
    mailbox_capacity: usize,
    idle: Option<mpsc::UnboundedSender<IdleTopic>>,
}

impl TopicActor {
    pub(super) fn new(
        shared: Arc<TopicShared>,
        commands: mpsc::Receiver<Command>,
        mailbox_capacity: usize,
        idle: Option<mpsc::UnboundedSender<IdleTopic>>,
    ) -> Self {
        let closed = shared.closed.subscribe();
        Self {
            shared,
            commands,
            closed,
            subscribers: BTreeMap::new(),
            tags: HashMap::new(),
            next_id: 1,
            mailbox_capacity,
            idle,
        }
    }

    /// Process commands until shutdown or until every handle is dropped
    ///
    /// A pending shutdown wins over queued commands; commands still queued
    /// when the loop exits are dropped, which wakes their callers.
    pub(super) async fn run(mut self) {
        tracing::debug!(topic = %self.shared.id, "Topic started");

        let shutdown = signalled(self.closed.clone());
        tokio::pin!(shutdown);

        loop {
            let command = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                command = self.commands.recv() => command,
            };

            match command {
                Some(command) => self.handle(command),
                None => break,
            }
        }

        self.commands.close();
        tracing::debug!(
            topic = %self.shared.id,
            subscribers = self.subscribers.len(),
            "Topic stopped"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { tag, reply } => self.register(tag, reply),
            Command::Deregister { id, reply } => {
                self.deregister(id);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Publish { event, reply } => {
                let delivered = self.publish(&event);
                let _ = reply.send(delivered);
            }
        }
    }

    fn register(&mut self, tag: String, reply: oneshot::Sender<Registration>) {
        // The caller gave up before we got here; leave the current tag holder alone
        if reply.is_closed() {
            return;
        }

        if !tag.is_empty() {
            if let Some(previous) = self.tags.get(&tag).copied() {
                self.remove(previous);
                tracing::debug!(
                    topic = %self.shared.id,
                    subscriber = %previous,
                    tag = %tag,
                    "Subscriber evicted by newer registration"
                );
            }
        }

        let id = SubscriberId(self.next_id);
        self.next_id += 1;

        let (subscriber, inbox) = Subscriber::new(id, tag.clone(), self.mailbox_capacity);
        if !tag.is_empty() {
            self.tags.insert(tag.clone(), id);
        }
        self.subscribers.insert(id, subscriber);
        self.sync_count();

        if reply.send(Registration { id, inbox }).is_err() {
            self.remove(id);
            self.sync_count();
            self.notify_if_idle();
            return;
        }

        tracing::debug!(
            topic = %self.shared.id,
            subscriber = %id,
            tag = %tag,
            subscribers = self.subscribers.len(),
            "Subscriber registered"
        );
    }

    fn deregister(&mut self, id: SubscriberId) {
        if !self.remove(id) {
            return;
        }
        self.sync_count();

        tracing::debug!(
            topic = %self.shared.id,
            subscriber = %id,
            subscribers = self.subscribers.len(),
            "Subscriber deregistered"
        );
        self.notify_if_idle();
    }

    fn publish(&mut self, event: &Arc<Event>) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        if event.is_broadcast() {
            for (id, subscriber) in &self.subscribers {
                match subscriber.deliver(&self.shared.id, event) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Dropped => {}
                    Delivery::Gone => gone.push(*id),
                }
            }
        } else if let Some(id) = self.tags.get(&event.tag).copied() {
            if let Some(subscriber) = self.subscribers.get(&id) {
                match subscriber.deliver(&self.shared.id, event) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Dropped => {}
                    Delivery::Gone => gone.push(id),
                }
            }
        } else {
            tracing::trace!(
                topic = %self.shared.id,
                tag = %event.tag,
                "No subscriber holds tag, event dropped"
            );
        }

        if !gone.is_empty() {
            for id in &gone {
                self.remove(*id);
            }
            self.sync_count();
            tracing::debug!(
                topic = %self.shared.id,
                pruned = gone.len(),
                "Pruned subscribers whose consumers went away"
            );
            self.notify_if_idle();
        }

        delivered
    }

    /// Remove a subscriber and close its mailbox; false if it was not registered
    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(mut subscriber) = self.subscribers.remove(&id) else {
            return false;
        };

        if !subscriber.tag().is_empty() && self.tags.get(subscriber.tag()) == Some(&id) {
            self.tags.remove(subscriber.tag());
        }
        subscriber.close();
        true
    }

    fn close_all(&mut self) {
        let mut closed = 0;
        for subscriber in self.subscribers.values_mut() {
            if subscriber.close() {
                closed += 1;
            }
        }
        self.subscribers.clear();
        self.tags.clear();
        self.sync_count();

        if closed > 0 {
            tracing::debug!(
                topic = %self.shared.id,
                closed,
                "Closed subscriber mailboxes"
            );
        }
    }

    fn sync_count(&self) {
        self.shared
            .subscribers
            .store(self.subscribers.len(), Ordering::Release);
    }

    fn notify_if_idle(&self) {
        if !self.subscribers.is_empty() {
            return;
        }
        let Some(idle) = &self.idle else {
            return;
        };

        let report = IdleTopic {
            id: self.shared.id.clone(),
            generation: self.shared.generation,
        };
        if idle.send(report).is_err() {
            tracing::debug!(topic = %self.shared.id, "Registry gone, idle topic not reported");
        }
    }
}

impl Drop for TopicActor {
    fn drop(&mut self) {
        // Also runs when the task is aborted, so waiters never hang
        self.close_all();
        self.shared.closed.send_replace(true);
        self.shared.stopped.send_replace(true);
    }
}
