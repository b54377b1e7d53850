//! Core event types for the a3s-sse system
//!
//! All types use camelCase JSON serialization for wire compatibility.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single server-sent event
///
/// Events are immutable once published: `Topic::publish` moves them into an
/// `Arc` that every recipient shares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event identifier (`id:` field), echoed back by clients as `Last-Event-ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event name (`event:` field)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Reconnection hint in milliseconds (`retry:` field)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,

    /// Payload (`data:` field)
    #[serde(default)]
    pub data: String,

    /// Routing key within a topic
    ///
    /// Empty broadcasts to every subscriber; non-empty narrowcasts to the
    /// subscriber registered under the same tag. Never written to the wire.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl Event {
    /// Create a broadcast event carrying `data`
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Create an event whose data is the JSON encoding of `payload`
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(payload)?))
    }

    /// Set the event identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the event name
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the reconnection hint in milliseconds
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Route the event to a single tagged subscriber
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Whether the event goes to every subscriber of its topic
    pub fn is_broadcast(&self) -> bool {
        self.tag.is_empty()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event{{id: {}, type: {}, retry: {}, data: {}}}",
            self.id.as_deref().unwrap_or(""),
            self.event_type.as_deref().unwrap_or(""),
            self.retry.unwrap_or(0),
            self.data
        )
    }
}

/// Identifier of a subscriber within one topic
///
/// Assigned by the topic in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl SubscriberId {
    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Point-in-time status of a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    /// Topic identifier
    pub id: String,
    /// Number of registered subscribers
    pub subscribers: usize,
    /// Whether the topic has been shut down
    pub closed: bool,
}

/// Point-in-time status of a topic registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryInfo {
    /// Number of registered topics
    pub topics: usize,
    /// Subscribers summed across all topics
    pub subscribers: usize,
}
