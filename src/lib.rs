//! # a3s-sse
//!
//! Topic-based server-sent event fan-out for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-sse` routes events published on a named topic to the clients
//! subscribed to it. An event with an empty tag is broadcast to every
//! subscriber; a tagged event is narrowcast to the one subscriber holding
//! that tag. Registering a tag that is already held evicts the previous
//! holder, so a reconnecting client replaces its stale stream.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_sse::{Event, RegistryConfig, TopicRegistry};
//!
//! # async fn example() -> a3s_sse::Result<()> {
//! let registry = TopicRegistry::new(RegistryConfig::default())?;
//! registry.get_or_create("market").await?;
//!
//! // One anonymous subscriber, one tagged
//! let mut dashboard = registry.subscribe("market", "").await?;
//! let mut trader = registry.subscribe("market", "trader-7").await?;
//!
//! // Broadcast reaches both, narrowcast only the tag holder
//! registry.send("market", Event::new("USD/CNY 7.35").with_type("rate")).await?;
//! registry.send("market", Event::new("order filled").with_tag("trader-7")).await?;
//!
//! assert_eq!(dashboard.recv().await.unwrap().data, "USD/CNY 7.35");
//! assert_eq!(trader.recv().await.unwrap().data, "USD/CNY 7.35");
//! assert_eq!(trader.recv().await.unwrap().data, "order filled");
//!
//! registry.close_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Topic** — per-topic actor task that owns the subscriber set
//! - **SubscriberHandle** — bounded mailbox of events routed to one client
//! - **TopicRegistry** — concurrent map from topic id to topic
//! - **Connection** — writes encoded events to an [`EventSink`]
//! - **codec** — event-stream wire encoding and a client-side decoder

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod topic;
pub mod types;

// Re-export core types
pub use codec::{encode, encode_comment, Decoder, EventReader};
pub use config::{RegistryConfig, RemovalPolicy, TopicConfig};
pub use connection::{
    http_response_head, ChannelSink, Connection, EventSink, WriterSink, STREAM_HEADERS,
};
pub use error::{Result, SseError};
pub use registry::TopicRegistry;
pub use topic::{SubscriberHandle, Topic};
pub use types::{Event, RegistryInfo, SubscriberId, TopicInfo};
