//! Streaming connections
//!
//! A [`Connection`] writes encoded events to an [`EventSink`], flushing after
//! every frame so clients see each event as soon as it is published. The
//! crate bundles no HTTP server; adapters implement [`EventSink`] for
//! whatever response body type the embedding framework uses. Two sinks are
//! provided:
//!
//! - [`WriterSink`] over any `AsyncWrite` (raw sockets, duplex pipes)
//! - [`ChannelSink`] producing a `Stream<Item = Bytes>` for body types that
//!   accept a stream

use crate::codec;
use crate::error::{Result, SseError};
use crate::topic::SubscriberHandle;
use crate::types::Event;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Headers every event-stream response must carry
pub const STREAM_HEADERS: [(&str, &str); 3] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
];

/// HTTP/1.1 response head for a raw-socket event stream
pub fn http_response_head() -> Bytes {
    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    for (name, value) in STREAM_HEADERS {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    Bytes::from(head)
}

/// Destination of an event stream
#[async_trait]
pub trait EventSink: Send {
    /// Whether writes can be pushed to the client immediately
    ///
    /// Sinks that buffer the whole response cannot carry a live stream and
    /// are rejected by [`Connection::upgrade`].
    fn supports_flush(&self) -> bool {
        true
    }

    /// Send the response preamble (status line, headers)
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write a chunk of the stream
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Push everything written so far to the client
    async fn flush(&mut self) -> Result<()>;
}

/// Sink over an `AsyncWrite`
pub struct WriterSink<W> {
    writer: W,
    preamble: Option<Bytes>,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    /// Stream directly into `writer` with no preamble
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            preamble: None,
        }
    }

    /// Write `preamble` (typically [`http_response_head`]) when opened
    pub fn with_preamble(writer: W, preamble: Bytes) -> Self {
        Self {
            writer,
            preamble: Some(preamble),
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for WriterSink<W> {
    async fn open(&mut self) -> Result<()> {
        if let Some(preamble) = self.preamble.take() {
            self.writer.write_all(&preamble).await?;
        }
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Sink that hands each flushed frame to a stream
pub struct ChannelSink {
    buffer: BytesMut,
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Create a sink and the stream of flushed frames
    ///
    /// `capacity` bounds the frames waiting to be taken by the body; writers
    /// wait when it is full.
    pub fn new(capacity: usize) -> Result<(Self, ReceiverStream<Bytes>)> {
        if capacity == 0 {
            return Err(SseError::Config(
                "channel sink capacity must be greater than zero".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        let sink = Self {
            buffer: BytesMut::new(),
            sender,
        };
        Ok((sink, ReceiverStream::new(receiver)))
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.sender.is_closed() {
            return Err(SseError::StreamClosed);
        }
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let frame = self.buffer.split().freeze();
        self.sender
            .send(frame)
            .await
            .map_err(|_| SseError::StreamClosed)
    }
}

/// One client's event stream
pub struct Connection<S> {
    sink: S,
    keep_alive: Option<Duration>,
    closed: bool,
}

impl<S: EventSink> Connection<S> {
    /// Turn a sink into an event stream
    ///
    /// Fails with [`SseError::Unsupported`] if the sink cannot flush
    /// incrementally. On success the preamble has been written and flushed.
    pub async fn upgrade(mut sink: S) -> Result<Self> {
        if !sink.supports_flush() {
            return Err(SseError::Unsupported(
                "sink cannot flush incrementally".to_string(),
            ));
        }

        sink.open().await?;
        sink.flush().await?;

        Ok(Self {
            sink,
            keep_alive: None,
            closed: false,
        })
    }

    /// Send a comment frame at this interval while no events arrive
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval).filter(|interval| !interval.is_zero());
        self
    }

    /// Encode, write and flush one event
    pub async fn send(&mut self, event: &Event) -> Result<()> {
        self.write(&codec::encode(event)).await
    }

    /// Send a comment frame
    pub async fn send_comment(&mut self, text: &str) -> Result<()> {
        self.write(&codec::encode_comment(text)).await
    }

    /// Write and flush raw bytes
    ///
    /// A write failure closes the connection.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SseError::StreamClosed);
        }

        let result = match self.sink.write(buf).await {
            Ok(()) => self.sink.flush().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.closed = true;
        }
        result
    }

    /// Mark the stream finished; later writes fail with `StreamClosed`
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Recover the sink
    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Forward a subscriber's events until its mailbox closes, a write
    /// fails, or `cancel` resolves
    ///
    /// The subscriber is always deregistered and the connection closed on
    /// return. Returns the write error if one ended the stream.
    pub async fn serve(
        mut self,
        mut subscriber: SubscriberHandle,
        cancel: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(cancel);

        let mut ticker = self.keep_alive.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        tracing::debug!(
            topic = %subscriber.topic_id(),
            subscriber = %subscriber.id(),
            "Connection streaming"
        );

        let result = loop {
            let keep_alive = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut cancel => break Ok(()),
                event = subscriber.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.send(&event).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = keep_alive => {
                    if let Err(e) = self.send_comment("keep-alive").await {
                        break Err(e);
                    }
                }
            }
        };

        self.close();
        match &result {
            Ok(()) => tracing::debug!(
                topic = %subscriber.topic_id(),
                subscriber = %subscriber.id(),
                "Connection finished"
            ),
            Err(e) => tracing::warn!(
                topic = %subscriber.topic_id(),
                subscriber = %subscriber.id(),
                error = %e,
                "Connection ended by write failure"
            ),
        }
        subscriber.deregister().await;
        result
    }
}
