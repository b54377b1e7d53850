//! Server-sent event wire format
//!
//! Encoding writes one `field: value` line per non-empty field followed by a
//! blank line. Values are escaped in a single pass so an embedded line break
//! can never end a field early:
//!
//! | char | written as |
//! |------|------------|
//! | `\n` | `\\n`      |
//! | `\r` | `\\r`      |
//! | `\t` | `\\t`      |
//! | `\\` | `\\\\`     |
//!
//! [`Decoder`] is the matching line-oriented parser used by clients; it
//! reverses the escaping.

use crate::error::Result;
use crate::types::Event;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Encode an event into its wire representation
///
/// `retry` is written only when greater than zero. The routing tag is never
/// written.
pub fn encode(event: &Event) -> Bytes {
    let mut buf = BytesMut::with_capacity(event.data.len() + 32);

    if let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) {
        put_field(&mut buf, "id", id);
    }

    if let Some(name) = event.event_type.as_deref().filter(|name| !name.is_empty()) {
        put_field(&mut buf, "event", name);
    }

    if let Some(retry) = event.retry.filter(|retry| *retry > 0) {
        buf.put_slice(b"retry: ");
        buf.put_slice(retry.to_string().as_bytes());
        buf.put_u8(b'\n');
    }

    if !event.data.is_empty() {
        put_field(&mut buf, "data", &event.data);
    }

    buf.put_u8(b'\n');
    buf.freeze()
}

/// Encode a comment frame, ignored by clients (used for keep-alives)
pub fn encode_comment(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 4);
    buf.put_slice(b": ");
    escape_into(&mut buf, text);
    buf.put_slice(b"\n\n");
    buf.freeze()
}

fn put_field(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    escape_into(buf, value);
    buf.put_u8(b'\n');
}

fn escape_into(buf: &mut BytesMut, value: &str) {
    // The escaped characters are ASCII, so they never occur inside a
    // multi-byte UTF-8 sequence
    for &byte in value.as_bytes() {
        match byte {
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\\' => buf.put_slice(b"\\\\"),
            _ => buf.put_u8(byte),
        }
    }
}

/// Reverse of the encoder's escaping; unknown escapes are kept verbatim
pub fn unescape(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Incremental event-stream parser
///
/// Feed it whole lines with [`decode_line`](Self::decode_line) or raw chunks
/// with [`feed`](Self::feed); call [`finish`](Self::finish) at end of input to
/// flush an event that was not followed by a blank line.
#[derive(Debug, Default)]
pub struct Decoder {
    current: Option<Event>,
    partial: BytesMut,
}

impl Decoder {
    /// Create a decoder with no pending state
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one line (with or without its terminator)
    ///
    /// Returns an event when the line completes one.
    pub fn decode_line(&mut self, line: &str) -> Option<Event> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return self.take_event();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let field = field.trim();
        let value = value.strip_prefix(' ').unwrap_or(value);

        if field.is_empty() {
            return None;
        }

        let event = self.current.get_or_insert_with(Event::default);
        match field {
            "id" => event.id = Some(unescape(value)),
            "event" => event.event_type = Some(unescape(value)),
            "data" => {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(&unescape(value));
            }
            "retry" => {
                if let Ok(retry) = value.trim().parse::<u64>() {
                    event.retry = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    /// Process a chunk of raw bytes, buffering any trailing partial line
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.partial.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line = self.partial.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush state at end of input
    pub fn finish(&mut self) -> Option<Event> {
        if self.partial.has_remaining() {
            let rest = self.partial.split();
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.decode_line(&line) {
                return Some(event);
            }
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<Event> {
        self.current.take().filter(is_dispatchable)
    }
}

/// Only events carrying data, a name or an id reach the caller
fn is_dispatchable(event: &Event) -> bool {
    !event.data.is_empty()
        || event.event_type.as_deref().is_some_and(|name| !name.is_empty())
        || event.id.as_deref().is_some_and(|id| !id.is_empty())
}

/// Reads events from any buffered byte source
///
/// Client side of the stream: wrap a response body (or any `AsyncBufRead`)
/// and pull events one at a time.
pub struct EventReader<R> {
    reader: R,
    decoder: Decoder,
    line: Vec<u8>,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    /// Create a reader over `reader`
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: Decoder::new(),
            line: Vec::new(),
            done: false,
        }
    }

    /// Next complete event, or `None` at end of input
    ///
    /// An event still pending at end of input is returned before `None`.
    /// Invalid UTF-8 is replaced with U+FFFD, as in [`Decoder::feed`].
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        if self.done {
            return Ok(None);
        }

        loop {
            self.line.clear();
            let read = match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(read) => read,
                Err(e) => {
                    self.done = true;
                    return Err(e.into());
                }
            };

            if read == 0 {
                self.done = true;
                return Ok(self.decoder.finish());
            }

            let line = String::from_utf8_lossy(&self.line);
            if let Some(event) = self.decoder.decode_line(&line) {
                return Ok(Some(event));
            }
        }
    }

    /// Convert into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = Result<Event>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_event().await {
                Ok(Some(event)) => Some((Ok(event), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }

    /// Recover the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}
