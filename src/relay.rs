//! Re-framing of a provider token stream as Server-Sent Events.
//!
//! One read loop pulls chunks from the provider, reassembles lines, and hands
//! out events strictly in arrival order. The relay is either open or closed;
//! once the `[DONE]` sentinel is seen nothing more is read or emitted.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal payload of the event protocol.
pub const SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Fragment(String),
    Done,
}

impl RelayEvent {
    /// `data: {"response":"..."}\n\n`, or `data: [DONE]\n\n` for the end.
    pub fn to_sse_frame(&self) -> Bytes {
        match self {
            Self::Fragment(text) => {
                let json = serde_json::json!({ "response": text });
                Bytes::from(format!("data: {json}\n\n"))
            }
            Self::Done => Bytes::from(format!("data: {SENTINEL}\n\n")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Closed,
}

#[derive(Deserialize)]
struct ProviderChunk {
    #[serde(default)]
    response: Option<String>,
}

/// Splits a byte stream into non-blank text lines.
///
/// Bytes are held until a `\n` arrives, so a multi-byte character split
/// across two chunks is decoded whole.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Interpret one SSE line. Non-data lines and unusable payloads yield `None`.
pub fn parse_line(line: &str) -> Option<RelayEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == SENTINEL {
        return Some(RelayEvent::Done);
    }
    match serde_json::from_str::<ProviderChunk>(payload) {
        Ok(chunk) => match chunk.response {
            Some(text) if !text.is_empty() => Some(RelayEvent::Fragment(text)),
            _ => {
                debug!(payload, "stream event without response text");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, payload, "skipping malformed stream fragment");
            None
        }
    }
}

enum Step<T> {
    Cancelled,
    Next(Option<T>),
}

pub struct StreamRelay<S> {
    upstream: Option<S>,
    decoder: LineDecoder,
    pending: VecDeque<RelayEvent>,
    state: RelayState,
    cancel: CancellationToken,
}

impl<S, E> StreamRelay<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(upstream: S, cancel: CancellationToken) -> Self {
        Self {
            upstream: Some(upstream),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            state: RelayState::Open,
            cancel,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Next event in provider order, or `None` once the relay has closed.
    ///
    /// Cancellation is checked before every read; a cancelled relay drops the
    /// upstream connection and returns `None` without error.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        loop {
            if self.cancel.is_cancelled() {
                if self.state == RelayState::Open {
                    debug!("relay cancelled by caller");
                }
                self.pending.clear();
                self.close();
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state == RelayState::Closed {
                return None;
            }

            let step = {
                let cancel = &self.cancel;
                let Some(upstream) = self.upstream.as_mut() else {
                    self.state = RelayState::Closed;
                    return None;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    next = upstream.next() => Step::Next(next),
                }
            };

            match step {
                Step::Cancelled => continue,
                Step::Next(Some(Ok(chunk))) => self.ingest(&chunk),
                Step::Next(Some(Err(e))) => {
                    error!(error = %e, "provider stream read failed");
                    self.close();
                }
                Step::Next(None) => {
                    if let Some(line) = self.decoder.finish() {
                        self.ingest_line(&line);
                    }
                    if self.state == RelayState::Open {
                        debug!("provider closed stream without sentinel");
                        self.pending.push_back(RelayEvent::Done);
                        self.close();
                    }
                }
            }
        }
    }

    fn ingest(&mut self, chunk: &[u8]) {
        for line in self.decoder.push(chunk) {
            if self.state == RelayState::Closed {
                break;
            }
            self.ingest_line(&line);
        }
    }

    fn ingest_line(&mut self, line: &str) {
        match parse_line(line) {
            Some(RelayEvent::Done) => {
                self.pending.push_back(RelayEvent::Done);
                self.close();
            }
            Some(event) => self.pending.push_back(event),
            None => {}
        }
    }

    fn close(&mut self) {
        self.state = RelayState::Closed;
        // Dropping the upstream releases the provider connection.
        self.upstream = None;
    }

    /// SSE body stream. Dropping it (client disconnect) cancels the token.
    pub fn into_sse(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
    where
        S: Send + 'static,
        E: Send + 'static,
    {
        let guard = self.cancel.clone().drop_guard();
        futures::stream::unfold((self, guard), |(mut relay, guard)| async move {
            let event = relay.next_event().await?;
            Some((Ok(event.to_sse_frame()), (relay, guard)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_reassembles_lines_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"resp").is_empty());
        let lines = decoder.push(b"onse\":\"hi\"}\n\ndata: [DONE]\n");
        assert_eq!(lines, ["data: {\"response\":\"hi\"}", "data: [DONE]"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_keeps_split_multibyte_characters() {
        let text = "data: {\"response\":\"caf\u{e9} \u{1f600}\"}\n";
        let bytes = text.as_bytes();
        // split inside the 4-byte emoji
        let split = bytes.len() - 5;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let lines = decoder.push(&bytes[split..]);
        assert_eq!(lines, [text.trim_end()]);
    }

    #[test]
    fn decoder_strips_carriage_returns_and_blank_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"data: a\r\n\r\n   \n");
        assert_eq!(lines, ["data: a"]);
    }

    #[test]
    fn decoder_finish_flushes_partial_line() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn parse_line_cases() {
        assert_eq!(
            parse_line(r#"data: {"response":"Hel"}"#),
            Some(RelayEvent::Fragment("Hel".into()))
        );
        assert_eq!(parse_line("data: [DONE]"), Some(RelayEvent::Done));
        assert_eq!(parse_line("data:[DONE]"), Some(RelayEvent::Done));
        assert_eq!(parse_line("data: not-json"), None);
        assert_eq!(parse_line(r#"data: {"response":""}"#), None);
        assert_eq!(parse_line(r#"data: {"usage":{"total_tokens":3}}"#), None);
        assert_eq!(parse_line("event: ping"), None);
        assert_eq!(parse_line(": keep-alive"), None);
    }

    #[test]
    fn frames_are_sse_encoded() {
        let frame = RelayEvent::Fragment("say \"hi\"\n".into()).to_sse_frame();
        assert_eq!(&frame[..], b"data: {\"response\":\"say \\\"hi\\\"\\n\"}\n\n");
        assert_eq!(&RelayEvent::Done.to_sse_frame()[..], b"data: [DONE]\n\n");
    }
}
