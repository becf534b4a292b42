//! # Upstream frame parser
//!
//! Turns the provider's `text/event-stream` byte stream into [`FrameEvent`]s.
//!
//! Network chunks do not respect line boundaries, so the parser keeps the
//! bytes of the incomplete trailing line between calls. A line only counts
//! once its terminating `\n` arrives; a `\r` before it is dropped. Because
//! lines are cut on raw bytes, a multi-byte UTF-8 character split across two
//! chunks is reassembled before decoding.
//!
//! Only `data:` lines are significant:
//!
//! - `data: [DONE]` ends the stream ([`FrameEvent::Terminal`]).
//! - `data: {json}` carries a completion chunk. Non-empty
//!   `choices[0].delta.content` yields [`FrameEvent::Delta`]; an `error`
//!   object (top-level or on the choice) yields [`FrameEvent::EmbeddedError`].
//! - A `data:` payload that is not valid JSON yields
//!   [`FrameEvent::Malformed`]; parsing continues with the next line.
//!
//! Comments (`: keep-alive`), `event:`/`id:` fields and blank lines are
//! ignored. Once the terminal marker is seen the parser yields nothing more.
//!
//! A line longer than the parser's limit is reported once as
//! [`MalformedFrame::LineTooLong`] and skipped up to its newline.

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::pin;

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// One significant thing found in the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A non-empty piece of generated text.
    Delta(String),
    /// The `[DONE]` marker.
    Terminal,
    /// The provider reported an error inside the stream.
    EmbeddedError(String),
    /// Something that should have been a frame but was not usable.
    Malformed(MalformedFrame),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MalformedFrame {
    /// A `data:` payload that did not decode as a completion chunk.
    InvalidPayload(String),
    /// The byte stream ended without a terminal marker.
    StreamEndedEarly,
    /// A line grew past `limit` bytes without a newline.
    LineTooLong { limit: usize },
}

#[derive(Deserialize, Debug, Default)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize, Debug, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ChunkError {
    fn describe(&self) -> String {
        match (&self.message, &self.code) {
            (Some(message), _) => message.clone(),
            (None, Some(code)) => format!("provider error code {code}"),
            (None, None) => "unknown provider error".to_string(),
        }
    }
}

/// Incremental line splitter and frame decoder.
#[derive(Debug)]
pub struct FrameParser {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    /// Dropping the rest of an oversized line.
    skipping: bool,
    finished: bool,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_limit(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line,
            skipping: false,
            finished: false,
        }
    }

    /// `true` once the terminal marker has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one network chunk and collect every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let line_start = consumed;
            consumed = end + 1;
            from = consumed;

            if self.skipping {
                self.skipping = false;
                continue;
            }
            let Some(event) = decode_line(strip_cr(&self.pending[line_start..end])) else {
                continue;
            };
            let terminal = event == FrameEvent::Terminal;
            events.push(event);
            if terminal {
                self.finished = true;
                self.pending.clear();
                self.scanned = 0;
                return events;
            }
        }
        self.pending.drain(..consumed);
        self.scanned = self.pending.len();

        if self.pending.len() > self.max_line {
            self.pending.clear();
            self.scanned = 0;
            if !self.skipping {
                self.skipping = true;
                events.push(FrameEvent::Malformed(MalformedFrame::LineTooLong {
                    limit: self.max_line,
                }));
            }
        }
        events
    }

    /// Flush a final unterminated line once the byte stream has ended.
    pub fn finish(&mut self) -> Vec<FrameEvent> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if self.finished || self.skipping || rest.is_empty() {
            return Vec::new();
        }
        match decode_line(strip_cr(&rest)) {
            Some(event) => {
                if event == FrameEvent::Terminal {
                    self.finished = true;
                }
                vec![event]
            }
            None => Vec::new(),
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_line(line: &[u8]) -> Option<FrameEvent> {
    let payload = line.strip_prefix(b"data:")?;
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);

    let text = match std::str::from_utf8(payload) {
        Ok(text) => text.trim(),
        Err(e) => {
            return Some(FrameEvent::Malformed(MalformedFrame::InvalidPayload(format!(
                "invalid utf-8: {e}"
            ))));
        }
    };

    if text.is_empty() {
        return None;
    }
    if text == "[DONE]" {
        return Some(FrameEvent::Terminal);
    }

    let chunk: CompletionChunk = match serde_json::from_str(text) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Some(FrameEvent::Malformed(MalformedFrame::InvalidPayload(format!(
                "{e}: {text}"
            ))));
        }
    };

    if let Some(error) = chunk.error {
        return Some(FrameEvent::EmbeddedError(error.describe()));
    }
    let choice = chunk.choices.into_iter().next()?;
    if let Some(error) = choice.error {
        return Some(FrameEvent::EmbeddedError(error.describe()));
    }
    choice
        .delta
        .content
        .filter(|content| !content.is_empty())
        .map(FrameEvent::Delta)
}

/// Adapt a byte-chunk stream into a frame-event stream.
///
/// # Parameters
/// - `source`: chunks as they arrive from the transport.
///
/// # Returns
/// A stream that yields every event in order, stops after
/// [`FrameEvent::Terminal`], yields
/// [`MalformedFrame::StreamEndedEarly`] if the source ends without one, and
/// stops after passing through the first transport error. `source` is
/// dropped as soon as the returned stream stops.
pub fn parse_frames<S, B, E>(source: S) -> impl Stream<Item = Result<FrameEvent, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream! {
        let mut parser = FrameParser::new();
        let mut source = pin!(source);

        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.push(bytes.as_ref()) {
                        yield Ok(event);
                    }
                    if parser.is_finished() {
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        for event in parser.finish() {
            yield Ok(event);
        }
        if !parser.is_finished() {
            yield Ok(FrameEvent::Malformed(MalformedFrame::StreamEndedEarly));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    const TRANSCRIPT: &str = concat!(
        ": OPENROUTER PROCESSING\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hél\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo ✓\"}}]}\n",
        "\n",
        "data: [DONE]\n",
        "\n",
    );

    fn expected() -> Vec<FrameEvent> {
        vec![
            FrameEvent::Delta("Hél".into()),
            FrameEvent::Delta("lo ✓".into()),
            FrameEvent::Terminal,
        ]
    }

    fn parse_in_pieces(bytes: &[u8], cuts: &[usize]) -> Vec<FrameEvent> {
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            events.extend(parser.push(&bytes[start..cut]));
            start = cut;
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_every_single_split_point_gives_the_same_events() {
        let bytes = TRANSCRIPT.as_bytes();
        for cut in 0..=bytes.len() {
            assert_eq!(parse_in_pieces(bytes, &[cut]), expected(), "split at {cut}");
        }
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let bytes = TRANSCRIPT.as_bytes();
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        assert_eq!(parse_in_pieces(bytes, &cuts), expected());
    }

    #[test]
    fn test_crlf_line_endings() {
        let crlf = TRANSCRIPT.replace('\n', "\r\n");
        assert_eq!(parse_in_pieces(crlf.as_bytes(), &[]), expected());
    }

    #[test]
    fn test_malformed_payload_does_not_stop_parsing() {
        let input = concat!(
            "data: {not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            "data: [DONE]\n",
        );
        let events = parse_in_pieces(input.as_bytes(), &[]);
        assert!(matches!(
            events[0],
            FrameEvent::Malformed(MalformedFrame::InvalidPayload(_))
        ));
        assert_eq!(&events[1..], &[FrameEvent::Delta("ok".into()), FrameEvent::Terminal]);
    }

    #[test]
    fn test_nothing_after_terminal() {
        let input = concat!(
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );
        let mut parser = FrameParser::new();
        assert_eq!(parser.push(input.as_bytes()), vec![FrameEvent::Terminal]);
        assert!(parser.push(b"data: {\"choices\":[]}\n").is_empty());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_embedded_errors() {
        let top_level = "data: {\"error\":{\"message\":\"overloaded\",\"code\":502}}\n";
        assert_eq!(
            parse_in_pieces(top_level.as_bytes(), &[]),
            vec![FrameEvent::EmbeddedError("overloaded".into())]
        );

        let on_choice = "data: {\"choices\":[{\"delta\":{},\"error\":{\"code\":429}}]}\n";
        assert_eq!(
            parse_in_pieces(on_choice.as_bytes(), &[]),
            vec![FrameEvent::EmbeddedError("provider error code 429".into())]
        );
    }

    #[test]
    fn test_oversized_line_is_reported_once_and_skipped() {
        let mut parser = FrameParser::with_line_limit(64);
        let mut events = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"");
        for _ in 0..100 {
            events.extend(parser.push(b"xxxxxxxx"));
        }
        events.extend(parser.push(b"\"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n"));
        events.extend(parser.push(b"data: [DONE]\n"));

        assert_eq!(
            events,
            vec![
                FrameEvent::Malformed(MalformedFrame::LineTooLong { limit: 64 }),
                FrameEvent::Delta("ok".into()),
                FrameEvent::Terminal,
            ]
        );
    }

    #[test]
    fn test_line_within_limit_survives_many_small_chunks() {
        let content = "y".repeat(4000);
        let line = format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n");
        let mut parser = FrameParser::with_line_limit(line.len());
        let mut events = Vec::new();
        for piece in line.as_bytes().chunks(3) {
            events.extend(parser.push(piece));
        }
        assert_eq!(events, vec![FrameEvent::Delta(content)]);
    }

    #[test]
    fn test_final_line_without_newline_is_flushed() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}";
        assert_eq!(
            parse_in_pieces(input.as_bytes(), &[10]),
            vec![FrameEvent::Delta("tail".into())]
        );
    }

    #[tokio::test]
    async fn test_stream_without_terminal_reports_early_end() {
        let chunks: Vec<Result<&[u8], ()>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n".as_slice())];
        let events: Vec<_> = parse_frames(stream::iter(chunks)).collect().await;
        assert_eq!(
            events,
            vec![
                Ok(FrameEvent::Delta("A".into())),
                Ok(FrameEvent::Malformed(MalformedFrame::StreamEndedEarly)),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_stops_after_transport_error() {
        let chunks: Vec<Result<&[u8], &str>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n".as_slice()),
            Err("connection reset"),
            Ok(b"data: [DONE]\n".as_slice()),
        ];
        let events: Vec<_> = parse_frames(stream::iter(chunks)).collect().await;
        assert_eq!(
            events,
            vec![Ok(FrameEvent::Delta("A".into())), Err("connection reset")]
        );
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_source_is_released_once_after_terminal() {
        let drops = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(drops.clone());
        let source = stream::iter(vec![
            Ok::<_, ()>(b"data: [DONE]\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n".to_vec()),
        ])
        .map(move |chunk| {
            let _keep = &guard;
            chunk
        });

        let mut frames = Box::pin(parse_frames(source));
        assert_eq!(frames.next().await, Some(Ok(FrameEvent::Terminal)));
        assert_eq!(frames.next().await, None);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(frames);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
