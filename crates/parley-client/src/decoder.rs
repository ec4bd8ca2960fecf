//! Incremental decoder for chunked completion streams.
//!
//! The body of a streamed completion is a sequence of records separated by
//! `data:`. Each record is either a JSON chunk carrying a content delta or the
//! literal `[DONE]`. A chunk that carries a `usage` object also marks the
//! stream finished, but records after it still count until `[DONE]`.
//!
//! The transport delivers a buffer that only ever grows. [`StreamDecoder`]
//! remembers how far records are settled (followed by another delimiter) so
//! that each record is parsed once, while still producing exactly what
//! [`decode`] would produce for the whole buffer.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::{StreamChunk, Usage};

/// Token separating records in the stream body.
pub const RECORD_DELIMITER: &str = "data:";

/// Record that ends the stream.
pub const DONE_MARKER: &str = "[DONE]";

/// How to treat an unparseable record at the end of a growing buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailPolicy {
    /// Any unparseable record is an error, including one that may still be
    /// arriving.
    Strict,
    /// An unparseable last record that is not yet followed by a delimiter is
    /// assumed incomplete and retried when the buffer grows.
    #[default]
    Tolerant,
}

/// Result of decoding a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// All content decoded so far, untrimmed.
    pub content: String,
    /// A terminal record was seen.
    pub finished: bool,
    /// Usage summary, when a record carried one.
    pub usage: Option<Usage>,
    /// Latest `finish_reason` reported by a record.
    pub finish_reason: Option<String>,
}

enum Record {
    Empty,
    Done,
    Chunk {
        content: String,
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

fn parse_record(candidate: &str) -> Result<Record, serde_json::Error> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return Ok(Record::Empty);
    }
    if candidate == DONE_MARKER {
        return Ok(Record::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(candidate)?;
    let usage = chunk.usage.clone();
    let finish_reason = chunk
        .choices
        .first()
        .and_then(|choice| choice.finish_reason.clone());
    Ok(Record::Chunk {
        content: chunk.into_delta_content(),
        usage,
        finish_reason,
    })
}

// =============================================================================
// StreamDecoder
// =============================================================================

/// Stateful decoder fed with successive prefixes of one stream body.
#[derive(Debug, Clone, Default)]
pub struct StreamDecoder {
    policy: TailPolicy,
    /// Byte offset of the first record not yet settled.
    cursor: usize,
    /// Content of the settled records.
    settled: String,
    /// Number of non-empty records settled.
    records: usize,
    /// `[DONE]` was settled; nothing after it is read.
    done: bool,
    /// `[DONE]` or a usage record was settled.
    finished: bool,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamDecoder {
    /// Create a decoder with the given tail policy.
    #[must_use]
    pub fn new(policy: TailPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// The tail policy in use.
    #[must_use]
    pub const fn policy(&self) -> TailPolicy {
        self.policy
    }

    /// Whether a terminal record has been seen.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Content of the records settled so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.settled
    }

    /// Forget everything decoded so far.
    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }

    /// Decode `buffer`, which must extend every buffer fed before.
    ///
    /// A buffer that does not extend the previous one restarts decoding from
    /// scratch. Once `[DONE]` is seen, further input is ignored.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Malformed` for an unparseable record followed by
    /// a delimiter, or for an unparseable last record under
    /// [`TailPolicy::Strict`].
    pub fn feed(&mut self, buffer: &str) -> Result<Decoded, DecodeError> {
        if self.done {
            return Ok(self.snapshot());
        }

        let rest = if let Some(rest) = buffer.get(self.cursor..) {
            rest
        } else {
            self.reset();
            buffer
        };

        let mut offset = 0;
        while let Some(pos) = rest[offset..].find(RECORD_DELIMITER) {
            let candidate = &rest[offset..offset + pos];
            let record = parse_record(candidate).map_err(|e| self.malformed(&e))?;
            offset += pos + RECORD_DELIMITER.len();
            self.cursor += pos + RECORD_DELIMITER.len();
            self.settle(record);
            if self.done {
                return Ok(self.snapshot());
            }
        }

        // The tail may still be growing: only settle it when it ends the stream.
        let tail = &rest[offset..];
        match self.parse_tail(tail) {
            Ok(Record::Empty) => Ok(self.snapshot()),
            Ok(Record::Done) => {
                self.cursor = buffer.len();
                self.settle(Record::Done);
                Ok(self.snapshot())
            }
            Ok(Record::Chunk {
                content,
                usage,
                finish_reason,
            }) => {
                let mut decoded = self.snapshot();
                decoded.content.push_str(&content);
                if usage.is_some() {
                    decoded.finished = true;
                    decoded.usage = usage;
                }
                if finish_reason.is_some() {
                    decoded.finish_reason = finish_reason;
                }
                Ok(decoded)
            }
            Err(e) => match self.policy {
                TailPolicy::Strict => Err(self.malformed(&e)),
                TailPolicy::Tolerant => Ok(self.snapshot()),
            },
        }
    }

    /// Decode the complete body and require a terminal record.
    ///
    /// The last record is decoded strictly whatever the policy.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Malformed` for any unparseable record and
    /// `DecodeError::Truncated` if the body has no terminal record.
    pub fn finish(&mut self, buffer: &str) -> Result<Decoded, DecodeError> {
        let policy = self.policy;
        self.policy = TailPolicy::Strict;
        let result = self.feed(buffer);
        self.policy = policy;

        let decoded = result?;
        if decoded.finished {
            Ok(decoded)
        } else {
            Err(DecodeError::Truncated {
                partial: decoded.content,
            })
        }
    }

    fn parse_tail(&self, tail: &str) -> Result<Record, serde_json::Error> {
        match parse_record(tail) {
            Err(e) if self.policy == TailPolicy::Tolerant => {
                strip_partial_delimiter(tail).map_or(Err(e), parse_record)
            }
            parsed => parsed,
        }
    }

    fn settle(&mut self, record: Record) {
        match record {
            Record::Empty => {}
            Record::Done => {
                self.records += 1;
                self.done = true;
                self.finished = true;
            }
            Record::Chunk {
                content,
                usage,
                finish_reason,
            } => {
                self.records += 1;
                self.settled.push_str(&content);
                if usage.is_some() {
                    self.usage = usage;
                    self.finished = true;
                }
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason;
                }
            }
        }
    }

    fn malformed(&self, error: &serde_json::Error) -> DecodeError {
        DecodeError::Malformed {
            index: self.records,
            reason: error.to_string(),
            partial: self.settled.clone(),
        }
    }

    fn snapshot(&self) -> Decoded {
        Decoded {
            content: self.settled.clone(),
            finished: self.finished,
            usage: self.usage.clone(),
            finish_reason: self.finish_reason.clone(),
        }
    }
}

/// Strip the start of a delimiter that is still arriving, e.g. `"}\n\nda"`.
fn strip_partial_delimiter(tail: &str) -> Option<&str> {
    (1..RECORD_DELIMITER.len())
        .rev()
        .find(|&len| tail.ends_with(&RECORD_DELIMITER[..len]))
        .map(|len| &tail[..tail.len() - len])
}

/// Decode a whole buffer from scratch.
///
/// # Errors
///
/// See [`StreamDecoder::feed`].
pub fn decode(buffer: &str, policy: TailPolicy) -> Result<Decoded, DecodeError> {
    StreamDecoder::new(policy).feed(buffer)
}

// =============================================================================
// StreamState
// =============================================================================

/// Raw bytes of the current request plus the decoder reading them.
///
/// The decoder only sees the longest valid UTF-8 prefix, so a character split
/// across two network chunks is decoded once both halves arrived.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    buffer: Vec<u8>,
    decoder: StreamDecoder,
}

impl StreamState {
    /// Create an empty stream state.
    #[must_use]
    pub fn new(policy: TailPolicy) -> Self {
        Self {
            buffer: Vec::new(),
            decoder: StreamDecoder::new(policy),
        }
    }

    /// Bytes received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing was received yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a terminal record has been seen.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.decoder.is_finished()
    }

    /// Append a network chunk and decode the grown buffer.
    ///
    /// # Errors
    ///
    /// See [`StreamDecoder::feed`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let text = valid_prefix(&self.buffer);
        self.decoder.feed(&text)
    }

    /// Decode the buffer as a complete body.
    ///
    /// # Errors
    ///
    /// See [`StreamDecoder::finish`].
    pub fn finish(&mut self) -> Result<Decoded, DecodeError> {
        let text = String::from_utf8_lossy(&self.buffer);
        self.decoder.finish(&text)
    }
}

fn valid_prefix(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        // Incomplete sequence at the end: wait for the rest of it.
        Err(e) if e.error_len().is_none() => {
            Cow::Borrowed(std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default())
        }
        Err(_) => String::from_utf8_lossy(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    fn hello_there() -> String {
        let mut body = String::new();
        body.push_str(&chunk("Hello"));
        body.push_str(&chunk(" there"));
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn decodes_full_body() {
        let decoded = decode(&hello_there(), TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "Hello there");
        assert!(decoded.finished);
        assert!(decoded.usage.is_none());
    }

    #[test]
    fn records_after_done_are_ignored() {
        let body = format!("{}{}", hello_there(), chunk(" ignored"));
        let decoded = decode(&body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "Hello there");
        assert!(decoded.finished);
    }

    #[test]
    fn usage_record_finishes_but_later_records_count() {
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"!\"}}}}],\"usage\":{{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}}}\n\n{}",
            chunk("Hi"),
            chunk(" more")
        );
        let decoded = decode(&body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "Hi! more");
        assert!(decoded.finished);
        assert_eq!(decoded.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn usage_record_then_done_stops_reading() {
        let body = format!(
            "{}data: {{\"choices\":[],\"usage\":{{\"total_tokens\":4}}}}\n\n{}data: [DONE]\n\n{}",
            chunk("a"),
            chunk("b"),
            chunk("ignored")
        );
        let decoded = decode(&body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "ab");
        assert!(decoded.finished);
        assert_eq!(decoded.usage.unwrap().total_tokens, 4);
    }

    #[test]
    fn incremental_matches_whole_body_across_usage_record() {
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"!\"}}}}],\"usage\":{{\"total_tokens\":5}}}}\n\n{}data: [DONE]\n\n",
            chunk("Hi"),
            chunk(" more")
        );
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);
        for end in (0..=body.len()).filter(|&i| body.is_char_boundary(i)) {
            let prefix = &body[..end];
            assert_eq!(
                decoder.feed(prefix).unwrap(),
                decode(prefix, TailPolicy::Tolerant).unwrap(),
                "prefix {prefix:?}"
            );
        }
        assert_eq!(decoder.feed(&body).unwrap().content, "Hi! more");
    }

    #[test]
    fn finish_reason_is_reported() {
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":{{}},\"finish_reason\":\"stop\"}}]}}\n\ndata: [DONE]\n\n",
            chunk("Hi")
        );
        let decoded = decode(&body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "Hi");
        assert_eq!(decoded.finish_reason.as_deref(), Some("stop"));
        assert!(decode(&hello_there(), TailPolicy::Strict)
            .unwrap()
            .finish_reason
            .is_none());
    }

    #[test]
    fn usage_in_tail_terminates() {
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"!\"}}}}],\"usage\":{{\"total_tokens\":1}}}}",
            chunk("Hi")
        );
        let decoded = decode(&body, TailPolicy::Tolerant).unwrap();
        assert_eq!(decoded.content, "Hi!");
        assert!(decoded.finished);
    }

    #[test]
    fn whitespace_and_empty_records_contribute_nothing() {
        let body = format!("\n\ndata:   \n\ndata:\n{}data:\r\n\r\n", chunk("x"));
        let decoded = decode(&body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "x");
        assert!(!decoded.finished);
    }

    #[test]
    fn missing_delta_content_defaults_to_empty() {
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: {}\n\n";
        let decoded = decode(body, TailPolicy::Strict).unwrap();
        assert_eq!(decoded.content, "");
    }

    #[test]
    fn every_prefix_matches_from_scratch_decode() {
        let body = hello_there();
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);

        for end in 0..=body.len() {
            let prefix = &body[..end];
            let incremental = decoder.feed(prefix).unwrap();
            let scratch = decode(prefix, TailPolicy::Tolerant).unwrap();
            assert_eq!(incremental, scratch, "prefix of {end} bytes");
        }

        assert!(decoder.is_finished());
        assert_eq!(decoder.content(), "Hello there");
    }

    #[test]
    fn tolerant_waits_for_incomplete_tail() {
        let body = format!("{}data: {{\"choices\":[{{\"del", chunk("Hel"));
        let decoded = decode(&body, TailPolicy::Tolerant).unwrap();
        assert_eq!(decoded.content, "Hel");
        assert!(!decoded.finished);
    }

    #[test]
    fn content_does_not_shrink_while_delimiter_arrives() {
        let body = format!("{}{RECORD_DELIMITER}", chunk("Hello"));
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);
        let mut previous = 0;

        for end in 0..=body.len() {
            let decoded = decoder.feed(&body[..end]).unwrap();
            assert!(decoded.content.len() >= previous, "content shrank at {end}");
            previous = decoded.content.len();
        }
        assert_eq!(decoder.content(), "Hello");
    }

    #[test]
    fn strict_rejects_incomplete_tail() {
        let body = format!("{}data: {{\"choices\":[{{\"del", chunk("Hel"));
        let err = decode(&body, TailPolicy::Strict).unwrap_err();
        match err {
            DecodeError::Malformed { index, partial, .. } => {
                assert_eq!(index, 1);
                assert_eq!(partial, "Hel");
            }
            DecodeError::Truncated { .. } => panic!("expected malformed record"),
        }
    }

    #[test]
    fn malformed_settled_record_is_fatal_for_both_policies() {
        let body = format!("{}data: not json\n\n{}", chunk("ok"), chunk("more"));
        for policy in [TailPolicy::Strict, TailPolicy::Tolerant] {
            let err = decode(&body, policy).unwrap_err();
            assert_eq!(err.partial_content(), "ok");
        }
    }

    #[test]
    fn finish_requires_terminal_record() {
        let body = format!("{}{}", chunk("Hello"), chunk(" wor"));
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);
        decoder.feed(&body).unwrap();

        let err = decoder.finish(&body).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                partial: "Hello wor".into()
            }
        );
        assert_eq!(decoder.policy(), TailPolicy::Tolerant);
    }

    #[test]
    fn finish_decodes_tail_strictly() {
        let body = format!("{}data: {{\"cho", chunk("Hello"));
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);
        assert_eq!(decoder.feed(&body).unwrap().content, "Hello");
        assert!(matches!(
            decoder.finish(&body),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn finished_decoder_ignores_more_input() {
        let mut decoder = StreamDecoder::new(TailPolicy::Strict);
        let body = hello_there();
        decoder.feed(&body).unwrap();

        let longer = format!("{body}data: garbage\n\n");
        let decoded = decoder.feed(&longer).unwrap();
        assert_eq!(decoded.content, "Hello there");
        assert!(decoded.finished);
    }

    #[test]
    fn shorter_buffer_restarts() {
        let mut decoder = StreamDecoder::new(TailPolicy::Tolerant);
        decoder.feed(&format!("{}{}", chunk("abc"), chunk("def"))).unwrap();
        let decoded = decoder.feed(&chunk("xy")).unwrap();
        assert_eq!(decoded.content, "xy");
    }

    #[test]
    fn stream_state_handles_split_characters() {
        let body = format!("{}data: [DONE]", chunk("héllo ✓"));
        let bytes = body.as_bytes();
        let mut state = StreamState::new(TailPolicy::Tolerant);

        let mut last = Decoded::default();
        for byte in bytes {
            last = state.push(std::slice::from_ref(byte)).unwrap();
        }

        assert_eq!(state.len(), bytes.len());
        assert!(last.finished);
        assert_eq!(last.content, "héllo ✓");
        assert_eq!(state.finish().unwrap().content, "héllo ✓");
    }

    #[test]
    fn stream_state_truncated_body() {
        let mut state = StreamState::new(TailPolicy::Tolerant);
        assert!(state.is_empty());
        state.push(chunk("partial").as_bytes()).unwrap();
        assert!(!state.is_finished());

        let err = state.finish().unwrap_err();
        assert_eq!(err.partial_content(), "partial");
    }

    #[test]
    fn tail_policy_serde() {
        assert_eq!(
            serde_json::from_str::<TailPolicy>("\"tolerant\"").unwrap(),
            TailPolicy::Tolerant
        );
        assert_eq!(
            serde_json::to_string(&TailPolicy::Strict).unwrap(),
            "\"strict\""
        );
    }
}
