//! Incremental parser for the server-sent event stream of a Messages call
//!
//! Bytes go in through [`StreamingParser::feed`] in whatever chunks the
//! network delivers. The parser buffers until it sees a line terminator,
//! handles exactly one frame per line, and folds each event into the
//! in-progress [`ModelResponse`].
//!
//! # Block assembly
//!
//! ```text
//! message_start            -> response skeleton, content cleared
//! content_block_start(i)   -> slots 0..=i allocated, slot i filled
//! content_block_delta(i)   -> text/thinking appended in place,
//!                             tool JSON fragments buffered per index
//! content_block_stop(i)    -> buffered JSON for i parsed into the tool input
//! message_delta            -> stop_reason and usage only
//! message_stop             -> filled slots frozen into the response, parse complete
//! ```
//!
//! A `data:` line whose payload is not valid JSON is skipped. The skip is
//! counted in [`StreamingParser::malformed_frames`] and logged at debug level
//! so a wire-format change shows up in diagnostics without failing the turn.

use crate::types::{ContentBlock, ContentDelta, ModelResponse, StreamEvent, ThinkingBlock};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Stateful SSE parser; reuse across turns with [`reset`](Self::reset)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingParser {
    buffer: Vec<u8>,
    response: ModelResponse,
    blocks: Vec<Option<ContentBlock>>,
    partial_json: HashMap<usize, String>,
    complete: bool,
    error: Option<String>,
    malformed: u64,
}

impl StreamingParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of bytes and returns the events completed by it, in order
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        // the carried-over bytes hold no terminator, so only new bytes are searched
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut search_from = buffer.len();
        buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = buffer[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            if let Some(event) = self.process_line(&buffer[line_start..end]) {
                events.push(event);
            }
            line_start = end + 1;
            search_from = line_start;
        }

        buffer.drain(..line_start);
        self.buffer = buffer;
        events
    }

    /// Processes a trailing line that arrived without a terminator
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(&line).into_iter().collect()
    }

    /// Returns the parser to its freshly constructed state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The assembled response, present only once `message_stop` was seen
    pub fn get_response(&self) -> Option<ModelResponse> {
        self.complete.then(|| self.response.clone())
    }

    /// Moves the assembled response out, leaving the parser incomplete
    pub fn take_response(&mut self) -> Option<ModelResponse> {
        if !self.complete {
            return None;
        }
        self.complete = false;
        Some(std::mem::take(&mut self.response))
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of `data:` lines skipped because they were not valid JSON
    pub fn malformed_frames(&self) -> u64 {
        self.malformed
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);

        // event:, id:, retry:, comments and blank separators carry no payload
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }

        match StreamEvent::parse(data) {
            Ok(event) => {
                self.apply(&event);
                Some(event)
            }
            Err(e) => {
                self.malformed += 1;
                debug!(error = %e, bytes = data.len(), "skipping unparseable stream frame");
                None
            }
        }
    }

    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.response = message.clone();
                self.response.content.clear();
                self.blocks.clear();
                self.partial_json.clear();
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.ensure_slot(*index);
                self.blocks[*index] = Some(content_block.clone());
                if matches!(content_block, ContentBlock::ToolUse(_)) {
                    self.partial_json.insert(*index, String::new());
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.ensure_slot(*index);
                self.apply_delta(*index, delta);
            }
            StreamEvent::ContentBlockStop { index } => {
                self.close_block(*index);
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.response.stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    self.response.usage.merge_delta(usage);
                }
            }
            StreamEvent::MessageStop => {
                self.response.content = self.blocks.iter().flatten().cloned().collect();
                self.complete = true;
            }
            StreamEvent::Error { error } => {
                let message = if error.message.is_empty() {
                    error.kind.clone()
                } else {
                    error.message.clone()
                };
                self.error = Some(message);
            }
            StreamEvent::Ping | StreamEvent::Unknown => {}
        }
    }

    fn apply_delta(&mut self, index: usize, delta: &ContentDelta) {
        let slot = &mut self.blocks[index];
        match delta {
            ContentDelta::TextDelta { text } | ContentDelta::ThinkingDelta { thinking: text } => {
                // a delta for a block that was never started opens one of its kind
                let block = slot.get_or_insert_with(|| match delta {
                    ContentDelta::ThinkingDelta { .. } => {
                        ContentBlock::Thinking(ThinkingBlock::default())
                    }
                    _ => ContentBlock::text(""),
                });
                match block {
                    ContentBlock::Text(b) => b.text.push_str(text),
                    ContentBlock::Thinking(b) => b.thinking.push_str(text),
                    ContentBlock::ToolUse(_) | ContentBlock::ToolResult(_) | ContentBlock::Other(_) => {}
                }
            }
            ContentDelta::InputJsonDelta { partial_json } => {
                self.partial_json
                    .entry(index)
                    .or_default()
                    .push_str(partial_json);
            }
            ContentDelta::SignatureDelta { signature } => {
                if let Some(ContentBlock::Thinking(b)) = slot {
                    b.signature.get_or_insert_with(String::new).push_str(signature);
                }
            }
            ContentDelta::Other => {}
        }
    }

    fn close_block(&mut self, index: usize) {
        let Some(raw) = self.partial_json.remove(&index) else {
            return;
        };
        if let Some(Some(ContentBlock::ToolUse(tool))) = self.blocks.get_mut(index) {
            if raw.trim().is_empty() {
                return;
            }
            tool.input = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        }
    }

    fn ensure_slot(&mut self, index: usize) {
        if self.blocks.len() <= index {
            self.blocks.resize(index + 1, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StopReason;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame(event: &str, data: &str) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    fn hello_stream() -> String {
        [
            frame(
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"m","content":[],"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            ),
            frame(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            frame("ping", r#"{"type":"ping"}"#),
            frame(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            ),
            frame(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            ),
            frame("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            frame(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
            ),
            frame("message_stop", r#"{"type":"message_stop"}"#),
        ]
        .concat()
    }

    #[test]
    fn test_text_deltas_assemble() {
        let mut parser = StreamingParser::new();
        let events = parser.feed(hello_stream().as_bytes());
        parser.finish();

        assert_eq!(events.len(), 8);
        let response = parser.get_response().unwrap();
        assert_eq!(response.id, "msg_1");
        assert_eq!(response.content, vec![ContentBlock::text("Hello")]);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 5);
        assert!(!parser.has_error());
        assert_eq!(parser.malformed_frames(), 0);
    }

    #[test]
    fn test_tool_input_parsed_at_block_stop() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                frame(
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"calc","input":{}}}"#,
                ),
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\": "}}"#,
                ),
            ]
            .concat()
            .as_bytes(),
        );

        // input is untouched until the block closes
        parser.feed(
            frame(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"1}"}}"#,
            )
            .as_bytes(),
        );
        parser.feed(frame("content_block_stop", r#"{"type":"content_block_stop","index":0}"#).as_bytes());
        parser.feed(frame("message_stop", r#"{"type":"message_stop"}"#).as_bytes());

        let response = parser.get_response().unwrap();
        let tool = response.tool_uses().next().unwrap();
        assert_eq!(tool.input, json!({"a": 1}));
    }

    #[test]
    fn test_unparseable_tool_input_kept_as_string() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                frame(
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"calc","input":{}}}"#,
                ),
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\": tru"}}"#,
                ),
                frame("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
                frame("message_stop", r#"{"type":"message_stop"}"#),
            ]
            .concat()
            .as_bytes(),
        );

        let response = parser.get_response().unwrap();
        assert_eq!(
            response.tool_uses().next().unwrap().input,
            Value::String("{\"a\": tru".into())
        );
    }

    #[test]
    fn test_unfilled_slots_are_dropped() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                r#"data: {"type":"content_block_start","index":2,"content_block":{"type":"text","text":"x"}}"#,
                "\n",
                r#"data: {"type":"message_stop"}"#,
                "\n",
            ]
            .concat()
            .as_bytes(),
        );

        let response = parser.get_response().unwrap();
        assert_eq!(response.content, vec![ContentBlock::text("x")]);
    }

    #[test]
    fn test_unmodelled_block_kind_is_kept_verbatim() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                frame(
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"redacted_thinking","data":"EmwKAhgB"}}"#,
                ),
                frame("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
                frame(
                    "content_block_start",
                    r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
                ),
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"hi"}}"#,
                ),
                frame("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
                frame("message_stop", r#"{"type":"message_stop"}"#),
            ]
            .concat()
            .as_bytes(),
        );

        assert_eq!(parser.malformed_frames(), 0);
        let response = parser.get_response().unwrap();
        let redacted = json!({"type": "redacted_thinking", "data": "EmwKAhgB"});
        assert_eq!(
            response.content,
            vec![ContentBlock::Other(redacted.clone()), ContentBlock::text("hi")]
        );
        assert_eq!(response.text(), "hi");

        // replayed to the server exactly as received
        let replayed = serde_json::to_value(&response.content).unwrap();
        assert_eq!(replayed, json!([redacted, {"type": "text", "text": "hi"}]));
    }

    #[test]
    fn test_delta_without_start_opens_block() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":1,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
                ),
                frame("message_stop", r#"{"type":"message_stop"}"#),
            ]
            .concat()
            .as_bytes(),
        );

        assert_eq!(
            parser.get_response().unwrap().content,
            vec![ContentBlock::Thinking(ThinkingBlock {
                thinking: "hmm".into(),
                signature: None,
            })]
        );
    }

    #[test]
    fn test_long_line_across_many_chunks() {
        let text = "x".repeat(20_000);
        let stream = [
            frame(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            frame(
                "content_block_delta",
                &json!({"type": "content_block_delta", "index": 0,
                        "delta": {"type": "text_delta", "text": text}})
                .to_string(),
            ),
            frame("message_stop", r#"{"type":"message_stop"}"#),
        ]
        .concat();

        let mut parser = StreamingParser::new();
        let mut events = 0;
        for chunk in stream.as_bytes().chunks(7) {
            events += parser.feed(chunk).len();
        }

        assert_eq!(events, 3);
        assert_eq!(parser.get_response().unwrap().text(), text);
    }

    #[test]
    fn test_thinking_and_signature_deltas() {
        let mut parser = StreamingParser::new();
        parser.feed(
            [
                frame(
                    "content_block_start",
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
                ),
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
                ),
                frame(
                    "content_block_delta",
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig"}}"#,
                ),
                frame("message_stop", r#"{"type":"message_stop"}"#),
            ]
            .concat()
            .as_bytes(),
        );

        assert_eq!(
            parser.get_response().unwrap().content,
            vec![ContentBlock::Thinking(ThinkingBlock {
                thinking: "hmm".into(),
                signature: Some("sig".into()),
            })]
        );
    }

    #[test]
    fn test_done_marker_and_noise_are_ignored() {
        let mut parser = StreamingParser::new();
        let events = parser.feed(b": keepalive\nevent: ping\nid: 4\ndata:\ndata: [DONE]\n\n");
        assert!(events.is_empty());
        assert!(!parser.has_error());
        assert_eq!(parser.malformed_frames(), 0);
    }

    #[test]
    fn test_malformed_line_is_counted_not_fatal() {
        let mut parser = StreamingParser::new();
        parser.feed(b"data: {\"type\":\"content_blo\n");
        parser.feed(hello_stream().as_bytes());

        assert_eq!(parser.malformed_frames(), 1);
        assert!(!parser.has_error());
        assert_eq!(parser.get_response().unwrap().text(), "Hello");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = StreamingParser::new();
        let stream = hello_stream().replace('\n', "\r\n");
        parser.feed(stream.as_bytes());
        assert_eq!(parser.get_response().unwrap().text(), "Hello");
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut parser = StreamingParser::new();
        parser.feed(b"data: {\"type\":\"message_start\",\"message\":{\"id\":\"m\"}}\n");
        parser.feed(b"data: {\"type\":\"message_stop\"}");
        assert!(parser.get_response().is_none());

        let events = parser.finish();
        assert_eq!(events, vec![StreamEvent::MessageStop]);
        assert!(parser.is_complete());
    }

    #[test]
    fn test_no_message_stop_means_no_response() {
        let mut parser = StreamingParser::new();
        let stream = hello_stream();
        let truncated = &stream[..stream.find("event: message_stop").unwrap()];
        parser.feed(truncated.as_bytes());
        parser.finish();
        assert!(parser.get_response().is_none());
    }

    #[test]
    fn test_error_event_sets_terminal_state() {
        let mut parser = StreamingParser::new();
        parser.feed(
            frame(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .as_bytes(),
        );
        assert!(parser.has_error());
        assert_eq!(parser.error_message(), Some("Overloaded"));

        // further frames are still processed
        parser.feed(hello_stream().as_bytes());
        assert!(parser.has_error());
        assert!(parser.is_complete());
    }

    #[test]
    fn test_reset_matches_fresh_parser() {
        let mut parser = StreamingParser::new();
        parser.feed(b"data: not json\n");
        parser.feed(hello_stream().as_bytes());
        parser.feed(b"data: {\"type\":\"mess");
        parser.reset();

        assert_eq!(parser, StreamingParser::new());
        assert!(parser.get_response().is_none());
        assert!(!parser.has_error());
    }

    #[test]
    fn test_take_response() {
        let mut parser = StreamingParser::new();
        parser.feed(hello_stream().as_bytes());
        assert_eq!(parser.take_response().unwrap().text(), "Hello");
        assert!(parser.take_response().is_none());
    }
}
