use bytes::{Buf, BytesMut};

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// The `event:` field, or `"message"` if the event did not name itself.
    pub event: String,
    /// All `data:` lines of the event, joined with newlines.
    pub data: String,
}

impl SseEvent {
    #[cfg(test)]
    pub fn new(event: &str, data: &str) -> Self {
        Self {
            event: event.to_string(),
            data: data.to_string(),
        }
    }
}

/// Incremental parser for a `text/event-stream` body.
///
/// Chunks may split lines (or a CRLF pair) anywhere; incomplete input stays buffered until the
/// next call. Comment lines, which the service uses as heartbeats, are discarded.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: BytesMut,
    event_type: Option<String>,
    data_lines: Vec<String>,
    // The previous chunk ended in '\r'; a leading '\n' belongs to that line ending.
    skip_lf: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        if self.skip_lf && !self.buffer.is_empty() {
            if self.buffer[0] == b'\n' {
                self.buffer.advance(1);
            }
            self.skip_lf = false;
        }

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line = self.buffer.split_to(line_end);
            if self.buffer.starts_with(b"\r\n") {
                self.buffer.advance(2);
            } else {
                if self.buffer.len() == 1 && self.buffer[0] == b'\r' {
                    self.skip_lf = true;
                }
                self.buffer.advance(1);
            }

            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if !line.starts_with(':') {
                self.process_field(&line);
            }
        }

        events
    }

    fn process_field(&mut self, line: &str) {
        let (field, value) = match line.find(':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => (),
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event_type = self.event_type.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(SseEvent {
            event: event_type.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn parses_named_event() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"event: put\ndata: {\"path\":\"/\"}\n\n");
        assert_that!(events).is_equal_to(vec![SseEvent::new("put", "{\"path\":\"/\"}")]);
    }

    #[test]
    fn ignores_heartbeat_comments() {
        let mut parser = SseParser::new();
        let events = parser.parse(b":\n\n: heartbeat\n\nevent: delete\ndata: {}\n\n");
        assert_that!(events).is_equal_to(vec![SseEvent::new("delete", "{}")]);
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"event: patch\ndata: line1\ndata: line2\n\n");
        assert_that!(events[0].data.as_str()).is_equal_to("line1\nline2");
    }

    #[test]
    fn unnamed_events_default_to_message() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"data: x\n\n");
        assert_that!(events[0].event.as_str()).is_equal_to("message");
    }

    #[test_case(b"event: put\r\ndata: x\r\n\r\n" ; "crlf")]
    #[test_case(b"event: put\rdata: x\r\r" ; "cr")]
    #[test_case(b"event:put\ndata:x\n\n" ; "no space after colon")]
    fn accepts_all_line_endings(input: &[u8]) {
        let mut parser = SseParser::new();
        assert_that!(parser.parse(input)).is_equal_to(vec![SseEvent::new("put", "x")]);
    }

    #[test]
    fn buffers_partial_input_across_chunks() {
        let mut parser = SseParser::new();
        assert_that!(parser.parse(b"event: pa")).is_empty();
        assert_that!(parser.parse(b"tch\ndata: {\"a\"")).is_empty();
        assert_that!(parser.parse(b":1}\r")).is_empty();
        let events = parser.parse(b"\n\r\n");
        assert_that!(events).is_equal_to(vec![SseEvent::new("patch", "{\"a\":1}")]);
    }

    #[test]
    fn event_name_without_data_is_discarded() {
        let mut parser = SseParser::new();
        let events = parser.parse(b"event: put\n\ndata: y\n\n");
        assert_that!(events).is_equal_to(vec![SseEvent::new("message", "y")]);
    }
}
