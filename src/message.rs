//! Broadcast message wire format and incremental decoder.
//!
//! One message is a block of newline-terminated lines closed by an empty
//! line:
//!
//! ```text
//! example.com\n          <- domain
//! publish_status\n       <- event
//! completed\n            <- data (may span several non-empty lines)
//! \n                     <- terminator
//! ```
//!
//! Producers must never put an empty line inside `data`; [`BroadcastMessage::encode`]
//! drops any it finds.

use crate::constants::{MAX_LINE_LENGTH, MAX_MESSAGE_LENGTH};

/// A framed broadcast: target domain, event name, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    /// Logical namespace the message is addressed to.
    pub domain: String,
    /// Event name subscribers register for.
    pub event: String,
    /// Payload; for command traffic, a serialized command.
    pub data: String,
}

impl BroadcastMessage {
    /// Create a message.
    pub fn new(
        domain: impl Into<String>,
        event: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            event: event.into(),
            data: data.into(),
        }
    }

    /// Parse the lines of one finished message.
    ///
    /// Returns `None` unless there is a non-empty domain and event line.
    /// Lines after the event are joined with `\n` to form the payload.
    pub fn from_lines(lines: &[String]) -> Option<Self> {
        let [domain, event, data @ ..] = lines else {
            return None;
        };
        if domain.is_empty() || event.is_empty() {
            return None;
        }
        Some(Self {
            domain: domain.clone(),
            event: event.clone(),
            data: data.join("\n"),
        })
    }

    /// Encode into wire format, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.domain.len() + self.event.len() + self.data.len() + 4);
        out.push_str(&self.domain);
        out.push('\n');
        out.push_str(&self.event);
        out.push('\n');
        for line in self.data.split('\n').filter(|l| !l.is_empty()) {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.into_bytes()
    }
}

/// Incremental message decoder that handles partial reads.
///
/// Owns the partial-line buffer and the message in progress for a single
/// connection. Feed bytes via [`MessageDecoder::feed`] and collect every
/// message those bytes completed.
///
/// A line longer than [`MAX_LINE_LENGTH`] or a message larger than
/// [`MAX_MESSAGE_LENGTH`] poisons the message in progress: everything up to
/// the next empty line is dropped.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
    pending: Option<Vec<String>>,
    pending_bytes: usize,
    /// Inside an oversized line; skip bytes until its newline.
    discarding: bool,
    /// The message in progress lost content; drop it at its terminator.
    poisoned: bool,
}

impl MessageDecoder {
    /// Create a decoder with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract all completed, valid messages.
    ///
    /// Invalid messages are dropped; incomplete data is kept for the next
    /// call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<BroadcastMessage> {
        let mut messages = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                // Tail end of an oversized line.
                self.discarding = false;
                continue;
            }
            if self.buf.len() + head.len() > MAX_LINE_LENGTH {
                self.discard_line();
                self.discarding = false;
                continue;
            }

            self.buf.extend_from_slice(head);
            let mut raw = std::mem::take(&mut self.buf);
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(message) = self.receive_line(line) {
                messages.push(message);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_LINE_LENGTH {
                self.discard_line();
            }
        }

        messages
    }

    /// Handle one complete line (without its newline).
    ///
    /// An empty line finalizes the message in progress, if any; the
    /// accumulator is cleared whether or not the message was valid.
    pub fn receive_line(&mut self, line: String) -> Option<BroadcastMessage> {
        if line.is_empty() {
            let lines = self.pending.take();
            self.pending_bytes = 0;
            if std::mem::take(&mut self.poisoned) {
                log::debug!("[Framing] Dropping message with discarded content");
                return None;
            }
            let lines = lines?;
            let message = BroadcastMessage::from_lines(&lines);
            if message.is_none() {
                log::debug!("[Framing] Dropping malformed message ({} lines)", lines.len());
            }
            return message;
        }
        if self.poisoned {
            return None;
        }

        self.pending_bytes += line.len() + 1;
        if self.pending_bytes > MAX_MESSAGE_LENGTH {
            log::warn!("[Framing] Discarding message larger than {MAX_MESSAGE_LENGTH} bytes");
            self.poison();
            return None;
        }
        self.pending.get_or_insert_with(Vec::new).push(line);
        None
    }

    /// Returns true if a partial line or message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.pending.is_some() || self.discarding || self.poisoned
    }

    fn discard_line(&mut self) {
        log::warn!("[Framing] Discarding line longer than {MAX_LINE_LENGTH} bytes");
        self.buf.clear();
        self.discarding = true;
        self.poison();
    }

    fn poison(&mut self) {
        self.pending = None;
        self.pending_bytes = 0;
        self.poisoned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message() {
        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(b"domain1\na\ndata\n\n");
        assert_eq!(messages, vec![BroadcastMessage::new("domain1", "a", "data")]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_encode_matches_wire_format() {
        let message = BroadcastMessage::new("example.com", "publish_status", "completed");
        assert_eq!(message.encode(), b"example.com\npublish_status\ncompleted\n\n".to_vec());
    }

    #[test]
    fn test_multiline_payload() {
        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(b"d\ne\nline one\nline two\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "line one\nline two");
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let message = BroadcastMessage::new("d", "ping", "");
        let mut decoder = MessageDecoder::new();
        assert_eq!(decoder.feed(&message.encode()), vec![message]);
    }

    #[test]
    fn test_encode_drops_blank_lines_in_payload() {
        let message = BroadcastMessage::new("d", "e", "a\n\nb");
        let mut decoder = MessageDecoder::new();
        let decoded = decoder.feed(&message.encode());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].data, "a\nb");
    }

    #[test]
    fn test_malformed_message_dropped_and_decoder_recovers() {
        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(b"only-domain\n\nd\ne\nx\n\n");
        assert_eq!(messages, vec![BroadcastMessage::new("d", "e", "x")]);
    }

    #[test]
    fn test_stray_blank_lines_ignored() {
        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(b"\n\n\nd\ne\nx\n\n\n");
        assert_eq!(messages.len(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_messages_in_single_feed_keep_order() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BroadcastMessage::new("d", "first", "1").encode());
        buf.extend_from_slice(&BroadcastMessage::new("d", "second", "2").encode());
        buf.extend_from_slice(&BroadcastMessage::new("d", "third", "3").encode());

        let mut decoder = MessageDecoder::new();
        let events: Vec<String> = decoder.feed(&buf).into_iter().map(|m| m.event).collect();
        assert_eq!(events, ["first", "second", "third"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let message = BroadcastMessage::new("domain", "event", "payload");
        let encoded = message.encode();

        let mut decoder = MessageDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let messages = decoder.feed(&[*byte]);
            if i < encoded.len() - 1 {
                assert!(messages.is_empty());
            } else {
                assert_eq!(messages, vec![message.clone()]);
            }
        }
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = MessageDecoder::new();
        let messages = decoder.feed(b"d\r\ne\r\nx\r\n\r\n");
        assert_eq!(messages, vec![BroadcastMessage::new("d", "e", "x")]);
    }

    #[test]
    fn test_oversized_line_discarded() {
        let mut decoder = MessageDecoder::new();
        let long = vec![b'x'; MAX_LINE_LENGTH + 10];
        assert!(decoder.feed(&long).is_empty());
        assert!(decoder.feed(b"more\n").is_empty());
        assert!(decoder.feed(b"\n").is_empty());
        assert!(!decoder.has_partial());

        let messages = decoder.feed(b"d\ne\nok\n\n");
        assert_eq!(messages, vec![BroadcastMessage::new("d", "e", "ok")]);
    }

    #[test]
    fn test_oversized_domain_drops_whole_message() {
        let mut wire = vec![b'd'; MAX_LINE_LENGTH + 10];
        wire.extend_from_slice(b"\nevent\npayload\n\n");

        // Whole line in one read.
        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(&wire).is_empty());
        assert!(!decoder.has_partial());

        // Same bytes split across socket-sized reads.
        let mut decoder = MessageDecoder::new();
        for chunk in wire.chunks(crate::constants::READ_BUFFER_SIZE) {
            assert!(decoder.feed(chunk).is_empty());
        }
        assert!(!decoder.has_partial());

        let messages = decoder.feed(b"d\ne\nok\n\n");
        assert_eq!(messages, vec![BroadcastMessage::new("d", "e", "ok")]);
    }

    #[test]
    fn test_oversized_payload_line_drops_whole_message() {
        let mut wire = b"d\ne\n".to_vec();
        wire.extend(vec![b'x'; MAX_LINE_LENGTH + 1]);
        wire.extend_from_slice(b"\nshort\n\n");

        let mut decoder = MessageDecoder::new();
        assert!(decoder.feed(&wire).is_empty());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_unterminated_message_is_capped() {
        let line = vec![b'x'; 1023];
        let mut decoder = MessageDecoder::new();
        for _ in 0..(MAX_MESSAGE_LENGTH / 1024 + 10) {
            let mut chunk = line.clone();
            chunk.push(b'\n');
            assert!(decoder.feed(&chunk).is_empty());
        }
        assert!(decoder.pending.is_none());
        assert!(decoder.pending_bytes <= MAX_MESSAGE_LENGTH);

        assert!(decoder.feed(b"\n").is_empty());
        let messages = decoder.feed(b"d\ne\nok\n\n");
        assert_eq!(messages, vec![BroadcastMessage::new("d", "e", "ok")]);
    }
}
